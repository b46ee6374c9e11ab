//! Unhandled-failure tracking.
//!
//! A future that is rejected while nobody has registered a continuation on
//! it becomes a candidate. Any registration counts: one without a failure
//! branch forwards the failure to its derived future, which then carries
//! the obligation instead. So in a chain only the last future can be
//! reported. Candidates are only examined at the end of a full drain, so a
//! registration made by any job in that drain still suppresses the report.
//! Each future is reported at most once. Registering on an already
//! reported future yields a single `HandledLate` notice; the earlier report
//! stands.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_MAX_NOTICE_HISTORY;
use crate::future::{ExecutionState, FutureHandle, FutureStore};
use crate::value::Value;

/// Notification delivered to the runtime's failure hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureNotice {
    /// A rejected future had no continuation when the queue drained.
    Unhandled { future: FutureHandle, reason: Value },
    /// A continuation was registered after the `Unhandled` report.
    HandledLate { future: FutureHandle },
}

impl FailureNotice {
    pub fn future(&self) -> FutureHandle {
        match self {
            Self::Unhandled { future, .. } | Self::HandledLate { future } => *future,
        }
    }
}

/// Per-runtime failure tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnhandledFailureTracker {
    /// Rejected-while-unobserved since the last scan, in rejection order.
    candidates: Vec<FutureHandle>,
    /// Reported and not yet handled late. Only these can still produce a
    /// `HandledLate` notice.
    reported: BTreeSet<FutureHandle>,
    /// Late notices waiting for the end of the next drain.
    pending_late: Vec<FailureNotice>,
    /// Most recent delivered notices, oldest first.
    history: VecDeque<FailureNotice>,
    history_capacity: usize,
    delivered: u64,
}

impl Default for UnhandledFailureTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_NOTICE_HISTORY)
    }
}

impl UnhandledFailureTracker {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            candidates: Vec::new(),
            reported: BTreeSet::new(),
            pending_late: Vec::new(),
            history: VecDeque::new(),
            history_capacity: history_capacity.max(1),
            delivered: 0,
        }
    }

    /// Called when `future` is rejected while unobserved.
    pub fn note_rejection(&mut self, future: FutureHandle) {
        self.candidates.push(future);
    }

    /// Called on the first registration on `future`. Returns `true` if this
    /// produced a late-handling notice.
    pub fn note_observed(&mut self, future: FutureHandle) -> bool {
        if self.reported.remove(&future) {
            self.pending_late
                .push(FailureNotice::HandledLate { future });
            return true;
        }
        false
    }

    /// Whether `future` is waiting for the next scan.
    pub fn is_candidate(&self, future: FutureHandle) -> bool {
        self.candidates.contains(&future)
    }

    /// Drop bookkeeping for a future that no longer exists.
    pub fn forget(&mut self, future: FutureHandle) {
        self.reported.remove(&future);
        self.candidates.retain(|candidate| *candidate != future);
    }

    /// End-of-drain scan. Returns the notices to deliver, late notices first.
    pub fn scan(&mut self, store: &FutureStore) -> Vec<FailureNotice> {
        let mut notices = std::mem::take(&mut self.pending_late);
        for future in std::mem::take(&mut self.candidates) {
            let Ok(record) = store.get(future) else {
                continue;
            };
            if record.observed {
                continue;
            }
            if let ExecutionState::Rejected(reason) = &record.state
                && self.reported.insert(future)
            {
                notices.push(FailureNotice::Unhandled {
                    future,
                    reason: reason.clone(),
                });
            }
        }
        for notice in &notices {
            if self.history.len() == self.history_capacity {
                self.history.pop_front();
            }
            self.history.push_back(notice.clone());
        }
        self.delivered += notices.len() as u64;
        notices
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Reported and still eligible for a `HandledLate` notice.
    pub fn is_reported(&self, future: FutureHandle) -> bool {
        self.reported.contains(&future)
    }

    pub fn reported_count(&self) -> usize {
        self.reported.len()
    }

    pub fn history(&self) -> Vec<FailureNotice> {
        self.history.iter().cloned().collect()
    }

    /// Notices ever delivered, including those evicted from the history.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
