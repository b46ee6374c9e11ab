//! FIFO job queue drained by the cooperative scheduler.
//!
//! Jobs are plain data: which continuation to call, with which argument,
//! and which derived future its completion settles. Insertion order is run
//! order. The queue itself never runs anything; `Runtime::drain` pops jobs
//! and executes them one at a time, so no job ever observes another job
//! half-way through.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::continuation::ContinuationHandle;
use crate::future::{FutureHandle, ReactionKind};
use crate::value::Value;
use crate::witness::{WitnessEvent, WitnessLog};

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Job {
    /// Run the chosen branch of a reaction record against a settled payload.
    /// A `None` handler passes the payload through to `derived` unchanged.
    Reaction {
        handler: Option<ContinuationHandle>,
        kind: ReactionKind,
        argument: Value,
        derived: FutureHandle,
    },
    /// Adopt the outcome of a deferred-compatible value into `future`.
    ResolveThenable { future: FutureHandle, thenable: Value },
    /// A free-standing callback enqueued by host code.
    Task { callback: ContinuationHandle },
}

impl Job {
    /// Short name used in structured events.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Reaction {
                kind: ReactionKind::Success,
                ..
            } => "reaction_success",
            Self::Reaction {
                kind: ReactionKind::Failure,
                ..
            } => "reaction_failure",
            Self::ResolveThenable { .. } => "resolve_thenable",
            Self::Task { .. } => "task",
        }
    }
}

// ---------------------------------------------------------------------------
// DeferredQueue
// ---------------------------------------------------------------------------

/// FIFO queue of pending jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeferredQueue {
    jobs: VecDeque<Job>,
    total_enqueued: u64,
    total_dequeued: u64,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job. Returns its run index (0-based, monotonically increasing).
    pub fn enqueue(&mut self, job: Job, witness: &mut WitnessLog) -> u64 {
        let index = self.total_enqueued;
        self.jobs.push_back(job);
        self.total_enqueued += 1;
        witness.record(WitnessEvent::JobEnqueued { index });
        index
    }

    /// Pop the oldest job.
    pub fn dequeue(&mut self, witness: &mut WitnessLog) -> Option<Job> {
        let job = self.jobs.pop_front()?;
        let index = self.total_dequeued;
        self.total_dequeued += 1;
        witness.record(WitnessEvent::JobDequeued { index });
        Some(job)
    }

    /// Look at the next job without removing it.
    pub fn peek(&self) -> Option<&Job> {
        self.jobs.front()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn total_enqueued(&self) -> u64 {
        self.total_enqueued
    }

    pub fn total_dequeued(&self) -> u64 {
        self.total_dequeued
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn task(n: u64) -> Job {
        Job::Task {
            callback: ContinuationHandle(n),
        }
    }

    #[test]
    fn new_queue_is_empty() {
        let queue = DeferredQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.total_enqueued(), 0);
        assert!(queue.peek().is_none());
    }

    #[test]
    fn fifo_ordering() {
        let mut queue = DeferredQueue::new();
        let mut witness = WitnessLog::default();
        for i in 0..5 {
            assert_eq!(queue.enqueue(task(i), &mut witness), u64::from(i));
        }
        assert_eq!(queue.pending_count(), 5);
        for i in 0..5 {
            assert_eq!(queue.dequeue(&mut witness), Some(task(i)));
        }
        assert!(queue.dequeue(&mut witness).is_none());
        assert_eq!(queue.total_dequeued(), 5);
    }

    #[test]
    fn enqueue_while_draining_runs_after_existing_jobs() {
        let mut queue = DeferredQueue::new();
        let mut witness = WitnessLog::default();
        queue.enqueue(task(0), &mut witness);
        queue.enqueue(task(1), &mut witness);
        assert_eq!(queue.dequeue(&mut witness), Some(task(0)));
        queue.enqueue(task(2), &mut witness);
        assert_eq!(queue.dequeue(&mut witness), Some(task(1)));
        assert_eq!(queue.dequeue(&mut witness), Some(task(2)));
    }

    #[test]
    fn witness_records_enqueue_and_dequeue_indices() {
        let mut queue = DeferredQueue::new();
        let mut witness = WitnessLog::default();
        queue.enqueue(task(0), &mut witness);
        queue.dequeue(&mut witness);
        let log = witness.to_vec();
        assert_eq!(log.len(), 2);
        assert!(matches!(log[0], WitnessEvent::JobEnqueued { index: 0 }));
        assert!(matches!(log[1], WitnessEvent::JobDequeued { index: 0 }));
    }

    #[test]
    fn dequeue_on_empty_records_nothing() {
        let mut queue = DeferredQueue::new();
        let mut witness = WitnessLog::default();
        assert!(queue.dequeue(&mut witness).is_none());
        assert!(witness.is_empty());
    }

    #[test]
    fn job_kind_names() {
        let reaction = Job::Reaction {
            handler: None,
            kind: ReactionKind::Failure,
            argument: Value::Null,
            derived: FutureHandle(0),
        };
        assert_eq!(reaction.kind_name(), "reaction_failure");
        let thenable = Job::ResolveThenable {
            future: FutureHandle(0),
            thenable: Value::Future(FutureHandle(1)),
        };
        assert_eq!(thenable.kind_name(), "resolve_thenable");
        assert_eq!(task(0).kind_name(), "task");
    }

    #[test]
    fn serde_queue_roundtrip() {
        let mut queue = DeferredQueue::new();
        queue.enqueue(
            Job::Reaction {
                handler: Some(ContinuationHandle(3)),
                kind: ReactionKind::Success,
                argument: Value::Int(7),
                derived: FutureHandle(1),
            },
            &mut WitnessLog::default(),
        );
        let json = serde_json::to_string(&queue).expect("serialize");
        let back: DeferredQueue = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.pending_count(), 1);
        assert_eq!(back.peek(), queue.peek());
    }
}
