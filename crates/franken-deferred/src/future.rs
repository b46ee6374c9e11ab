//! Future state machine and its handle-addressed store.
//!
//! A future starts `Pending` and transitions exactly once to `Fulfilled` or
//! `Rejected`. While pending it accumulates [`ReactionRecord`]s in
//! registration order; on settlement every record is turned into a job on
//! the [`DeferredQueue`] and the list is cleared. Registering on an already
//! settled future enqueues the job directly; nothing here ever invokes a
//! continuation.
//!
//! Records live in a map keyed by handle. Handles are issued from a
//! monotonically increasing counter and never reused, so a stale handle to a
//! reclaimed record is always an `InvalidHandle` error and never names a
//! different future. A record is reclaimable once it is settled and the host
//! has released it; see [`FutureStore::reclaim`].
//!
//! The store only moves data. Invoking continuations, chaining to other
//! deferred values and failure tracking live in `runtime` and `resolution`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::continuation::ContinuationHandle;
use crate::deferred_queue::{DeferredQueue, Job};
use crate::resolution::ForeignHandle;
use crate::value::Value;
use crate::witness::{WitnessEvent, WitnessLog};

// ---------------------------------------------------------------------------
// FutureHandle
// ---------------------------------------------------------------------------

/// Opaque identifier of a future in a [`FutureStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FutureHandle(pub u64);

impl fmt::Display for FutureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Future({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ExecutionState
// ---------------------------------------------------------------------------

/// Lifecycle of one deferred value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

impl ExecutionState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Payload of a settled future.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Pending => None,
            Self::Fulfilled(value) | Self::Rejected(value) => Some(value),
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Fulfilled(_) => f.write_str("fulfilled"),
            Self::Rejected(_) => f.write_str("rejected"),
        }
    }
}

// ---------------------------------------------------------------------------
// Reactions
// ---------------------------------------------------------------------------

/// Which branch of a reaction record a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ReactionKind {
    Success,
    Failure,
}

/// Continuation pair waiting on a pending future, plus the derived future
/// settled by whichever branch runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRecord {
    pub on_success: Option<ContinuationHandle>,
    pub on_failure: Option<ContinuationHandle>,
    pub derived: FutureHandle,
}

impl ReactionRecord {
    /// Split into the job for `kind` and the continuation that will never run.
    fn into_job(self, kind: ReactionKind, argument: Value) -> (Job, Option<ContinuationHandle>) {
        let (handler, discarded) = match kind {
            ReactionKind::Success => (self.on_success, self.on_failure),
            ReactionKind::Failure => (self.on_failure, self.on_success),
        };
        let job = Job::Reaction {
            handler,
            kind,
            argument,
            derived: self.derived,
        };
        (job, discarded)
    }
}

// ---------------------------------------------------------------------------
// FutureRecord
// ---------------------------------------------------------------------------

/// Internal record for a single future.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FutureRecord {
    pub handle: FutureHandle,
    pub state: ExecutionState,
    /// Only non-empty while `Pending`.
    pub reactions: Vec<ReactionRecord>,
    /// Some continuation pair has been registered on this future. A
    /// registration without a failure branch still forwards failures to its
    /// derived future, so any registration takes responsibility for them.
    pub observed: bool,
    /// The host may still use this handle. Cleared by `release`.
    pub retained: bool,
    pub creation_seq: u64,
}

// ---------------------------------------------------------------------------
// FutureError
// ---------------------------------------------------------------------------

/// Errors from store and runtime operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FutureError {
    /// Handle does not name a live future in this store.
    InvalidHandle { handle: FutureHandle },
    /// Settle attempted on a future that is no longer pending.
    AlreadySettled { handle: FutureHandle },
    /// Continuation handle is unknown or was already consumed.
    UnknownContinuation { handle: ContinuationHandle },
    /// One continuation was passed as both branches of a registration.
    DuplicateContinuation { handle: ContinuationHandle },
    /// Foreign handle is not registered with the runtime.
    UnknownForeign { handle: ForeignHandle },
    /// Every future handle has been issued.
    HandleSpaceExhausted,
}

impl fmt::Display for FutureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHandle { handle } => write!(f, "invalid future handle: {handle}"),
            Self::AlreadySettled { handle } => write!(f, "{handle} is already settled"),
            Self::UnknownContinuation { handle } => {
                write!(f, "unknown or consumed continuation: {handle}")
            }
            Self::DuplicateContinuation { handle } => {
                write!(f, "{handle} passed as both success and failure continuation")
            }
            Self::UnknownForeign { handle } => write!(f, "unknown foreign future: {handle}"),
            Self::HandleSpaceExhausted => f.write_str("future handle space exhausted"),
        }
    }
}

impl std::error::Error for FutureError {}

/// Stable error codes.
pub fn error_code(err: &FutureError) -> &'static str {
    match err {
        FutureError::InvalidHandle { .. } => "FD_INVALID_HANDLE",
        FutureError::AlreadySettled { .. } => "FD_ALREADY_SETTLED",
        FutureError::UnknownContinuation { .. } => "FD_UNKNOWN_CONTINUATION",
        FutureError::DuplicateContinuation { .. } => "FD_DUPLICATE_CONTINUATION",
        FutureError::UnknownForeign { .. } => "FD_UNKNOWN_FOREIGN",
        FutureError::HandleSpaceExhausted => "FD_HANDLE_SPACE_EXHAUSTED",
    }
}

// ---------------------------------------------------------------------------
// Settlement / Registration summaries
// ---------------------------------------------------------------------------

/// What a settle call did to the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settlement {
    /// Reaction jobs moved onto the queue.
    pub jobs_scheduled: usize,
    /// Continuations of the branch that was not chosen; the caller drops them.
    pub discarded: Vec<ContinuationHandle>,
}

/// What a register call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub derived: FutureHandle,
    /// Set when the receiver was already settled and a job was enqueued.
    pub scheduled: bool,
    pub discarded: Option<ContinuationHandle>,
    /// This was the first registration on the receiver.
    pub newly_observed: bool,
}

// ---------------------------------------------------------------------------
// FutureStore
// ---------------------------------------------------------------------------

/// Live future records addressed by [`FutureHandle`].
#[derive(Debug, Clone, Default)]
pub struct FutureStore {
    records: BTreeMap<FutureHandle, FutureRecord>,
    next_id: u64,
    reclaimed: u64,
}

impl FutureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending future, retained by the host.
    pub fn create(&mut self, witness: &mut WitnessLog) -> Result<FutureHandle, FutureError> {
        let seq = self.next_id;
        self.next_id = seq
            .checked_add(1)
            .ok_or(FutureError::HandleSpaceExhausted)?;
        let handle = FutureHandle(seq);
        self.records.insert(
            handle,
            FutureRecord {
                handle,
                state: ExecutionState::Pending,
                reactions: Vec::new(),
                observed: false,
                retained: true,
                creation_seq: seq,
            },
        );
        witness.record(WitnessEvent::FutureCreated { handle, seq });
        Ok(handle)
    }

    pub fn get(&self, handle: FutureHandle) -> Result<&FutureRecord, FutureError> {
        self.records
            .get(&handle)
            .ok_or(FutureError::InvalidHandle { handle })
    }

    fn get_mut(&mut self, handle: FutureHandle) -> Result<&mut FutureRecord, FutureError> {
        self.records
            .get_mut(&handle)
            .ok_or(FutureError::InvalidHandle { handle })
    }

    pub fn contains(&self, handle: FutureHandle) -> bool {
        self.records.contains_key(&handle)
    }

    /// Transition to `Fulfilled(value)` and schedule the success branch of
    /// every queued reaction. No chaining detection happens here.
    pub fn fulfill(
        &mut self,
        handle: FutureHandle,
        value: Value,
        queue: &mut DeferredQueue,
        witness: &mut WitnessLog,
    ) -> Result<Settlement, FutureError> {
        self.settle(handle, ReactionKind::Success, value, queue, witness)
    }

    /// Transition to `Rejected(reason)` and schedule the failure branch of
    /// every queued reaction.
    pub fn reject(
        &mut self,
        handle: FutureHandle,
        reason: Value,
        queue: &mut DeferredQueue,
        witness: &mut WitnessLog,
    ) -> Result<Settlement, FutureError> {
        self.settle(handle, ReactionKind::Failure, reason, queue, witness)
    }

    fn settle(
        &mut self,
        handle: FutureHandle,
        kind: ReactionKind,
        payload: Value,
        queue: &mut DeferredQueue,
        witness: &mut WitnessLog,
    ) -> Result<Settlement, FutureError> {
        let record = self.get_mut(handle)?;
        if record.state.is_settled() {
            return Err(FutureError::AlreadySettled { handle });
        }
        record.state = match kind {
            ReactionKind::Success => ExecutionState::Fulfilled(payload.clone()),
            ReactionKind::Failure => ExecutionState::Rejected(payload.clone()),
        };
        let reactions = std::mem::take(&mut record.reactions);
        witness.record(match kind {
            ReactionKind::Success => WitnessEvent::FutureFulfilled {
                handle,
                value: payload.clone(),
            },
            ReactionKind::Failure => WitnessEvent::FutureRejected {
                handle,
                reason: payload.clone(),
            },
        });

        let mut settlement = Settlement::default();
        for reaction in reactions {
            let (job, discarded) = reaction.into_job(kind, payload.clone());
            queue.enqueue(job, witness);
            settlement.jobs_scheduled += 1;
            settlement.discarded.extend(discarded);
        }
        Ok(settlement)
    }

    /// Register a continuation pair and return the derived future.
    ///
    /// Pending receiver: the record is appended. Settled receiver: the
    /// matching branch is enqueued right away. Either way the receiver is
    /// observed from now on.
    pub fn register(
        &mut self,
        handle: FutureHandle,
        on_success: Option<ContinuationHandle>,
        on_failure: Option<ContinuationHandle>,
        queue: &mut DeferredQueue,
        witness: &mut WitnessLog,
    ) -> Result<Registration, FutureError> {
        // Validate before allocating the derived future.
        self.get(handle)?;
        let derived = self.create(witness)?;
        let record = self.get_mut(handle)?;

        let newly_observed = !record.observed;
        record.observed = true;

        let reaction = ReactionRecord {
            on_success,
            on_failure,
            derived,
        };
        let (scheduled, discarded) = match &record.state {
            ExecutionState::Pending => {
                record.reactions.push(reaction);
                (false, None)
            }
            ExecutionState::Fulfilled(value) => {
                let (job, discarded) = reaction.into_job(ReactionKind::Success, value.clone());
                queue.enqueue(job, witness);
                (true, discarded)
            }
            ExecutionState::Rejected(reason) => {
                let (job, discarded) = reaction.into_job(ReactionKind::Failure, reason.clone());
                queue.enqueue(job, witness);
                (true, discarded)
            }
        };

        Ok(Registration {
            derived,
            scheduled,
            discarded,
            newly_observed,
        })
    }

    /// Mark a future as observed without registering a reaction.
    pub fn mark_observed(&mut self, handle: FutureHandle) -> Result<bool, FutureError> {
        let record = self.get_mut(handle)?;
        let newly = !record.observed;
        record.observed = true;
        Ok(newly)
    }

    /// Drop the host's hold on `handle`. Returns `false` if it was already
    /// released.
    pub fn release(&mut self, handle: FutureHandle) -> Result<bool, FutureError> {
        let record = self.get_mut(handle)?;
        Ok(std::mem::replace(&mut record.retained, false))
    }

    /// Remove every settled, released record for which `pinned` is false.
    /// Returns the removed handles in handle order.
    ///
    /// Callers must ensure no queued job still names a removed future.
    pub fn reclaim<P>(&mut self, pinned: P, witness: &mut WitnessLog) -> Vec<FutureHandle>
    where
        P: Fn(FutureHandle) -> bool,
    {
        let doomed: Vec<FutureHandle> = self
            .records
            .values()
            .filter(|r| !r.retained && r.state.is_settled() && !pinned(r.handle))
            .map(|r| r.handle)
            .collect();
        for handle in &doomed {
            self.records.remove(handle);
            witness.record(WitnessEvent::FutureReclaimed { handle: *handle });
        }
        self.reclaimed += doomed.len() as u64;
        doomed
    }

    /// Rejected futures that nobody has registered a continuation on.
    pub fn unhandled_rejections(&self) -> Vec<FutureHandle> {
        self.records
            .values()
            .filter(|r| r.state.is_rejected() && !r.observed)
            .map(|r| r.handle)
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| !r.state.is_settled())
            .count()
    }

    /// Live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Handles issued so far, including reclaimed ones.
    pub fn total_created(&self) -> u64 {
        self.next_id
    }

    pub fn total_reclaimed(&self) -> u64 {
        self.reclaimed
    }

    #[cfg(test)]
    fn starting_at(next_id: u64) -> Self {
        Self {
            next_id,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
