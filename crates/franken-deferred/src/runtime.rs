//! Runtime context: owns every future, queued job, continuation and
//! tracker for one single-threaded scheduling domain.
//!
//! Nothing here is global. A host builds a [`Runtime`], creates futures and
//! registers continuations through it, and calls [`Runtime::drain`] after
//! each unit of synchronous work. Continuations never run inside the call
//! that registers them; they only run from `drain`.
//!
//! Every handle the runtime returns is held by the host until it calls
//! [`Runtime::release`]. A complete drain ends by reclaiming futures that
//! are settled and released. Futures the runtime creates for its own
//! bookkeeping are never held by the host, so they go away on their own.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, RuntimeConfig};
use crate::continuation::{Completion, ContinuationHandle, ContinuationStore};
use crate::deferred_queue::{DeferredQueue, Job};
use crate::event_log::{EventLog, RuntimeEvent};
use crate::future::{
    ExecutionState, FutureError, FutureHandle, FutureStore, ReactionKind, error_code,
};
use crate::host_timer::TimerQueue;
use crate::resolution::{ForeignRegistry, Resolvers};
use crate::unhandled::{FailureNotice, UnhandledFailureTracker};
use crate::value::{ErrorValue, Value};
use crate::witness::WitnessLog;

/// Callback receiving unhandled-failure notifications.
pub type FailureHook = Box<dyn FnMut(&FailureNotice)>;

// ---------------------------------------------------------------------------
// DrainReport
// ---------------------------------------------------------------------------

/// Outcome of one [`Runtime::drain`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub jobs_run: u64,
    /// Notices delivered at the end of this drain.
    pub notices: Vec<FailureNotice>,
    /// Errors raised by free-standing tasks. They settle no future.
    pub job_failures: Vec<Value>,
    /// The per-drain job budget ran out with jobs still queued.
    pub budget_exhausted: bool,
    /// Futures reclaimed at the end of this drain.
    pub reclaimed: u64,
}

impl DrainReport {
    pub(crate) fn absorb(&mut self, other: DrainReport) {
        self.jobs_run += other.jobs_run;
        self.notices.extend(other.notices);
        self.job_failures.extend(other.job_failures);
        self.budget_exhausted |= other.budget_exhausted;
        self.reclaimed += other.reclaimed;
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub struct Runtime {
    config: RuntimeConfig,
    pub(crate) store: FutureStore,
    pub(crate) queue: DeferredQueue,
    pub(crate) continuations: ContinuationStore,
    pub(crate) foreign: ForeignRegistry,
    tracker: UnhandledFailureTracker,
    pub(crate) timers: TimerQueue,
    pub(crate) events: EventLog,
    pub(crate) witness: WitnessLog,
    failure_hook: Option<FailureHook>,
    draining: bool,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("trace_id", &self.config.trace_id)
            .field("futures", &self.store.len())
            .field("queued_jobs", &self.queue.pending_count())
            .field("live_continuations", &self.continuations.len())
            .field("timers", &self.timers.len())
            .field("witness_events", &self.witness.recorded())
            .field("has_failure_hook", &self.failure_hook.is_some())
            .finish()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::build(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: RuntimeConfig) -> Self {
        let events = EventLog::new(config.trace_id.clone(), config.max_buffered_events);
        Self {
            store: FutureStore::new(),
            queue: DeferredQueue::new(),
            continuations: ContinuationStore::new(),
            foreign: ForeignRegistry::new(),
            tracker: UnhandledFailureTracker::new(config.max_notice_history),
            timers: TimerQueue::new(),
            events,
            witness: WitnessLog::new(config.max_witness_events),
            failure_hook: None,
            draining: false,
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // -- creation ----------------------------------------------------------

    /// Create a future and run `executor` synchronously with its resolvers.
    /// An `Err` from the executor rejects the future unless it already
    /// called one of the resolvers.
    pub fn new_future<F>(&mut self, executor: F) -> Result<FutureHandle, FutureError>
    where
        F: FnOnce(&mut Runtime, Resolvers) -> Result<(), Value>,
    {
        let (future, resolvers) = self.pending()?;
        if let Err(reason) = executor(self, resolvers.clone())
            && !resolvers.reject(self, reason)
        {
            self.events.emit(
                "future",
                "executor_error_ignored",
                "already_resolved",
                Some(future),
                None,
            );
        }
        Ok(future)
    }

    /// A pending future plus the resolvers that settle it.
    pub fn pending(&mut self) -> Result<(FutureHandle, Resolvers), FutureError> {
        let future = self.store.create(&mut self.witness).inspect_err(|err| {
            self.events
                .emit("future", "create_failed", "failed", None, Some(error_code(err)));
        })?;
        self.events
            .emit("future", "future_created", "pending", Some(future), None);
        Ok((future, Resolvers::new(future)))
    }

    /// A future resolved with `value`. A live native future handle is
    /// returned as-is; any other deferred value is adopted.
    pub fn resolved(&mut self, value: Value) -> Result<FutureHandle, FutureError> {
        if let Value::Future(existing) = value
            && self.store.contains(existing)
        {
            return Ok(existing);
        }
        let (future, resolvers) = self.pending()?;
        resolvers.fulfill(self, value);
        Ok(future)
    }

    /// A future already rejected with `reason`.
    pub fn rejected(&mut self, reason: Value) -> Result<FutureHandle, FutureError> {
        let (future, resolvers) = self.pending()?;
        resolvers.reject(self, reason);
        Ok(future)
    }

    /// Like [`Runtime::resolved`], but a newly created future is not held by
    /// the host.
    pub(crate) fn internal_source(&mut self, value: Value) -> Result<FutureHandle, FutureError> {
        if let Value::Future(existing) = value
            && self.store.contains(existing)
        {
            return Ok(existing);
        }
        let future = self.resolved(value)?;
        self.disown(future);
        Ok(future)
    }

    // -- settlement (post-resolution) ---------------------------------------

    pub(crate) fn fulfill_future(
        &mut self,
        future: FutureHandle,
        value: Value,
    ) -> Result<(), FutureError> {
        let settlement = self
            .store
            .fulfill(future, value, &mut self.queue, &mut self.witness)?;
        for handle in settlement.discarded {
            self.continuations.release(handle);
        }
        self.events
            .emit("future", "future_fulfilled", "ok", Some(future), None);
        Ok(())
    }

    pub(crate) fn reject_future(
        &mut self,
        future: FutureHandle,
        reason: Value,
    ) -> Result<(), FutureError> {
        let settlement = self
            .store
            .reject(future, reason, &mut self.queue, &mut self.witness)?;
        for handle in settlement.discarded {
            self.continuations.release(handle);
        }
        if !self.store.get(future)?.observed {
            self.tracker.note_rejection(future);
        }
        self.events
            .emit("future", "future_rejected", "ok", Some(future), None);
        Ok(())
    }

    pub(crate) fn record_error(&mut self, component: &str, err: &FutureError) {
        self.events
            .emit(component, "error", "failed", None, Some(error_code(err)));
    }

    // -- registration --------------------------------------------------------

    /// Store a continuation for later registration.
    pub fn continuation<F>(&mut self, f: F) -> ContinuationHandle
    where
        F: FnOnce(&mut Runtime, Value) -> Completion + 'static,
    {
        self.continuations.insert(Box::new(f))
    }

    /// Register a continuation pair on `future` and return the derived
    /// future. Either side may be absent, in which case the outcome passes
    /// through to the derived future unchanged. Any registration makes the
    /// derived future responsible for a failure of `future`.
    pub fn register(
        &mut self,
        future: FutureHandle,
        on_success: Option<ContinuationHandle>,
        on_failure: Option<ContinuationHandle>,
    ) -> Result<FutureHandle, FutureError> {
        for handle in on_success.iter().chain(on_failure.iter()) {
            if !self.continuations.contains(*handle) {
                return Err(FutureError::UnknownContinuation { handle: *handle });
            }
        }
        // The unused branch is released at settlement.
        if let (Some(success), Some(failure)) = (on_success, on_failure)
            && success == failure
        {
            return Err(FutureError::DuplicateContinuation { handle: failure });
        }

        let registration = self.store.register(
            future,
            on_success,
            on_failure,
            &mut self.queue,
            &mut self.witness,
        )?;
        if let Some(handle) = registration.discarded {
            self.continuations.release(handle);
        }
        if registration.newly_observed && self.tracker.note_observed(future) {
            self.events
                .emit("unhandled", "handled_late", "queued", Some(future), None);
        }
        self.events.emit(
            "future",
            "continuation_registered",
            if registration.scheduled { "scheduled" } else { "queued" },
            Some(future),
            None,
        );
        Ok(registration.derived)
    }

    fn register_owned(
        &mut self,
        future: FutureHandle,
        on_success: Option<ContinuationHandle>,
        on_failure: Option<ContinuationHandle>,
    ) -> Result<FutureHandle, FutureError> {
        self.register(future, on_success, on_failure).inspect_err(|_| {
            for handle in on_success.into_iter().chain(on_failure) {
                self.continuations.release(handle);
            }
        })
    }

    /// Success-only registration.
    pub fn then<F>(&mut self, future: FutureHandle, on_success: F) -> Result<FutureHandle, FutureError>
    where
        F: FnOnce(&mut Runtime, Value) -> Completion + 'static,
    {
        let success = self.continuation(on_success);
        self.register_owned(future, Some(success), None)
    }

    pub fn then_else<S, E>(
        &mut self,
        future: FutureHandle,
        on_success: S,
        on_failure: E,
    ) -> Result<FutureHandle, FutureError>
    where
        S: FnOnce(&mut Runtime, Value) -> Completion + 'static,
        E: FnOnce(&mut Runtime, Value) -> Completion + 'static,
    {
        let success = self.continuation(on_success);
        let failure = self.continuation(on_failure);
        self.register_owned(future, Some(success), Some(failure))
    }

    /// Failure-only registration.
    pub fn catch<F>(&mut self, future: FutureHandle, on_failure: F) -> Result<FutureHandle, FutureError>
    where
        F: FnOnce(&mut Runtime, Value) -> Completion + 'static,
    {
        let failure = self.continuation(on_failure);
        self.register_owned(future, None, Some(failure))
    }

    /// Run `on_settle` on either outcome, then pass the original outcome
    /// through. A failure from `on_settle` supersedes the original outcome.
    /// If `on_settle` returns a deferred value, the pass-through waits for
    /// it to settle (and adopts its failure, if any).
    pub fn finally<F>(&mut self, future: FutureHandle, on_settle: F) -> Result<FutureHandle, FutureError>
    where
        F: FnOnce(&mut Runtime) -> Completion + 'static,
    {
        let shared = Rc::new(RefCell::new(Some(on_settle)));
        let on_fulfilled = Rc::clone(&shared);
        let on_rejected = shared;
        self.then_else(
            future,
            move |rt, value| run_settle_hook(rt, &on_fulfilled, Ok(value)),
            move |rt, reason| run_settle_hook(rt, &on_rejected, Err(reason)),
        )
    }

    // -- lifetime ----------------------------------------------------------

    /// The host will not use `future` again, nor any value that names it.
    /// The record is reclaimed once it is settled and the queue is empty.
    pub fn release(&mut self, future: FutureHandle) -> Result<(), FutureError> {
        if self.store.release(future)? {
            self.events
                .emit("future", "future_released", "ok", Some(future), None);
        }
        Ok(())
    }

    /// Release a future the runtime created for itself.
    pub(crate) fn disown(&mut self, future: FutureHandle) {
        if let Err(err) = self.store.release(future) {
            self.record_error("future", &err);
        }
    }

    /// Reclaim every settled, released future. Does nothing while jobs are
    /// queued or a drain is running, since queued jobs may still name them.
    /// Returns the number of futures removed.
    pub fn reclaim(&mut self) -> u64 {
        if self.draining || !self.queue.is_empty() {
            return 0;
        }
        self.sweep()
    }

    fn sweep(&mut self) -> u64 {
        let tracker = &self.tracker;
        let removed = self
            .store
            .reclaim(|future| tracker.is_candidate(future), &mut self.witness);
        for future in &removed {
            self.tracker.forget(*future);
            self.events
                .emit("future", "future_reclaimed", "ok", Some(*future), None);
        }
        removed.len() as u64
    }

    // -- scheduling --------------------------------------------------------

    /// Append a free-standing task to the queue. Returns its run index.
    pub fn enqueue_job<F>(&mut self, task: F) -> u64
    where
        F: FnOnce(&mut Runtime) -> Result<(), Value> + 'static,
    {
        let callback = self.continuation(move |rt, _| task(rt).map(|()| Value::Undefined));
        let index = self
            .queue
            .enqueue(Job::Task { callback }, &mut self.witness);
        self.events
            .emit("deferred_queue", "task_enqueued", "ok", None, None);
        index
    }

    /// Run queued jobs in FIFO order, including jobs enqueued while
    /// draining, until the queue is empty or the job budget runs out. A
    /// complete drain ends with the unhandled-failure scan, then reclaims
    /// settled futures nobody holds.
    ///
    /// Calling `drain` from inside a running job does nothing.
    pub fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();
        if self.draining {
            self.events
                .emit("deferred_queue", "nested_drain_ignored", "skipped", None, None);
            return report;
        }
        self.draining = true;

        while !self.queue.is_empty() {
            if let Some(budget) = self.config.job_budget_per_drain
                && report.jobs_run >= budget
            {
                report.budget_exhausted = true;
                break;
            }
            let Some(job) = self.queue.dequeue(&mut self.witness) else {
                break;
            };
            report.jobs_run += 1;
            if let Some(failure) = self.run_job(job) {
                report.job_failures.push(failure);
            }
        }

        if report.budget_exhausted {
            self.events.emit(
                "deferred_queue",
                "drain_budget_exhausted",
                "partial",
                None,
                None,
            );
        } else {
            report.notices = self.scan_unhandled();
            report.reclaimed = self.sweep();
            self.events
                .emit("deferred_queue", "drain_complete", "ok", None, None);
        }
        self.draining = false;
        report
    }

    fn run_job(&mut self, job: Job) -> Option<Value> {
        self.events
            .emit("deferred_queue", "job_run", job.kind_name(), None, None);
        match job {
            Job::Reaction {
                handler,
                kind,
                argument,
                derived,
            } => {
                let completion = match handler {
                    Some(handle) => self.invoke(handle, argument),
                    None => match kind {
                        ReactionKind::Success => Ok(argument),
                        ReactionKind::Failure => Err(argument),
                    },
                };
                let settled = match completion {
                    Ok(value) => self.resolve_future(derived, value),
                    Err(reason) => {
                        if handler.is_some() {
                            self.events.emit(
                                "future",
                                "continuation_failed",
                                "rejected",
                                Some(derived),
                                None,
                            );
                        }
                        self.reject_future(derived, reason)
                    }
                };
                if let Err(err) = settled {
                    self.record_error("deferred_queue", &err);
                }
                None
            }
            Job::ResolveThenable { future, thenable } => {
                self.run_resolve_thenable(future, thenable);
                None
            }
            Job::Task { callback } => {
                let failure = self.invoke(callback, Value::Undefined).err();
                if failure.is_some() {
                    self.events
                        .emit("deferred_queue", "task_failed", "failed", None, None);
                }
                failure
            }
        }
    }

    pub(crate) fn invoke(&mut self, handle: ContinuationHandle, argument: Value) -> Completion {
        match self.continuations.take(handle) {
            Some(continuation) => continuation(self, argument),
            None => {
                let err = FutureError::UnknownContinuation { handle };
                self.record_error("continuation", &err);
                Err(Value::Error(ErrorValue::type_error(err.to_string())))
            }
        }
    }

    fn scan_unhandled(&mut self) -> Vec<FailureNotice> {
        let notices = self.tracker.scan(&self.store);
        for notice in &notices {
            let (event, outcome) = match notice {
                FailureNotice::Unhandled { .. } => ("unhandled_failure", "reported"),
                FailureNotice::HandledLate { .. } => ("handled_late", "reported"),
            };
            self.events
                .emit("unhandled", event, outcome, Some(notice.future()), None);
            if let Some(hook) = self.failure_hook.as_mut() {
                hook(notice);
            }
        }
        notices
    }

    // -- failure hook ------------------------------------------------------

    /// Install the callback that receives unhandled-failure notices.
    pub fn set_failure_hook<F>(&mut self, hook: F)
    where
        F: FnMut(&FailureNotice) + 'static,
    {
        self.failure_hook = Some(Box::new(hook));
    }

    pub fn clear_failure_hook(&mut self) {
        self.failure_hook = None;
    }

    /// Most recent delivered notices, bounded by `max_notice_history`.
    pub fn failure_notices(&self) -> Vec<FailureNotice> {
        self.tracker.history()
    }

    // -- inspection --------------------------------------------------------

    pub fn state(&self, future: FutureHandle) -> Result<&ExecutionState, FutureError> {
        Ok(&self.store.get(future)?.state)
    }

    pub fn is_settled(&self, future: FutureHandle) -> bool {
        self.store
            .get(future)
            .map(|record| record.state.is_settled())
            .unwrap_or(false)
    }

    /// Rejected futures with no continuation right now.
    pub fn unhandled_rejections(&self) -> Vec<FutureHandle> {
        self.store.unhandled_rejections()
    }

    pub fn store(&self) -> &FutureStore {
        &self.store
    }

    pub fn queue(&self) -> &DeferredQueue {
        &self.queue
    }

    pub fn live_continuations(&self) -> usize {
        self.continuations.len()
    }

    // -- events & witness --------------------------------------------------

    /// Take buffered structured events.
    pub fn drain_events(&mut self) -> Vec<RuntimeEvent> {
        self.events.drain()
    }

    pub fn event_counts(&self) -> &BTreeMap<String, u64> {
        self.events.counts()
    }

    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }

    /// Store, queue and timer steps in execution order.
    pub fn witness_log(&self) -> &WitnessLog {
        &self.witness
    }

    pub fn witness_digest(&self) -> String {
        self.witness.digest()
    }
}

fn run_settle_hook<F>(
    rt: &mut Runtime,
    hook: &Rc<RefCell<Option<F>>>,
    outcome: Result<Value, Value>,
) -> Completion
where
    F: FnOnce(&mut Runtime) -> Completion + 'static,
{
    let Some(on_settle) = hook.borrow_mut().take() else {
        return outcome;
    };
    let waited = on_settle(rt)?;
    if !waited.is_deferred_compatible() {
        return outcome;
    }
    let as_type_error = |err: FutureError| Value::Error(ErrorValue::type_error(err.to_string()));
    let barrier = rt.internal_source(waited).map_err(as_type_error)?;
    let passed = rt
        .then(barrier, move |_, _| outcome)
        .map_err(as_type_error)?;
    rt.disown(passed);
    Ok(Value::Future(passed))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
