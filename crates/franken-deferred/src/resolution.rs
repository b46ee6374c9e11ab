//! Resolution procedure.
//!
//! Fulfilling a future with a value goes through [`Runtime::resolve_future`]:
//!
//! 1. the future itself: reject with a `TypeError` (self-chain),
//! 2. a deferred-compatible value: enqueue a `ResolveThenable` job that
//!    registers a guarded resolver pair on the value when it runs,
//! 3. anything else: fulfill directly.
//!
//! Foreign deferred values implement [`Thenable`] and are referenced from
//! values by [`ForeignHandle`]. Rejection never chains.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::deferred_queue::Job;
use crate::future::{FutureError, FutureHandle};
use crate::runtime::Runtime;
use crate::value::{ErrorValue, Value};

// ---------------------------------------------------------------------------
// Foreign deferred values
// ---------------------------------------------------------------------------

/// Handle of a foreign deferred value registered with a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ForeignHandle(pub u32);

impl fmt::Display for ForeignHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Foreign({})", self.0)
    }
}

/// A deferred-compatible object that is not a native future.
///
/// `register` receives a guarded resolver pair and may call either side
/// any number of times, now or later; only the first call has an effect.
/// Returning `Err` rejects the adopting future unless a resolver already
/// fired.
pub trait Thenable {
    fn register(&self, runtime: &mut Runtime, resolvers: Resolvers) -> Result<(), Value>;
}

/// Foreign values known to a runtime.
#[derive(Default)]
pub struct ForeignRegistry {
    next_handle: u32,
    entries: BTreeMap<ForeignHandle, Rc<dyn Thenable>>,
}

impl ForeignRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, thenable: Rc<dyn Thenable>) -> ForeignHandle {
        let handle = ForeignHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        self.entries.insert(handle, thenable);
        handle
    }

    pub fn get(&self, handle: ForeignHandle) -> Result<Rc<dyn Thenable>, FutureError> {
        self.entries
            .get(&handle)
            .cloned()
            .ok_or(FutureError::UnknownForeign { handle })
    }

    pub fn remove(&mut self, handle: ForeignHandle) -> bool {
        self.entries.remove(&handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ForeignRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignRegistry")
            .field("handles", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Resolvers
// ---------------------------------------------------------------------------

/// Fulfill/reject pair bound to one future.
///
/// Clones share the "already resolved" flag, so across every clone only
/// the first call wins. `fulfill` runs the full resolution procedure and
/// may therefore chain instead of settling immediately.
#[derive(Clone, Debug)]
pub struct Resolvers {
    future: FutureHandle,
    already_resolved: Rc<Cell<bool>>,
}

impl Resolvers {
    pub(crate) fn new(future: FutureHandle) -> Self {
        Self {
            future,
            already_resolved: Rc::new(Cell::new(false)),
        }
    }

    pub fn future(&self) -> FutureHandle {
        self.future
    }

    /// Whether either side has already been called.
    pub fn is_resolved(&self) -> bool {
        self.already_resolved.get()
    }

    /// Returns `false` if the pair was already used.
    pub fn fulfill(&self, runtime: &mut Runtime, value: Value) -> bool {
        if self.already_resolved.replace(true) {
            return false;
        }
        if let Err(err) = runtime.resolve_future(self.future, value) {
            runtime.record_error("resolution", &err);
        }
        true
    }

    /// Returns `false` if the pair was already used.
    pub fn reject(&self, runtime: &mut Runtime, reason: Value) -> bool {
        if self.already_resolved.replace(true) {
            return false;
        }
        if let Err(err) = runtime.reject_future(self.future, reason) {
            runtime.record_error("resolution", &err);
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Runtime entry points
// ---------------------------------------------------------------------------

impl Runtime {
    /// Make `thenable` addressable from values.
    pub fn adopt_foreign(&mut self, thenable: Rc<dyn Thenable>) -> Value {
        Value::Foreign(self.foreign.insert(thenable))
    }

    /// Drop a foreign value. Adoptions already scheduled for it reject with
    /// a `TypeError`. Returns `false` for an unknown handle.
    pub fn release_foreign(&mut self, handle: ForeignHandle) -> bool {
        self.foreign.remove(handle)
    }

    pub fn foreign_count(&self) -> usize {
        self.foreign.len()
    }

    /// Resolve `future` with `value`, chaining if `value` is deferred.
    pub(crate) fn resolve_future(
        &mut self,
        future: FutureHandle,
        value: Value,
    ) -> Result<(), FutureError> {
        if value == Value::Future(future) {
            self.events.emit(
                "resolution",
                "self_chain",
                "rejected",
                Some(future),
                Some("FD_SELF_CHAIN"),
            );
            return self.reject_future(future, Value::Error(ErrorValue::self_chain(future)));
        }
        if value.is_deferred_compatible() {
            self.store.get(future)?;
            self.queue.enqueue(
                Job::ResolveThenable {
                    future,
                    thenable: value,
                },
                &mut self.witness,
            );
            self.events
                .emit("resolution", "chain_scheduled", "ok", Some(future), None);
            return Ok(());
        }
        self.fulfill_future(future, value)
    }

    /// Body of a `ResolveThenable` job.
    pub(crate) fn run_resolve_thenable(&mut self, future: FutureHandle, thenable: Value) {
        let resolvers = Resolvers::new(future);
        match thenable {
            Value::Future(source) => {
                if let Err(err) = self.store.get(source) {
                    resolvers.reject(self, Value::Error(ErrorValue::type_error(err.to_string())));
                    return;
                }
                let on_fulfilled = resolvers.clone();
                let on_rejected = resolvers.clone();
                let success = self.continuation(move |rt, value| {
                    on_fulfilled.fulfill(rt, value);
                    Ok(Value::Undefined)
                });
                let failure = self.continuation(move |rt, reason| {
                    on_rejected.reject(rt, reason);
                    Ok(Value::Undefined)
                });
                match self.register(source, Some(success), Some(failure)) {
                    // Nothing ever reads the adoption's own derived future.
                    Ok(derived) => self.disown(derived),
                    Err(err) => {
                        self.continuations.release(success);
                        self.continuations.release(failure);
                        resolvers
                            .reject(self, Value::Error(ErrorValue::type_error(err.to_string())));
                    }
                }
            }
            Value::Foreign(handle) => {
                let target = match self.foreign.get(handle) {
                    Ok(target) => target,
                    Err(err) => {
                        self.record_error("resolution", &err);
                        resolvers
                            .reject(self, Value::Error(ErrorValue::type_error(err.to_string())));
                        return;
                    }
                };
                if let Err(reason) = target.register(self, resolvers.clone()) {
                    if !resolvers.reject(self, reason) {
                        self.events.emit(
                            "resolution",
                            "foreign_error_ignored",
                            "already_resolved",
                            Some(future),
                            None,
                        );
                    }
                }
            }
            other => {
                resolvers.fulfill(self, other);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::ExecutionState;

    /// Foreign value that answers synchronously during registration.
    struct Immediate(Result<Value, Value>);

    impl Thenable for Immediate {
        fn register(&self, rt: &mut Runtime, resolvers: Resolvers) -> Result<(), Value> {
            match &self.0 {
                Ok(value) => resolvers.fulfill(rt, value.clone()),
                Err(reason) => resolvers.reject(rt, reason.clone()),
            };
            Ok(())
        }
    }

    /// Foreign value that resolves, then tries again, then raises.
    struct Noisy;

    impl Thenable for Noisy {
        fn register(&self, rt: &mut Runtime, resolvers: Resolvers) -> Result<(), Value> {
            assert!(resolvers.fulfill(rt, Value::Int(1)));
            assert!(!resolvers.fulfill(rt, Value::Int(2)));
            assert!(!resolvers.reject(rt, Value::str("late")));
            Err(Value::str("raised after resolving"))
        }
    }

    /// Foreign value that raises before calling anything.
    struct Raises;

    impl Thenable for Raises {
        fn register(&self, _rt: &mut Runtime, _resolvers: Resolvers) -> Result<(), Value> {
            Err(Value::error("registration failed"))
        }
    }

    fn state(rt: &Runtime, h: FutureHandle) -> ExecutionState {
        rt.state(h).expect("valid handle").clone()
    }

    #[test]
    fn self_resolution_rejects_with_type_error() {
        let mut rt = Runtime::new();
        let (h, resolvers) = rt.pending().unwrap();
        resolvers.fulfill(&mut rt, Value::Future(h));
        match state(&rt, h) {
            ExecutionState::Rejected(Value::Error(err)) => {
                assert_eq!(err.name, "TypeError");
                assert!(err.message.contains("chaining cycle"));
            }
            other => panic!("expected TypeError rejection, got {other:?}"),
        }
        assert_eq!(rt.event_counts().get("self_chain"), Some(&1));
    }

    #[test]
    fn plain_value_fulfills_synchronously() {
        let mut rt = Runtime::new();
        let (h, resolvers) = rt.pending().unwrap();
        resolvers.fulfill(&mut rt, Value::Int(4));
        assert_eq!(state(&rt, h), ExecutionState::Fulfilled(Value::Int(4)));
        assert!(rt.queue().is_empty());
    }

    #[test]
    fn chaining_defers_through_queue() {
        let mut rt = Runtime::new();
        let (inner, inner_resolvers) = rt.pending().unwrap();
        let (outer, outer_resolvers) = rt.pending().unwrap();
        outer_resolvers.fulfill(&mut rt, Value::Future(inner));
        assert_eq!(state(&rt, outer), ExecutionState::Pending);
        assert_eq!(rt.queue().pending_count(), 1);

        rt.drain();
        assert_eq!(state(&rt, outer), ExecutionState::Pending);
        inner_resolvers.fulfill(&mut rt, Value::str("done"));
        rt.drain();
        assert_eq!(state(&rt, outer), ExecutionState::Fulfilled(Value::str("done")));
    }

    #[test]
    fn chaining_adopts_rejection_and_handles_source() {
        let mut rt = Runtime::new();
        let inner = rt.rejected(Value::str("bad")).unwrap();
        let (outer, outer_resolvers) = rt.pending().unwrap();
        outer_resolvers.fulfill(&mut rt, Value::Future(inner));
        let outer_caught = rt.catch(outer, |_, _| Ok(Value::Null)).unwrap();
        let report = rt.drain();
        assert_eq!(state(&rt, outer), ExecutionState::Rejected(Value::str("bad")));
        assert_eq!(state(&rt, outer_caught), ExecutionState::Fulfilled(Value::Null));
        // Adoption registered a failure continuation on `inner`.
        assert!(report.notices.is_empty());
    }

    #[test]
    fn resolvers_first_call_wins_across_clones() {
        let mut rt = Runtime::new();
        let (h, resolvers) = rt.pending().unwrap();
        let copy = resolvers.clone();
        assert!(!resolvers.is_resolved());
        assert!(copy.reject(&mut rt, Value::str("first")));
        assert!(resolvers.is_resolved());
        assert!(!resolvers.fulfill(&mut rt, Value::Int(1)));
        assert_eq!(state(&rt, h), ExecutionState::Rejected(Value::str("first")));
        assert_eq!(resolvers.future(), h);
    }

    #[test]
    fn foreign_fulfillment_is_adopted() {
        let mut rt = Runtime::new();
        let foreign = rt.adopt_foreign(Rc::new(Immediate(Ok(Value::Int(9)))));
        let h = rt.resolved(foreign).unwrap();
        assert_eq!(state(&rt, h), ExecutionState::Pending);
        rt.drain();
        assert_eq!(state(&rt, h), ExecutionState::Fulfilled(Value::Int(9)));
    }

    #[test]
    fn foreign_rejection_is_adopted() {
        let mut rt = Runtime::new();
        let foreign = rt.adopt_foreign(Rc::new(Immediate(Err(Value::str("no")))));
        let h = rt.resolved(foreign).unwrap();
        rt.drain();
        assert_eq!(state(&rt, h), ExecutionState::Rejected(Value::str("no")));
    }

    #[test]
    fn foreign_error_after_resolution_is_ignored() {
        let mut rt = Runtime::new();
        let foreign = rt.adopt_foreign(Rc::new(Noisy));
        let h = rt.resolved(foreign).unwrap();
        rt.drain();
        assert_eq!(state(&rt, h), ExecutionState::Fulfilled(Value::Int(1)));
        assert_eq!(rt.event_counts().get("foreign_error_ignored"), Some(&1));
    }

    #[test]
    fn foreign_error_before_resolution_rejects() {
        let mut rt = Runtime::new();
        let foreign = rt.adopt_foreign(Rc::new(Raises));
        let h = rt.resolved(foreign).unwrap();
        rt.drain();
        assert_eq!(
            state(&rt, h),
            ExecutionState::Rejected(Value::error("registration failed"))
        );
    }

    #[test]
    fn unknown_foreign_handle_rejects_with_type_error() {
        let mut rt = Runtime::new();
        let h = rt.resolved(Value::Foreign(ForeignHandle(42))).unwrap();
        rt.drain();
        assert!(matches!(
            state(&rt, h),
            ExecutionState::Rejected(Value::Error(ErrorValue { ref name, .. })) if name == "TypeError"
        ));
    }

    #[test]
    fn registry_lookup() {
        let mut registry = ForeignRegistry::new();
        assert!(registry.is_empty());
        let h = registry.insert(Rc::new(Raises));
        assert_eq!(h, ForeignHandle(0));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(h).is_ok());
        assert!(matches!(
            registry.get(ForeignHandle(3)),
            Err(FutureError::UnknownForeign { .. })
        ));
        assert_eq!(ForeignHandle(3).to_string(), "Foreign(3)");
        assert!(registry.remove(h));
        assert!(!registry.remove(h));
        assert!(registry.is_empty());
    }

    #[test]
    fn released_foreign_value_rejects_later_adoption() {
        let mut rt = Runtime::new();
        let foreign = rt.adopt_foreign(Rc::new(Immediate(Ok(Value::Int(9)))));
        let Value::Foreign(handle) = foreign else {
            panic!("expected a foreign value");
        };
        let h = rt.resolved(foreign).unwrap();
        assert!(rt.release_foreign(handle));
        assert_eq!(rt.foreign_count(), 0);
        rt.drain();
        assert!(state(&rt, h).is_rejected());
    }

    #[test]
    fn native_adoption_leaves_no_internal_futures() {
        let mut rt = Runtime::new();
        let inner = rt.resolved(Value::Int(2)).unwrap();
        let (outer, outer_resolvers) = rt.pending().unwrap();
        outer_resolvers.fulfill(&mut rt, Value::Future(inner));
        let report = rt.drain();
        assert_eq!(state(&rt, outer), ExecutionState::Fulfilled(Value::Int(2)));
        assert_eq!(report.reclaimed, 1);
        assert_eq!(rt.store().len(), 2);
    }
}
