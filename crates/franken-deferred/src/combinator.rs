//! Combinators over ordered collections of deferred values.
//!
//! Each combinator normalizes its inputs to native futures, then registers
//! one continuation pair per input in index order. A shared tracker
//! accumulates outcomes by index and decides when the result future
//! settles. Because registration happens in index order, inputs that are
//! already settled report in index order within the same drain.
//!
//! | combinator        | fulfills with                 | rejects with          |
//! |-------------------|-------------------------------|-----------------------|
//! | `all_of`          | list of values, input order   | first failure         |
//! | `first_settled`   | first fulfillment             | first failure         |
//! | `first_fulfilled` | first fulfillment             | aggregate, input order|
//! | `all_settled`     | list of outcome records       | never                 |

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::future::{FutureError, FutureHandle};
use crate::resolution::Resolvers;
use crate::runtime::Runtime;
use crate::value::{AggregateFailure, ErrorValue, Value};

// ---------------------------------------------------------------------------
// Trackers
// ---------------------------------------------------------------------------

/// State for `all_of`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllOfTracker {
    pub result: FutureHandle,
    pub values: BTreeMap<usize, Value>,
    pub total: usize,
    pub fulfilled_count: usize,
    pub settled: bool,
}

impl AllOfTracker {
    pub fn new(result: FutureHandle, total: usize) -> Self {
        Self {
            result,
            values: BTreeMap::new(),
            total,
            fulfilled_count: 0,
            settled: false,
        }
    }

    /// Returns `true` when this fulfillment completes the set.
    pub fn record_fulfillment(&mut self, index: usize, value: Value) -> bool {
        if self.settled {
            return false;
        }
        self.values.insert(index, value);
        self.fulfilled_count += 1;
        if self.fulfilled_count == self.total {
            self.settled = true;
            return true;
        }
        false
    }

    /// Returns `true` if this failure is the one that settles the result.
    pub fn record_rejection(&mut self) -> bool {
        if self.settled {
            return false;
        }
        self.settled = true;
        true
    }

    pub fn mark_settled(&mut self) {
        self.settled = true;
    }

    /// Values in input order; missing indices become `Undefined`.
    pub fn collect_values(&self) -> Vec<Value> {
        (0..self.total)
            .map(|i| self.values.get(&i).cloned().unwrap_or(Value::Undefined))
            .collect()
    }
}

/// State for `first_settled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstSettledTracker {
    pub result: FutureHandle,
    pub settled: bool,
}

impl FirstSettledTracker {
    pub fn new(result: FutureHandle) -> Self {
        Self {
            result,
            settled: false,
        }
    }

    /// Returns `true` for the first caller only.
    pub fn try_settle(&mut self) -> bool {
        !std::mem::replace(&mut self.settled, true)
    }
}

/// State for `first_fulfilled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstFulfilledTracker {
    pub result: FutureHandle,
    pub errors: BTreeMap<usize, Value>,
    pub total: usize,
    pub rejected_count: usize,
    pub settled: bool,
}

impl FirstFulfilledTracker {
    pub fn new(result: FutureHandle, total: usize) -> Self {
        Self {
            result,
            errors: BTreeMap::new(),
            total,
            rejected_count: 0,
            settled: false,
        }
    }

    /// Returns `true` if this fulfillment settles the result.
    pub fn record_fulfillment(&mut self) -> bool {
        if self.settled {
            return false;
        }
        self.settled = true;
        true
    }

    /// Returns `true` when every input has now rejected.
    pub fn record_rejection(&mut self, index: usize, reason: Value) -> bool {
        if self.settled {
            return false;
        }
        self.errors.insert(index, reason);
        self.rejected_count += 1;
        if self.rejected_count == self.total {
            self.settled = true;
            return true;
        }
        false
    }

    pub fn mark_settled(&mut self) {
        self.settled = true;
    }

    /// Errors by input index (not arrival order).
    pub fn collect_errors(&self) -> Vec<Value> {
        (0..self.total)
            .map(|i| self.errors.get(&i).cloned().unwrap_or(Value::Undefined))
            .collect()
    }
}

/// Outcome of one input of `all_settled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettledOutcome {
    Fulfilled { value: Value },
    Rejected { reason: Value },
}

impl SettledOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Fulfilled { .. } => "fulfilled",
            Self::Rejected { .. } => "rejected",
        }
    }

    /// `{status: "fulfilled", value}` or `{status: "rejected", reason}`.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Fulfilled { value } => Value::record([
                ("status", Value::str("fulfilled")),
                ("value", value.clone()),
            ]),
            Self::Rejected { reason } => Value::record([
                ("status", Value::str("rejected")),
                ("reason", reason.clone()),
            ]),
        }
    }

    /// Inverse of [`SettledOutcome::to_value`].
    pub fn from_value(value: &Value) -> Option<Self> {
        match value.field("status")? {
            Value::Str(s) if s == "fulfilled" => Some(Self::Fulfilled {
                value: value.field("value")?.clone(),
            }),
            Value::Str(s) if s == "rejected" => Some(Self::Rejected {
                reason: value.field("reason")?.clone(),
            }),
            _ => None,
        }
    }
}

/// State for `all_settled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllSettledTracker {
    pub result: FutureHandle,
    pub outcomes: BTreeMap<usize, SettledOutcome>,
    pub total: usize,
    pub settled_count: usize,
}

impl AllSettledTracker {
    pub fn new(result: FutureHandle, total: usize) -> Self {
        Self {
            result,
            outcomes: BTreeMap::new(),
            total,
            settled_count: 0,
        }
    }

    /// Returns `true` when every input has settled.
    pub fn record(&mut self, index: usize, outcome: SettledOutcome) -> bool {
        if self.outcomes.insert(index, outcome).is_none() {
            self.settled_count += 1;
        }
        self.settled_count == self.total
    }

    pub fn record_fulfillment(&mut self, index: usize, value: Value) -> bool {
        self.record(index, SettledOutcome::Fulfilled { value })
    }

    pub fn record_rejection(&mut self, index: usize, reason: Value) -> bool {
        self.record(index, SettledOutcome::Rejected { reason })
    }

    pub fn collect_outcomes(&self) -> Vec<Value> {
        self.outcomes.values().map(SettledOutcome::to_value).collect()
    }
}

// ---------------------------------------------------------------------------
// Runtime entry points
// ---------------------------------------------------------------------------

impl Runtime {
    /// Fulfills with every input's value in input order once all fulfill;
    /// rejects with the first failure observed. Empty input fulfills with
    /// an empty list immediately.
    pub fn all_of(&mut self, inputs: Vec<Value>) -> Result<FutureHandle, FutureError> {
        let (result, resolvers) = self.pending()?;
        self.events
            .emit("combinator", "all_of", "started", Some(result), None);
        if inputs.is_empty() {
            resolvers.fulfill(self, Value::List(Vec::new()));
            return Ok(result);
        }
        let tracker = Rc::new(RefCell::new(AllOfTracker::new(result, inputs.len())));
        for (index, input) in inputs.into_iter().enumerate() {
            let on_value = Rc::clone(&tracker);
            let on_reason = Rc::clone(&tracker);
            let fulfill = resolvers.clone();
            let reject = resolvers.clone();
            self.attach(
                input,
                &resolvers,
                move |rt, value| {
                    let values = {
                        let mut tracker = on_value.borrow_mut();
                        if !tracker.record_fulfillment(index, value) {
                            return;
                        }
                        tracker.collect_values()
                    };
                    fulfill.fulfill(rt, Value::List(values));
                },
                move |rt, reason| {
                    if on_reason.borrow_mut().record_rejection() {
                        reject.reject(rt, reason);
                    }
                },
            );
        }
        Ok(result)
    }

    /// Adopts whichever input settles first. Empty input never settles.
    pub fn first_settled(&mut self, inputs: Vec<Value>) -> Result<FutureHandle, FutureError> {
        let (result, resolvers) = self.pending()?;
        self.events
            .emit("combinator", "first_settled", "started", Some(result), None);
        let tracker = Rc::new(RefCell::new(FirstSettledTracker::new(result)));
        for input in inputs {
            let on_value = Rc::clone(&tracker);
            let on_reason = Rc::clone(&tracker);
            let fulfill = resolvers.clone();
            let reject = resolvers.clone();
            self.attach(
                input,
                &resolvers,
                move |rt, value| {
                    if on_value.borrow_mut().try_settle() {
                        fulfill.fulfill(rt, value);
                    }
                },
                move |rt, reason| {
                    if on_reason.borrow_mut().try_settle() {
                        reject.reject(rt, reason);
                    }
                },
            );
        }
        Ok(result)
    }

    /// Fulfills with the first fulfillment. If every input rejects, rejects
    /// with an aggregate failure listing the errors in input order. Empty
    /// input rejects with an empty aggregate immediately.
    pub fn first_fulfilled(&mut self, inputs: Vec<Value>) -> Result<FutureHandle, FutureError> {
        let (result, resolvers) = self.pending()?;
        self.events
            .emit("combinator", "first_fulfilled", "started", Some(result), None);
        if inputs.is_empty() {
            resolvers.reject(self, Value::Aggregate(AggregateFailure::new(Vec::new())));
            return Ok(result);
        }
        let tracker = Rc::new(RefCell::new(FirstFulfilledTracker::new(result, inputs.len())));
        for (index, input) in inputs.into_iter().enumerate() {
            let on_value = Rc::clone(&tracker);
            let on_reason = Rc::clone(&tracker);
            let fulfill = resolvers.clone();
            let reject = resolvers.clone();
            self.attach(
                input,
                &resolvers,
                move |rt, value| {
                    if on_value.borrow_mut().record_fulfillment() {
                        fulfill.fulfill(rt, value);
                    }
                },
                move |rt, reason| {
                    let errors = {
                        let mut tracker = on_reason.borrow_mut();
                        if !tracker.record_rejection(index, reason) {
                            return;
                        }
                        tracker.collect_errors()
                    };
                    reject.reject(rt, Value::Aggregate(AggregateFailure::new(errors)));
                },
            );
        }
        Ok(result)
    }

    /// Always fulfills, with one outcome record per input in input order.
    /// Empty input fulfills with an empty list immediately.
    pub fn all_settled(&mut self, inputs: Vec<Value>) -> Result<FutureHandle, FutureError> {
        let (result, resolvers) = self.pending()?;
        self.events
            .emit("combinator", "all_settled", "started", Some(result), None);
        if inputs.is_empty() {
            resolvers.fulfill(self, Value::List(Vec::new()));
            return Ok(result);
        }
        let tracker = Rc::new(RefCell::new(AllSettledTracker::new(result, inputs.len())));
        for (index, input) in inputs.into_iter().enumerate() {
            let on_value = Rc::clone(&tracker);
            let on_reason = Rc::clone(&tracker);
            let fulfill_a = resolvers.clone();
            let fulfill_b = resolvers.clone();
            self.attach(
                input,
                &resolvers,
                move |rt, value| {
                    let outcomes = {
                        let mut tracker = on_value.borrow_mut();
                        if !tracker.record_fulfillment(index, value) {
                            return;
                        }
                        tracker.collect_outcomes()
                    };
                    fulfill_a.fulfill(rt, Value::List(outcomes));
                },
                move |rt, reason| {
                    let outcomes = {
                        let mut tracker = on_reason.borrow_mut();
                        if !tracker.record_rejection(index, reason) {
                            return;
                        }
                        tracker.collect_outcomes()
                    };
                    fulfill_b.fulfill(rt, Value::List(outcomes));
                },
            );
        }
        Ok(result)
    }

    /// Normalize `input` and register a tracker callback pair on it. The
    /// callbacks never fail, so the derived futures always fulfill.
    fn attach<S, E>(&mut self, input: Value, result: &Resolvers, on_value: S, on_reason: E)
    where
        S: FnOnce(&mut Runtime, Value) + 'static,
        E: FnOnce(&mut Runtime, Value) + 'static,
    {
        let registered = self.internal_source(input).and_then(|source| {
            self.then_else(
                source,
                move |rt, value| {
                    on_value(rt, value);
                    Ok(Value::Undefined)
                },
                move |rt, reason| {
                    on_reason(rt, reason);
                    Ok(Value::Undefined)
                },
            )
        });
        match registered {
            Ok(derived) => self.disown(derived),
            Err(err) => {
                self.record_error("combinator", &err);
                result.reject(self, Value::Error(ErrorValue::type_error(err.to_string())));
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

    fn h(n: u64) -> FutureHandle {
        FutureHandle(n)
    }

    #[test]
    fn all_of_tracker_collects_in_order() {
        let mut tracker = AllOfTracker::new(h(10), 3);
        assert!(!tracker.record_fulfillment(2, Value::Int(30)));
        assert!(!tracker.record_fulfillment(0, Value::Int(10)));
        assert!(tracker.record_fulfillment(1, Value::Int(20)));
        assert_eq!(
            tracker.collect_values(),
            vec![Value::Int(10), Value::Int(20), Value::Int(30)]
        );
    }

    #[test]
    fn all_of_tracker_ignores_after_settle() {
        let mut tracker = AllOfTracker::new(h(0), 3);
        assert!(tracker.record_rejection());
        assert!(!tracker.record_rejection());
        assert!(!tracker.record_fulfillment(0, Value::Int(1)));
        assert_eq!(tracker.fulfilled_count, 0);
    }

    #[test]
    fn all_of_tracker_gaps_are_undefined() {
        let mut tracker = AllOfTracker::new(h(0), 3);
        tracker.record_fulfillment(1, Value::Int(20));
        assert_eq!(
            tracker.collect_values(),
            vec![Value::Undefined, Value::Int(20), Value::Undefined]
        );
    }

    #[test]
    fn first_settled_tracker_first_wins() {
        let mut tracker = FirstSettledTracker::new(h(0));
        assert!(tracker.try_settle());
        assert!(!tracker.try_settle());
    }

    #[test]
    fn first_fulfilled_tracker_aggregates_by_index() {
        let mut tracker = FirstFulfilledTracker::new(h(0), 3);
        assert!(!tracker.record_rejection(2, Value::str("e2")));
        assert!(!tracker.record_rejection(0, Value::str("e0")));
        assert!(tracker.record_rejection(1, Value::str("e1")));
        assert_eq!(
            tracker.collect_errors(),
            vec![Value::str("e0"), Value::str("e1"), Value::str("e2")]
        );
    }

    #[test]
    fn first_fulfilled_tracker_short_circuits() {
        let mut tracker = FirstFulfilledTracker::new(h(0), 2);
        tracker.mark_settled();
        assert!(!tracker.record_rejection(0, Value::str("e")));
        assert!(!tracker.record_fulfillment());
        assert_eq!(tracker.rejected_count, 0);
    }

    #[test]
    fn all_settled_tracker_counts_each_index_once() {
        let mut tracker = AllSettledTracker::new(h(0), 2);
        assert!(!tracker.record_fulfillment(0, Value::Int(1)));
        assert!(!tracker.record_fulfillment(0, Value::Int(1)));
        assert!(tracker.record_rejection(1, Value::str("x")));
        assert_eq!(tracker.outcomes[&0].status(), "fulfilled");
        assert_eq!(tracker.outcomes[&1].status(), "rejected");
    }

    #[test]
    fn settled_outcome_value_conversion() {
        let outcome = SettledOutcome::Rejected {
            reason: Value::str("r"),
        };
        let value = outcome.to_value();
        assert_eq!(value.field("status"), Some(&Value::str("rejected")));
        assert_eq!(value.field("reason"), Some(&Value::str("r")));
        assert_eq!(SettledOutcome::from_value(&value), Some(outcome));
        assert_eq!(SettledOutcome::from_value(&Value::Int(1)), None);
    }

    #[test]
    fn tracker_serde_roundtrip() {
        let mut tracker = AllOfTracker::new(h(5), 2);
        tracker.record_fulfillment(0, Value::Int(42));
        let json = serde_json::to_string(&tracker).expect("serialize");
        let back: AllOfTracker = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, tracker);

        let outcome = SettledOutcome::Fulfilled {
            value: Value::Int(1),
        };
        let json = serde_json::to_string(&outcome).expect("serialize");
        assert!(json.contains("\"status\":\"fulfilled\""));
    }

    #[test]
    fn empty_inputs() {
        let mut rt = Runtime::new();
        let all = rt.all_of(Vec::new()).unwrap();
        let settled = rt.all_settled(Vec::new()).unwrap();
        let race = rt.first_settled(Vec::new()).unwrap();
        let any = rt.first_fulfilled(Vec::new()).unwrap();
        rt.catch(any, |_, r| Ok(r)).unwrap();
        assert_eq!(rt.state(all).unwrap(), &ExecutionState::Fulfilled(Value::List(vec![])));
        assert_eq!(
            rt.state(settled).unwrap(),
            &ExecutionState::Fulfilled(Value::List(vec![]))
        );
        assert_eq!(
            rt.state(any).unwrap(),
            &ExecutionState::Rejected(Value::Aggregate(AggregateFailure::new(vec![])))
        );
        rt.drain();
        assert_eq!(rt.state(race).unwrap(), &ExecutionState::Pending);
    }

    #[test]
    fn plain_values_are_immediately_fulfilled_inputs() {
        let mut rt = Runtime::new();
        let all = rt.all_of(vec![Value::Int(1), Value::str("two")]).unwrap();
        assert_eq!(rt.state(all).unwrap(), &ExecutionState::Pending);
        rt.drain();
        assert_eq!(
            rt.state(all).unwrap(),
            &ExecutionState::Fulfilled(Value::List(vec![Value::Int(1), Value::str("two")]))
        );
        // Only the result survives; the normalized inputs and their derived
        // futures were runtime-owned.
        assert_eq!(rt.store().len(), 1);
        assert!(rt.store().contains(all));
    }

    #[test]
    fn host_inputs_are_not_reclaimed_by_combinators() {
        let mut rt = Runtime::new();
        let a = rt.resolved(Value::Int(1)).unwrap();
        let b = rt.resolved(Value::Int(2)).unwrap();
        let settled = rt
            .all_settled(vec![Value::Future(a), Value::Future(b)])
            .unwrap();
        rt.drain();
        assert!(rt.store().contains(a));
        assert!(rt.store().contains(b));
        assert!(rt.state(settled).unwrap().is_fulfilled());
        assert_eq!(rt.store().len(), 3);
    }
}
