//! Declarative scenario runner.
//!
//! A [`Scenario`] is a JSON-described program over one runtime: create
//! futures, settle them now or after virtual time, register continuations,
//! combine, drain. Futures are named by string ids. Running a scenario
//! yields a [`ScenarioReport`] with every named future's final state, the
//! order in which continuations ran, failure notices and the witness
//! digest, so two runs of the same scenario can be compared byte for byte.
//!
//! Literal values are plain JSON with two reserved object forms:
//! `{"$error": "message"}` is an `Error` value and `{"$future": "id"}`
//! references a named future.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::config::{ConfigError, RuntimeConfig};
use crate::continuation::ContinuationHandle;
use crate::future::{FutureError, FutureHandle};
use crate::resolution::Resolvers;
use crate::runtime::{DrainReport, Runtime};
use crate::unhandled::FailureNotice;
use crate::value::{ErrorValue, Value};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to parse scenario: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid runtime config: {0}")]
    Config(#[from] ConfigError),
    #[error("runtime rejected step: {0}")]
    Runtime(#[from] FutureError),
    #[error("future id `{0}` is already defined")]
    DuplicateId(String),
    #[error("unknown future id `{0}`")]
    UnknownId(String),
    #[error("future `{0}` was not created with `create` and cannot be settled by hand")]
    NotSettleable(String),
    #[error("unsupported literal: {0}")]
    UnsupportedLiteral(String),
}

// ---------------------------------------------------------------------------
// Scenario description
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: Option<RuntimeConfig>,
    pub steps: Vec<ScenarioStep>,
}

/// What a scenario continuation does with its argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Return the argument unchanged.
    Pass,
    Return { value: JsonValue },
    Raise { reason: JsonValue },
    /// Raise the argument (re-throw).
    Rethrow,
}

/// A labelled continuation; every invocation is logged under `label`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handler {
    pub label: String,
    #[serde(default = "default_action")]
    pub action: Action,
}

fn default_action() -> Action {
    Action::Pass
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScenarioStep {
    /// A pending future settled later by `fulfill` / `reject`.
    Create { id: String },
    Fulfill { id: String, value: JsonValue },
    Reject { id: String, reason: JsonValue },
    Resolved { id: String, value: JsonValue },
    Rejected { id: String, reason: JsonValue },
    /// A future settled after `ms` of virtual time.
    Delay {
        id: String,
        ms: u64,
        value: JsonValue,
        #[serde(default)]
        reject: bool,
    },
    Then {
        id: String,
        source: String,
        #[serde(default)]
        on_success: Option<Handler>,
        #[serde(default)]
        on_failure: Option<Handler>,
    },
    Finally {
        id: String,
        source: String,
        label: String,
        #[serde(default)]
        raise: Option<JsonValue>,
    },
    AllOf { id: String, inputs: Vec<JsonValue> },
    FirstSettled { id: String, inputs: Vec<JsonValue> },
    FirstFulfilled { id: String, inputs: Vec<JsonValue> },
    AllSettled { id: String, inputs: Vec<JsonValue> },
    Drain,
    RunUntilIdle,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FutureSummary {
    pub handle: FutureHandle,
    pub state: String,
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationLogEntry {
    pub label: String,
    pub argument: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub futures: BTreeMap<String, FutureSummary>,
    pub continuation_log: Vec<ContinuationLogEntry>,
    pub notices: Vec<FailureNotice>,
    pub job_failures: Vec<Value>,
    pub jobs_run: u64,
    pub final_time_ms: u64,
    pub witness_digest: String,
    pub event_counts: BTreeMap<String, u64>,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub fn load_scenario(json: &str) -> Result<Scenario, ScenarioError> {
    Ok(serde_json::from_str(json)?)
}

struct Session {
    runtime: Runtime,
    ids: BTreeMap<String, FutureHandle>,
    resolvers: BTreeMap<String, Resolvers>,
    log: Rc<RefCell<Vec<ContinuationLogEntry>>>,
    notices: Vec<FailureNotice>,
    job_failures: Vec<Value>,
    jobs_run: u64,
}

impl Session {
    fn new(config: RuntimeConfig) -> Result<Self, ScenarioError> {
        Ok(Self {
            runtime: Runtime::with_config(config)?,
            ids: BTreeMap::new(),
            resolvers: BTreeMap::new(),
            log: Rc::new(RefCell::new(Vec::new())),
            notices: Vec::new(),
            job_failures: Vec::new(),
            jobs_run: 0,
        })
    }

    /// Checked before a defining step touches the runtime, so a rejected
    /// step leaves no registration or future behind.
    fn ensure_fresh(&self, id: &str) -> Result<(), ScenarioError> {
        if self.ids.contains_key(id) {
            return Err(ScenarioError::DuplicateId(id.to_string()));
        }
        Ok(())
    }

    fn define(&mut self, id: &str, handle: FutureHandle) -> Result<(), ScenarioError> {
        self.ensure_fresh(id)?;
        self.ids.insert(id.to_string(), handle);
        Ok(())
    }

    fn lookup(&self, id: &str) -> Result<FutureHandle, ScenarioError> {
        self.ids
            .get(id)
            .copied()
            .ok_or_else(|| ScenarioError::UnknownId(id.to_string()))
    }

    fn resolvers_for(&self, id: &str) -> Result<Resolvers, ScenarioError> {
        self.lookup(id)?;
        self.resolvers
            .get(id)
            .cloned()
            .ok_or_else(|| ScenarioError::NotSettleable(id.to_string()))
    }

    fn literal(&self, json: &JsonValue) -> Result<Value, ScenarioError> {
        Ok(match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => Value::Int(
                n.as_i64()
                    .ok_or_else(|| ScenarioError::UnsupportedLiteral(n.to_string()))?,
            ),
            JsonValue::String(s) => Value::Str(s.clone()),
            JsonValue::Array(items) => Value::List(
                items
                    .iter()
                    .map(|item| self.literal(item))
                    .collect::<Result<_, _>>()?,
            ),
            JsonValue::Object(fields) => {
                if let Some(JsonValue::String(message)) = fields.get("$error")
                    && fields.len() == 1
                {
                    return Ok(Value::Error(ErrorValue::error(message.clone())));
                }
                if let Some(JsonValue::String(id)) = fields.get("$future")
                    && fields.len() == 1
                {
                    return Ok(Value::Future(self.lookup(id)?));
                }
                let mut record = BTreeMap::new();
                for (key, value) in fields {
                    record.insert(key.clone(), self.literal(value)?);
                }
                Value::Record(record)
            }
        })
    }

    fn literals(&self, inputs: &[JsonValue]) -> Result<Vec<Value>, ScenarioError> {
        inputs.iter().map(|input| self.literal(input)).collect()
    }

    fn handler(&mut self, handler: &Handler) -> Result<ContinuationHandle, ScenarioError> {
        let log = Rc::clone(&self.log);
        let label = handler.label.clone();
        let outcome: Option<Result<Value, Value>> = match &handler.action {
            Action::Pass | Action::Rethrow => None,
            Action::Return { value } => Some(Ok(self.literal(value)?)),
            Action::Raise { reason } => Some(Err(self.literal(reason)?)),
        };
        let rethrow = matches!(handler.action, Action::Rethrow);
        Ok(self.runtime.continuation(move |_, argument| {
            log.borrow_mut().push(ContinuationLogEntry {
                label,
                argument: argument.clone(),
            });
            match outcome {
                Some(result) => result,
                None if rethrow => Err(argument),
                None => Ok(argument),
            }
        }))
    }

    fn absorb(&mut self, report: DrainReport) {
        self.jobs_run += report.jobs_run;
        self.notices.extend(report.notices);
        self.job_failures.extend(report.job_failures);
    }

    fn step(&mut self, step: &ScenarioStep) -> Result<(), ScenarioError> {
        match step {
            ScenarioStep::Create { id } => {
                self.ensure_fresh(id)?;
                let (handle, resolvers) = self.runtime.pending()?;
                self.define(id, handle)?;
                self.resolvers.insert(id.clone(), resolvers);
            }
            ScenarioStep::Fulfill { id, value } => {
                let resolvers = self.resolvers_for(id)?;
                let value = self.literal(value)?;
                resolvers.fulfill(&mut self.runtime, value);
            }
            ScenarioStep::Reject { id, reason } => {
                let resolvers = self.resolvers_for(id)?;
                let reason = self.literal(reason)?;
                resolvers.reject(&mut self.runtime, reason);
            }
            ScenarioStep::Resolved { id, value } => {
                self.ensure_fresh(id)?;
                let value = self.literal(value)?;
                let handle = self.runtime.resolved(value)?;
                self.define(id, handle)?;
            }
            ScenarioStep::Rejected { id, reason } => {
                self.ensure_fresh(id)?;
                let reason = self.literal(reason)?;
                let handle = self.runtime.rejected(reason)?;
                self.define(id, handle)?;
            }
            ScenarioStep::Delay {
                id,
                ms,
                value,
                reject,
            } => {
                self.ensure_fresh(id)?;
                let value = self.literal(value)?;
                let outcome = if *reject { Err(value) } else { Ok(value) };
                let handle = self.runtime.delay(*ms, outcome)?;
                self.define(id, handle)?;
            }
            ScenarioStep::Then {
                id,
                source,
                on_success,
                on_failure,
            } => {
                self.ensure_fresh(id)?;
                let source = self.lookup(source)?;
                let success = on_success.as_ref().map(|h| self.handler(h)).transpose()?;
                let failure = on_failure.as_ref().map(|h| self.handler(h)).transpose()?;
                let derived = self.runtime.register(source, success, failure)?;
                self.define(id, derived)?;
            }
            ScenarioStep::Finally {
                id,
                source,
                label,
                raise,
            } => {
                self.ensure_fresh(id)?;
                let source = self.lookup(source)?;
                let raise = raise.as_ref().map(|r| self.literal(r)).transpose()?;
                let log = Rc::clone(&self.log);
                let label = label.clone();
                let derived = self.runtime.finally(source, move |_| {
                    log.borrow_mut().push(ContinuationLogEntry {
                        label,
                        argument: Value::Undefined,
                    });
                    match raise {
                        Some(reason) => Err(reason),
                        None => Ok(Value::Undefined),
                    }
                })?;
                self.define(id, derived)?;
            }
            ScenarioStep::AllOf { id, inputs } => {
                self.ensure_fresh(id)?;
                let inputs = self.literals(inputs)?;
                let handle = self.runtime.all_of(inputs)?;
                self.define(id, handle)?;
            }
            ScenarioStep::FirstSettled { id, inputs } => {
                self.ensure_fresh(id)?;
                let inputs = self.literals(inputs)?;
                let handle = self.runtime.first_settled(inputs)?;
                self.define(id, handle)?;
            }
            ScenarioStep::FirstFulfilled { id, inputs } => {
                self.ensure_fresh(id)?;
                let inputs = self.literals(inputs)?;
                let handle = self.runtime.first_fulfilled(inputs)?;
                self.define(id, handle)?;
            }
            ScenarioStep::AllSettled { id, inputs } => {
                self.ensure_fresh(id)?;
                let inputs = self.literals(inputs)?;
                let handle = self.runtime.all_settled(inputs)?;
                self.define(id, handle)?;
            }
            ScenarioStep::Drain => {
                let report = self.runtime.drain();
                self.absorb(report);
            }
            ScenarioStep::RunUntilIdle => {
                let report = self.runtime.run_until_idle();
                self.absorb(report.drain);
            }
        }
        Ok(())
    }
}

/// Execute `scenario` on a fresh runtime.
pub fn run_scenario(scenario: &Scenario) -> Result<ScenarioReport, ScenarioError> {
    let config = scenario.config.clone().unwrap_or_default();
    let mut session = Session::new(config)?;
    for step in &scenario.steps {
        session.step(step)?;
    }

    let mut futures = BTreeMap::new();
    for (id, handle) in &session.ids {
        let state = session.runtime.state(*handle)?;
        futures.insert(
            id.clone(),
            FutureSummary {
                handle: *handle,
                state: state.to_string(),
                payload: state.payload().cloned(),
            },
        );
    }
    let continuation_log = session.log.borrow().clone();
    Ok(ScenarioReport {
        name: scenario.name.clone(),
        futures,
        continuation_log,
        notices: session.notices,
        job_failures: session.job_failures,
        jobs_run: session.jobs_run,
        final_time_ms: session.runtime.now_ms(),
        witness_digest: session.runtime.witness_digest(),
        event_counts: session.runtime.event_counts().clone(),
    })
}

/// Human-readable multi-line summary.
pub fn render_summary(report: &ScenarioReport) -> String {
    let mut lines = vec![
        format!("scenario: {}", if report.name.is_empty() { "<unnamed>" } else { &report.name }),
        format!("jobs_run: {}", report.jobs_run),
        format!("final_time_ms: {}", report.final_time_ms),
        format!("witness_digest: {}", report.witness_digest),
        "futures:".to_string(),
    ];
    for (id, summary) in &report.futures {
        match &summary.payload {
            Some(payload) => lines.push(format!("  {id} [{}] {} {payload}", summary.handle, summary.state)),
            None => lines.push(format!("  {id} [{}] {}", summary.handle, summary.state)),
        }
    }
    lines.push("continuations:".to_string());
    for entry in &report.continuation_log {
        lines.push(format!("  {} <- {}", entry.label, entry.argument));
    }
    lines.push(format!("failure_notices: {}", report.notices.len()));
    for notice in &report.notices {
        match notice {
            FailureNotice::Unhandled { future, reason } => {
                lines.push(format!("  unhandled {future}: {reason}"));
            }
            FailureNotice::HandledLate { future } => {
                lines.push(format!("  handled late {future}"));
            }
        }
    }
    if !report.job_failures.is_empty() {
        lines.push(format!("job_failures: {}", report.job_failures.len()));
    }
    lines.join("\n")
}

impl ScenarioReport {
    /// Final state name of a named future (`pending`, `fulfilled`, `rejected`).
    pub fn state_of(&self, id: &str) -> Option<&str> {
        self.futures.get(id).map(|summary| summary.state.as_str())
    }

    pub fn payload_of(&self, id: &str) -> Option<&Value> {
        self.futures.get(id)?.payload.as_ref()
    }

    pub fn is_fulfilled(&self, id: &str) -> bool {
        self.state_of(id) == Some("fulfilled")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN: &str = r#"{
        "name": "chain",
        "steps": [
            {"op": "create", "id": "a"},
            {"op": "then", "id": "b", "source": "a",
             "on_success": {"label": "double", "action": {"kind": "return", "value": 84}}},
            {"op": "then", "id": "c", "source": "b",
             "on_success": {"label": "boom", "action": {"kind": "raise", "reason": {"$error": "bad"}}}},
            {"op": "then", "id": "d", "source": "c",
             "on_failure": {"label": "recover"}},
            {"op": "fulfill", "id": "a", "value": 42},
            {"op": "drain"}
        ]
    }"#;

    #[test]
    fn chain_scenario_runs_continuations_in_order() {
        let scenario = load_scenario(CHAIN).unwrap();
        let report = run_scenario(&scenario).unwrap();
        let labels: Vec<_> = report
            .continuation_log
            .iter()
            .map(|e| e.label.as_str())
            .collect();
        assert_eq!(labels, vec!["double", "boom", "recover"]);
        assert_eq!(report.payload_of("b"), Some(&Value::Int(84)));
        assert_eq!(report.state_of("c"), Some("rejected"));
        assert_eq!(report.payload_of("d"), Some(&Value::error("bad")));
        assert!(report.is_fulfilled("d"));
        assert!(report.notices.is_empty());
    }

    #[test]
    fn scenario_reports_are_deterministic() {
        let scenario = load_scenario(CHAIN).unwrap();
        let first = run_scenario(&scenario).unwrap();
        let second = run_scenario(&scenario).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.witness_digest.len(), 64);
    }

    #[test]
    fn combinators_and_timers() {
        let json = r#"{
            "steps": [
                {"op": "delay", "id": "slow", "ms": 200, "value": "s"},
                {"op": "delay", "id": "fast", "ms": 50, "value": "f"},
                {"op": "delay", "id": "bad", "ms": 10, "value": "x", "reject": true},
                {"op": "all_of", "id": "all", "inputs": [{"$future": "slow"}, {"$future": "fast"}, 3]},
                {"op": "first_settled", "id": "race", "inputs": [{"$future": "slow"}, {"$future": "fast"}]},
                {"op": "first_fulfilled", "id": "any", "inputs": [{"$future": "bad"}, {"$future": "slow"}]},
                {"op": "all_settled", "id": "settled", "inputs": [{"$future": "bad"}, {"$future": "fast"}]},
                {"op": "run_until_idle"}
            ]
        }"#;
        let report = run_scenario(&load_scenario(json).unwrap()).unwrap();
        assert_eq!(
            report.payload_of("all"),
            Some(&Value::List(vec![Value::str("s"), Value::str("f"), Value::Int(3)]))
        );
        assert_eq!(report.payload_of("race"), Some(&Value::str("f")));
        assert_eq!(report.payload_of("any"), Some(&Value::str("s")));
        assert_eq!(report.state_of("settled"), Some("fulfilled"));
        assert_eq!(report.final_time_ms, 200);
        assert!(report.notices.is_empty());
    }

    #[test]
    fn unhandled_rejection_reported() {
        let json = r#"{"steps": [
            {"op": "rejected", "id": "r", "reason": "lost"},
            {"op": "drain"}
        ]}"#;
        let report = run_scenario(&load_scenario(json).unwrap()).unwrap();
        assert_eq!(report.notices.len(), 1);
        let summary = render_summary(&report);
        assert!(summary.contains("unhandled Future(0)"));
        assert!(summary.contains("failure_notices: 1"));
    }

    #[test]
    fn finally_step_logs_and_passes_through() {
        let json = r#"{"steps": [
            {"op": "resolved", "id": "a", "value": 1},
            {"op": "finally", "id": "b", "source": "a", "label": "cleanup"},
            {"op": "drain"}
        ]}"#;
        let report = run_scenario(&load_scenario(json).unwrap()).unwrap();
        assert_eq!(report.continuation_log.len(), 1);
        assert_eq!(report.payload_of("b"), Some(&Value::Int(1)));
    }

    #[test]
    fn step_errors() {
        let dup = r#"{"steps": [{"op": "create", "id": "a"}, {"op": "create", "id": "a"}]}"#;
        assert!(matches!(
            run_scenario(&load_scenario(dup).unwrap()),
            Err(ScenarioError::DuplicateId(_))
        ));
        let unknown = r#"{"steps": [{"op": "fulfill", "id": "nope", "value": 1}]}"#;
        assert!(matches!(
            run_scenario(&load_scenario(unknown).unwrap()),
            Err(ScenarioError::UnknownId(_))
        ));
        let not_settleable = r#"{"steps": [
            {"op": "resolved", "id": "a", "value": 1},
            {"op": "fulfill", "id": "a", "value": 2}
        ]}"#;
        assert!(matches!(
            run_scenario(&load_scenario(not_settleable).unwrap()),
            Err(ScenarioError::NotSettleable(_))
        ));
        let float = r#"{"steps": [{"op": "resolved", "id": "a", "value": 1.5}]}"#;
        assert!(matches!(
            run_scenario(&load_scenario(float).unwrap()),
            Err(ScenarioError::UnsupportedLiteral(_))
        ));
        assert!(matches!(load_scenario("{"), Err(ScenarioError::Parse(_))));
    }

    #[test]
    fn duplicate_id_leaves_runtime_untouched() {
        let scenario = load_scenario(
            r#"{"steps": [
                {"op": "resolved", "id": "a", "value": 1},
                {"op": "then", "id": "a", "source": "a",
                 "on_success": {"label": "never"}},
                {"op": "all_of", "id": "a", "inputs": [{"$future": "a"}]},
                {"op": "delay", "id": "a", "ms": 5, "value": 1}
            ]}"#,
        )
        .unwrap();
        let mut session = Session::new(RuntimeConfig::default()).unwrap();
        session.step(&scenario.steps[0]).unwrap();
        let digest = session.runtime.witness_digest();

        for step in &scenario.steps[1..] {
            assert!(matches!(
                session.step(step),
                Err(ScenarioError::DuplicateId(_))
            ));
        }
        assert_eq!(session.runtime.store().len(), 1);
        assert_eq!(session.runtime.live_continuations(), 0);
        assert!(session.runtime.queue().is_empty());
        assert_eq!(session.runtime.witness_digest(), digest);
        session.step(&ScenarioStep::Drain).unwrap();
        assert!(session.log.borrow().is_empty());
    }

    #[test]
    fn invalid_config_is_reported() {
        let json = r#"{"config": {"trace_id": "", "job_budget_per_drain": null,
            "turn_budget": null, "max_buffered_events": 10}, "steps": []}"#;
        assert!(matches!(
            run_scenario(&load_scenario(json).unwrap()),
            Err(ScenarioError::Config(ConfigError::EmptyTraceId))
        ));
    }
}
