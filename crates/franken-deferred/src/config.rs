//! Runtime configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TRACE_ID: &str = "deferred-runtime";
pub const DEFAULT_MAX_BUFFERED_EVENTS: usize = 4096;
pub const DEFAULT_MAX_WITNESS_EVENTS: usize = 16384;
pub const DEFAULT_MAX_NOTICE_HISTORY: usize = 1024;

/// Configuration for a [`Runtime`](crate::runtime::Runtime).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Correlation id stamped on every structured event.
    pub trace_id: String,
    /// Maximum jobs run by a single drain. `None` drains until empty.
    pub job_budget_per_drain: Option<u64>,
    /// Maximum turns taken by `run_until_idle`. `None` runs until idle.
    pub turn_budget: Option<u64>,
    /// Event buffer capacity; the oldest events are dropped past this.
    pub max_buffered_events: usize,
    /// Witness events kept in memory. The digest still covers evicted ones.
    pub max_witness_events: usize,
    /// Delivered failure notices kept for `Runtime::failure_notices`.
    pub max_notice_history: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trace_id: DEFAULT_TRACE_ID.to_string(),
            job_budget_per_drain: None,
            turn_budget: None,
            max_buffered_events: DEFAULT_MAX_BUFFERED_EVENTS,
            max_witness_events: DEFAULT_MAX_WITNESS_EVENTS,
            max_notice_history: DEFAULT_MAX_NOTICE_HISTORY,
        }
    }
}

impl RuntimeConfig {
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_job_budget(mut self, budget: u64) -> Self {
        self.job_budget_per_drain = Some(budget);
        self
    }

    pub fn with_turn_budget(mut self, budget: u64) -> Self {
        self.turn_budget = Some(budget);
        self
    }

    pub fn with_max_witness_events(mut self, capacity: usize) -> Self {
        self.max_witness_events = capacity;
        self
    }

    pub fn with_max_notice_history(mut self, capacity: usize) -> Self {
        self.max_notice_history = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trace_id.trim().is_empty() {
            return Err(ConfigError::EmptyTraceId);
        }
        if self.job_budget_per_drain == Some(0) {
            return Err(ConfigError::ZeroBudget {
                field: "job_budget_per_drain".to_string(),
            });
        }
        if self.turn_budget == Some(0) {
            return Err(ConfigError::ZeroBudget {
                field: "turn_budget".to_string(),
            });
        }
        for (field, value) in [
            ("max_buffered_events", self.max_buffered_events),
            ("max_witness_events", self.max_witness_events),
            ("max_notice_history", self.max_notice_history),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroBudget {
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Rejected configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigError {
    EmptyTraceId,
    ZeroBudget { field: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyTraceId => f.write_str("trace_id must be non-empty"),
            Self::ZeroBudget { field } => write!(f, "{field} must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigError {}
