//! Structured runtime events.
//!
//! The runtime does not write to a logging facade. Every component pushes a
//! [`RuntimeEvent`] into a bounded in-memory buffer that the host drains and
//! forwards wherever it likes; per-event counters survive buffer eviction.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::future::FutureHandle;

/// One structured event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub trace_id: String,
    /// Emitting component (`future`, `resolution`, `deferred_queue`, ...).
    pub component: String,
    pub event: String,
    pub outcome: String,
    pub future: Option<FutureHandle>,
    pub error_code: Option<String>,
}

/// Bounded event buffer plus counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLog {
    trace_id: String,
    capacity: usize,
    events: VecDeque<RuntimeEvent>,
    counts: BTreeMap<String, u64>,
    dropped: u64,
}

impl EventLog {
    pub fn new(trace_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            trace_id: trace_id.into(),
            capacity: capacity.max(1),
            events: VecDeque::new(),
            counts: BTreeMap::new(),
            dropped: 0,
        }
    }

    pub fn emit(
        &mut self,
        component: &str,
        event: &str,
        outcome: &str,
        future: Option<FutureHandle>,
        error_code: Option<&str>,
    ) {
        *self.counts.entry(event.to_string()).or_insert(0) += 1;
        if self.events.len() == self.capacity {
            self.events.pop_front();
            self.dropped += 1;
        }
        self.events.push_back(RuntimeEvent {
            trace_id: self.trace_id.clone(),
            component: component.to_string(),
            event: event.to_string(),
            outcome: outcome.to_string(),
            future,
            error_code: error_code.map(str::to_string),
        });
    }

    /// Take all buffered events.
    pub fn drain(&mut self) -> Vec<RuntimeEvent> {
        self.events.drain(..).collect()
    }

    pub fn events(&self) -> impl Iterator<Item = &RuntimeEvent> {
        self.events.iter()
    }

    pub fn counts(&self) -> &BTreeMap<String, u64> {
        &self.counts
    }

    pub fn count(&self, event: &str) -> u64 {
        self.counts.get(event).copied().unwrap_or(0)
    }

    /// Events evicted because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_stamps_trace_id_and_counts() {
        let mut log = EventLog::new("t-1", 8);
        log.emit("future", "future_created", "ok", Some(FutureHandle(0)), None);
        log.emit("future", "future_created", "ok", Some(FutureHandle(1)), None);
        log.emit("resolution", "self_chain", "rejected", None, Some("FD_SELF_CHAIN"));
        assert_eq!(log.len(), 3);
        assert_eq!(log.count("future_created"), 2);
        assert_eq!(log.count("missing"), 0);
        let events = log.drain();
        assert!(events.iter().all(|e| e.trace_id == "t-1"));
        assert_eq!(events[2].error_code.as_deref(), Some("FD_SELF_CHAIN"));
        assert!(log.is_empty());
        // counters survive drain
        assert_eq!(log.count("future_created"), 2);
    }

    #[test]
    fn buffer_evicts_oldest_past_capacity() {
        let mut log = EventLog::new("t", 2);
        log.emit("c", "a", "ok", None, None);
        log.emit("c", "b", "ok", None, None);
        log.emit("c", "c", "ok", None, None);
        assert_eq!(log.len(), 2);
        assert_eq!(log.dropped(), 1);
        let names: Vec<_> = log.events().map(|e| e.event.clone()).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert_eq!(log.count("a"), 1);
    }

    #[test]
    fn serde_event_roundtrip() {
        let event = RuntimeEvent {
            trace_id: "t".into(),
            component: "unhandled".into(),
            event: "unhandled_failure".into(),
            outcome: "reported".into(),
            future: Some(FutureHandle(4)),
            error_code: None,
        };
        let json = serde_json::to_string(&event).expect("serialize");
        let back: RuntimeEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, event);
    }
}
