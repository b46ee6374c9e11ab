//! Witness events: an ordered trace of every state transition, job
//! movement and clock step, used to check that identical programs replay
//! identically.
//!
//! A runtime owns exactly one [`WitnessLog`]. The store, the queue and the
//! timer queue append to it at the moment each step happens, so log order
//! is execution order. The log keeps a bounded window of recent events plus
//! a running SHA-256 chain over every event ever recorded; evicting old
//! events never changes the digest.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::DEFAULT_MAX_WITNESS_EVENTS;
use crate::future::FutureHandle;
use crate::value::Value;

/// One observable step of the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WitnessEvent {
    FutureCreated { handle: FutureHandle, seq: u64 },
    FutureFulfilled { handle: FutureHandle, value: Value },
    FutureRejected { handle: FutureHandle, reason: Value },
    FutureReclaimed { handle: FutureHandle },
    JobEnqueued { index: u64 },
    JobDequeued { index: u64 },
    ClockAdvanced { from_ms: u64, to_ms: u64 },
    TimerFired { registration_seq: u64, at_ms: u64 },
}

// ---------------------------------------------------------------------------
// WitnessLog
// ---------------------------------------------------------------------------

/// Bounded, ordered witness trace with a digest over the full history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessLog {
    capacity: usize,
    events: VecDeque<WitnessEvent>,
    recorded: u64,
    evicted: u64,
    chain: [u8; 32],
}

impl Default for WitnessLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WITNESS_EVENTS)
    }
}

impl WitnessLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: VecDeque::new(),
            recorded: 0,
            evicted: 0,
            chain: [0; 32],
        }
    }

    pub fn record(&mut self, event: WitnessEvent) {
        self.chain = chain_step(&self.chain, &event);
        if self.events.len() == self.capacity {
            self.events.pop_front();
            self.evicted += 1;
        }
        self.events.push_back(event);
        self.recorded += 1;
    }

    /// Retained events, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &WitnessEvent> {
        self.events.iter()
    }

    pub fn last(&self) -> Option<&WitnessEvent> {
        self.events.back()
    }

    pub fn to_vec(&self) -> Vec<WitnessEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events ever recorded, including evicted ones.
    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Hex digest of the whole history.
    pub fn digest(&self) -> String {
        hex::encode(self.chain)
    }
}

fn chain_step(previous: &[u8; 32], event: &WitnessEvent) -> [u8; 32] {
    // Serializing plain enums of owned data cannot fail.
    let encoded = serde_json::to_vec(event).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(previous);
    hasher.update((encoded.len() as u64).to_le_bytes());
    hasher.update(&encoded);
    let mut next = [0u8; 32];
    next.copy_from_slice(&hasher.finalize());
    next
}

/// Digest of `events` as if they were recorded into a fresh log.
pub fn witness_digest(events: &[WitnessEvent]) -> String {
    let chain = events
        .iter()
        .fold([0u8; 32], |chain, event| chain_step(&chain, event));
    hex::encode(chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_for_equal_logs() {
        let log = vec![
            WitnessEvent::FutureCreated {
                handle: FutureHandle(0),
                seq: 0,
            },
            WitnessEvent::JobEnqueued { index: 0 },
        ];
        assert_eq!(witness_digest(&log), witness_digest(&log.clone()));
        assert_eq!(witness_digest(&log).len(), 64);
    }

    #[test]
    fn digest_changes_with_order() {
        let a = vec![
            WitnessEvent::JobEnqueued { index: 0 },
            WitnessEvent::JobDequeued { index: 0 },
        ];
        let b = vec![
            WitnessEvent::JobDequeued { index: 0 },
            WitnessEvent::JobEnqueued { index: 0 },
        ];
        assert_ne!(witness_digest(&a), witness_digest(&b));
    }

    #[test]
    fn empty_log_has_a_digest() {
        assert_eq!(witness_digest(&[]).len(), 64);
        assert_eq!(WitnessLog::default().digest(), witness_digest(&[]));
    }

    #[test]
    fn log_digest_matches_free_function() {
        let events = vec![
            WitnessEvent::FutureCreated {
                handle: FutureHandle(0),
                seq: 0,
            },
            WitnessEvent::JobEnqueued { index: 0 },
            WitnessEvent::JobDequeued { index: 0 },
        ];
        let mut log = WitnessLog::new(16);
        for event in &events {
            log.record(event.clone());
        }
        assert_eq!(log.digest(), witness_digest(&events));
        assert_eq!(log.to_vec(), events);
    }

    #[test]
    fn eviction_keeps_window_and_full_digest() {
        let mut bounded = WitnessLog::new(2);
        let mut unbounded = WitnessLog::new(64);
        for index in 0..10 {
            bounded.record(WitnessEvent::JobEnqueued { index });
            unbounded.record(WitnessEvent::JobEnqueued { index });
        }
        assert_eq!(bounded.len(), 2);
        assert_eq!(bounded.recorded(), 10);
        assert_eq!(bounded.evicted(), 8);
        assert_eq!(bounded.last(), Some(&WitnessEvent::JobEnqueued { index: 9 }));
        assert_eq!(bounded.digest(), unbounded.digest());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut log = WitnessLog::new(0);
        log.record(WitnessEvent::JobEnqueued { index: 0 });
        assert_eq!(log.capacity(), 1);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn serde_witness_event_all_variants() {
        let events = vec![
            WitnessEvent::FutureCreated {
                handle: FutureHandle(0),
                seq: 0,
            },
            WitnessEvent::FutureFulfilled {
                handle: FutureHandle(1),
                value: Value::Int(42),
            },
            WitnessEvent::FutureRejected {
                handle: FutureHandle(2),
                reason: Value::str("err"),
            },
            WitnessEvent::FutureReclaimed {
                handle: FutureHandle(2),
            },
            WitnessEvent::JobEnqueued { index: 5 },
            WitnessEvent::JobDequeued { index: 3 },
            WitnessEvent::ClockAdvanced {
                from_ms: 0,
                to_ms: 100,
            },
            WitnessEvent::TimerFired {
                registration_seq: 1,
                at_ms: 100,
            },
        ];
        for event in &events {
            let json = serde_json::to_string(event).expect("serialize");
            let back: WitnessEvent = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(&back, event);
        }
    }
}
