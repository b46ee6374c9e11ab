//! Host timer shim: a virtual clock and a timer queue.
//!
//! Lets host code (and tests) produce futures that settle "later" without a
//! real event loop. Timers fire in `(fire_at, registration_seq)` order; each
//! firing advances the virtual clock to the timer's deadline. The clock
//! never moves backward.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::continuation::ContinuationHandle;
use crate::future::{FutureError, FutureHandle};
use crate::runtime::{DrainReport, Runtime};
use crate::unhandled::FailureNotice;
use crate::value::Value;
use crate::witness::{WitnessEvent, WitnessLog};

// ---------------------------------------------------------------------------
// VirtualClock
// ---------------------------------------------------------------------------

/// Deterministic millisecond clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualClock {
    now_ms: u64,
    next_timer_seq: u64,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Move forward to `target_ms`. Returns `false` (and does nothing) if
    /// `target_ms` is not in the future.
    pub fn advance_to(&mut self, target_ms: u64) -> bool {
        if target_ms <= self.now_ms {
            return false;
        }
        self.now_ms = target_ms;
        true
    }

    /// Next timer registration sequence number.
    pub fn register_timer(&mut self) -> u64 {
        let seq = self.next_timer_seq;
        self.next_timer_seq += 1;
        seq
    }
}

// ---------------------------------------------------------------------------
// TimerQueue
// ---------------------------------------------------------------------------

/// Identifier of a scheduled timer (its registration sequence number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimerId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerEntry {
    pub id: TimerId,
    pub fire_at: u64,
    pub callback: ContinuationHandle,
}

/// Pending timers keyed by `(fire_at, registration_seq)`.
#[derive(Debug, Clone, Default)]
pub struct TimerQueue {
    clock: VirtualClock,
    pending: BTreeMap<(u64, u64), TimerEntry>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn schedule(&mut self, delay_ms: u64, callback: ContinuationHandle) -> TimerId {
        let seq = self.clock.register_timer();
        let fire_at = self.clock.now_ms().saturating_add(delay_ms);
        let id = TimerId(seq);
        self.pending.insert(
            (fire_at, seq),
            TimerEntry {
                id,
                fire_at,
                callback,
            },
        );
        id
    }

    /// Remove a timer that has not fired yet.
    pub fn cancel(&mut self, id: TimerId) -> Option<ContinuationHandle> {
        let key = self
            .pending
            .iter()
            .find(|(_, entry)| entry.id == id)
            .map(|(key, _)| *key)?;
        self.pending.remove(&key).map(|entry| entry.callback)
    }

    pub fn next_fire_time(&self) -> Option<u64> {
        self.pending.keys().next().map(|(fire_at, _)| *fire_at)
    }

    /// Remove the earliest timer, advancing the clock to its deadline.
    pub fn pop_next(&mut self, witness: &mut WitnessLog) -> Option<(TimerEntry, bool)> {
        let (_, entry) = self.pending.pop_first()?;
        let from_ms = self.clock.now_ms();
        let advanced = self.clock.advance_to(entry.fire_at);
        if advanced {
            witness.record(WitnessEvent::ClockAdvanced {
                from_ms,
                to_ms: entry.fire_at,
            });
        }
        witness.record(WitnessEvent::TimerFired {
            registration_seq: entry.id.0,
            at_ms: self.clock.now_ms(),
        });
        Some((entry, advanced))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Turns
// ---------------------------------------------------------------------------

/// Outcome of one [`Runtime::turn`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnReport {
    pub drain: DrainReport,
    pub timer: Option<TimerId>,
    pub clock_advanced: bool,
}

/// Outcome of [`Runtime::run_until_idle`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleReport {
    pub turns: u64,
    pub timers_fired: u64,
    pub drain: DrainReport,
    /// Stopped because the configured turn budget ran out.
    pub turn_budget_exhausted: bool,
}

impl IdleReport {
    pub fn notices(&self) -> &[FailureNotice] {
        &self.drain.notices
    }
}

impl Runtime {
    pub fn now_ms(&self) -> u64 {
        self.timers.now_ms()
    }

    /// Run `callback` once `delay_ms` of virtual time has passed.
    pub fn set_timeout<F>(&mut self, delay_ms: u64, callback: F) -> TimerId
    where
        F: FnOnce(&mut Runtime) -> Result<(), Value> + 'static,
    {
        let handle = self.continuation(move |rt, _| callback(rt).map(|()| Value::Undefined));
        let id = self.timers.schedule(delay_ms, handle);
        self.events
            .emit("host_timer", "timer_scheduled", "ok", None, None);
        id
    }

    /// Cancel a timer that has not fired. Returns whether it was pending.
    pub fn clear_timeout(&mut self, id: TimerId) -> bool {
        match self.timers.cancel(id) {
            Some(handle) => {
                self.continuations.release(handle);
                true
            }
            None => false,
        }
    }

    /// A future that settles with `outcome` after `delay_ms`.
    pub fn delay(
        &mut self,
        delay_ms: u64,
        outcome: Result<Value, Value>,
    ) -> Result<FutureHandle, FutureError> {
        let (future, resolvers) = self.pending()?;
        self.set_timeout(delay_ms, move |rt| {
            match outcome {
                Ok(value) => resolvers.fulfill(rt, value),
                Err(reason) => resolvers.reject(rt, reason),
            };
            Ok(())
        });
        Ok(future)
    }

    pub fn has_pending_work(&self) -> bool {
        !self.queue.is_empty() || !self.timers.is_empty()
    }

    /// Drain jobs, fire the earliest timer (advancing the clock if needed),
    /// then drain again.
    pub fn turn(&mut self) -> TurnReport {
        let mut report = TurnReport {
            drain: self.drain(),
            ..TurnReport::default()
        };
        if report.drain.budget_exhausted {
            return report;
        }
        let Some((entry, advanced)) = self.timers.pop_next(&mut self.witness) else {
            return report;
        };
        report.timer = Some(entry.id);
        report.clock_advanced = advanced;
        self.events
            .emit("host_timer", "timer_fired", "ok", None, None);
        if let Err(failure) = self.invoke(entry.callback, Value::Undefined) {
            report.drain.job_failures.push(failure);
        }
        let after = self.drain();
        report.drain.absorb(after);
        report
    }

    /// Take turns until no jobs or timers remain, or the turn budget runs out.
    pub fn run_until_idle(&mut self) -> IdleReport {
        let mut report = IdleReport::default();
        loop {
            if !self.has_pending_work() {
                break;
            }
            if let Some(budget) = self.config().turn_budget
                && report.turns >= budget
            {
                report.turn_budget_exhausted = true;
                break;
            }
            let turn = self.turn();
            report.turns += 1;
            if turn.timer.is_some() {
                report.timers_fired += 1;
            }
            report.drain.absorb(turn.drain);
        }
        report.drain.budget_exhausted = self.queue.pending_count() > 0;
        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
