#![forbid(unsafe_code)]

//! Deferred-value runtime.
//!
//! Settle-once futures addressed by handle, a cooperative FIFO job queue,
//! chaining to other deferred values, the all-of / first-settled /
//! first-fulfilled / all-settled combinators, and end-of-drain reporting of
//! failures nobody handled. Everything lives in an explicitly constructed
//! [`Runtime`]; there is no global state and nothing is `Send`.

pub mod combinator;
pub mod config;
pub mod continuation;
pub mod deferred_queue;
pub mod event_log;
pub mod future;
pub mod host_timer;
pub mod resolution;
pub mod runtime;
pub mod scenario;
pub mod unhandled;
pub mod value;
pub mod witness;

pub use combinator::SettledOutcome;
pub use config::{ConfigError, RuntimeConfig};
pub use continuation::{Completion, ContinuationHandle};
pub use future::{ExecutionState, FutureError, FutureHandle, error_code};
pub use host_timer::{IdleReport, TimerId, TurnReport};
pub use resolution::{ForeignHandle, Resolvers, Thenable};
pub use runtime::{DrainReport, Runtime};
pub use witness::{WitnessEvent, WitnessLog};
pub use unhandled::FailureNotice;
pub use value::{AggregateFailure, ErrorValue, Value};
