//! Continuation arena.
//!
//! Jobs and reaction records never hold closures directly. They reference a
//! [`ContinuationHandle`]; the closure itself lives in the
//! [`ContinuationStore`] until it is taken out to run (or released because
//! the branch it belonged to was not chosen). This keeps every queued job a
//! plain, serializable value.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::runtime::Runtime;
use crate::value::Value;

/// Result of running a continuation: `Ok` fulfills (or chains) the derived
/// future, `Err` rejects it with the raised value.
pub type Completion = Result<Value, Value>;

/// A registered continuation. Invoked at most once.
pub type Continuation = Box<dyn FnOnce(&mut Runtime, Value) -> Completion>;

// ---------------------------------------------------------------------------
// ContinuationHandle
// ---------------------------------------------------------------------------

/// Opaque handle to a continuation in the [`ContinuationStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContinuationHandle(pub u64);

impl fmt::Display for ContinuationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Continuation({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ContinuationStore
// ---------------------------------------------------------------------------

/// Arena for continuations awaiting execution.
#[derive(Default)]
pub struct ContinuationStore {
    next_handle: u64,
    slots: BTreeMap<ContinuationHandle, Continuation>,
    /// Total continuations ever inserted.
    total_created: u64,
}

impl ContinuationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a continuation and return its handle.
    pub fn insert(&mut self, continuation: Continuation) -> ContinuationHandle {
        let handle = ContinuationHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        self.total_created += 1;
        self.slots.insert(handle, continuation);
        handle
    }

    pub fn contains(&self, handle: ContinuationHandle) -> bool {
        self.slots.contains_key(&handle)
    }

    /// Remove a continuation so it can be invoked.
    pub fn take(&mut self, handle: ContinuationHandle) -> Option<Continuation> {
        self.slots.remove(&handle)
    }

    /// Drop a continuation that will never run. Returns whether it existed.
    pub fn release(&mut self, handle: ContinuationHandle) -> bool {
        self.slots.remove(&handle).is_some()
    }

    /// Number of live continuations.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn total_created(&self) -> u64 {
        self.total_created
    }
}

impl fmt::Debug for ContinuationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationStore")
            .field("next_handle", &self.next_handle)
            .field("live", &self.slots.keys().collect::<Vec<_>>())
            .field("total_created", &self.total_created)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
