//! Runtime values carried by futures.
//!
//! A [`Value`] is whatever a future settles with: plain data, an error
//! object, an aggregate failure, or a reference to another deferred value.
//! Only [`Value::Future`] and [`Value::Foreign`] are deferred-compatible;
//! the resolution procedure chains to those instead of fulfilling with them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::future::FutureHandle;
use crate::resolution::ForeignHandle;

// ---------------------------------------------------------------------------
// ErrorValue: error objects produced by the runtime or by user code
// ---------------------------------------------------------------------------

/// A named error object, e.g. `TypeError: chaining cycle detected`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
}

impl ErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Plain `Error` with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// Rejection reason for a future that was asked to resolve with itself.
    pub fn self_chain(handle: FutureHandle) -> Self {
        Self::type_error(format!("chaining cycle detected for {handle}"))
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

// ---------------------------------------------------------------------------
// AggregateFailure: every input of first-fulfilled rejected
// ---------------------------------------------------------------------------

pub const AGGREGATE_FAILURE_MESSAGE: &str = "all futures were rejected";

/// Composite rejection reason. `errors` is in input order, not settlement order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateFailure {
    pub errors: Vec<Value>,
    pub message: String,
}

impl AggregateFailure {
    pub fn new(errors: Vec<Value>) -> Self {
        Self {
            errors,
            message: AGGREGATE_FAILURE_MESSAGE.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AggregateError: {} ({} errors)",
            self.message,
            self.errors.len()
        )
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// Payload of a settled future.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
    Error(ErrorValue),
    Aggregate(AggregateFailure),
    /// A native future owned by the same runtime.
    Future(FutureHandle),
    /// A foreign deferred-compatible object registered with the runtime.
    Foreign(ForeignHandle),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorValue::error(message))
    }

    pub fn record<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Capability check used by the resolution procedure: does this value
    /// expose a continuation-registration member?
    pub fn is_deferred_compatible(&self) -> bool {
        matches!(self, Self::Future(_) | Self::Foreign(_))
    }

    pub fn as_future(&self) -> Option<FutureHandle> {
        match self {
            Self::Future(handle) => Some(*handle),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Field lookup on a `Record`; `None` for any other variant.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Record(fields) => fields.get(name),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "number",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Record(_) => "record",
            Self::Error(_) => "error",
            Self::Aggregate(_) => "aggregate",
            Self::Future(_) => "future",
            Self::Foreign(_) => "foreign",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Record(fields) => {
                f.write_str("{")?;
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
            Self::Error(err) => write!(f, "{err}"),
            Self::Aggregate(agg) => write!(f, "{agg}"),
            Self::Future(handle) => write!(f, "{handle}"),
            Self::Foreign(handle) => write!(f, "{handle}"),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<ErrorValue> for Value {
    fn from(err: ErrorValue) -> Self {
        Self::Error(err)
    }
}

impl From<FutureHandle> for Value {
    fn from(handle: FutureHandle) -> Self {
        Self::Future(handle)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_futures_and_foreign_values_are_deferred_compatible() {
        assert!(Value::Future(FutureHandle(0)).is_deferred_compatible());
        assert!(Value::Foreign(ForeignHandle(3)).is_deferred_compatible());
        assert!(!Value::Int(1).is_deferred_compatible());
        assert!(!Value::List(vec![Value::Future(FutureHandle(1))]).is_deferred_compatible());
        assert!(!Value::Undefined.is_deferred_compatible());
    }

    #[test]
    fn display_renders_nested_values() {
        let v = Value::List(vec![Value::Int(1), Value::str("a"), Value::Null]);
        assert_eq!(v.to_string(), "[1, a, null]");
        let r = Value::record([("status", Value::str("fulfilled")), ("value", Value::Int(2))]);
        assert_eq!(r.to_string(), "{status: fulfilled, value: 2}");
    }

    #[test]
    fn self_chain_error_names_the_future() {
        let err = ErrorValue::self_chain(FutureHandle(7));
        assert_eq!(err.name, "TypeError");
        assert!(err.to_string().contains("Future(7)"));
    }

    #[test]
    fn aggregate_failure_display_counts_errors() {
        let agg = AggregateFailure::new(vec![Value::str("a"), Value::str("b")]);
        assert_eq!(agg.len(), 2);
        assert!(agg.to_string().starts_with("AggregateError"));
        assert!(agg.to_string().contains("2 errors"));
    }

    #[test]
    fn field_lookup_only_on_records() {
        let r = Value::record([("value", Value::Int(9))]);
        assert_eq!(r.field("value"), Some(&Value::Int(9)));
        assert_eq!(r.field("missing"), None);
        assert_eq!(Value::Int(9).field("value"), None);
    }

    #[test]
    fn serde_roundtrip_all_variants() {
        let values = vec![
            Value::Undefined,
            Value::Null,
            Value::Bool(true),
            Value::Int(-4),
            Value::str("s"),
            Value::List(vec![Value::Int(1)]),
            Value::record([("k", Value::Null)]),
            Value::error("boom"),
            Value::Aggregate(AggregateFailure::new(vec![Value::Int(1)])),
            Value::Future(FutureHandle(2)),
            Value::Foreign(ForeignHandle(5)),
        ];
        for value in &values {
            let json = serde_json::to_string(value).expect("serialize");
            let back: Value = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(&back, value);
        }
    }
}
