//! Core types for CadenceDB

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Timestamp in nanoseconds since Unix epoch
pub type Timestamp = i64;

/// Align a timestamp down to a resolution boundary
pub fn align(ts: Timestamp, resolution: i64) -> Timestamp {
    ts - ts.rem_euclid(resolution)
}

/// Convert a duration to nanoseconds
pub(crate) fn nanos(d: Duration) -> i64 {
    d.as_nanos() as i64
}

/// Possible dimension value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Boolean
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// String
    Str(String),
}

impl Value {
    /// Get as f64 if possible
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Get as i64 if possible
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) => Some(*v as i64),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

/// A single ingress point: a timestamp, a tuple of dimension values and a
/// set of named float measurements
#[derive(Debug, Clone)]
pub struct Point {
    /// Timestamp in nanoseconds
    pub ts: Timestamp,
    /// Dimension values keyed by name; serialized into the row key
    pub dims: BTreeMap<String, Value>,
    /// Measurements keyed by name
    pub vals: BTreeMap<String, f64>,
}

impl Point {
    /// Create an empty point at the given timestamp
    pub fn new(ts: Timestamp) -> Self {
        Self {
            ts,
            dims: BTreeMap::new(),
            vals: BTreeMap::new(),
        }
    }

    /// Add a dimension
    pub fn with_dim(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.dims.insert(key.into(), value.into());
        self
    }

    /// Add a measurement
    pub fn with_val(mut self, key: impl Into<String>, value: f64) -> Self {
        self.vals.insert(key.into(), value);
        self
    }
}
