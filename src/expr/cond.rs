//! Metadata predicates for conditional aggregation
//!
//! A condition compares one dimension value from a point's metadata against
//! a literal. Aggregators wrapped with a condition skip events for which
//! the predicate does not hold (including events with no metadata at all).

use crate::bytemap::ByteMap;
use crate::types::Value;
use std::fmt;

/// Comparison operators for conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        write!(f, "{}", symbol)
    }
}

/// A predicate over a single metadata field
#[derive(Debug, Clone, PartialEq)]
pub struct Cond {
    field: String,
    op: CmpOp,
    value: Value,
}

impl Cond {
    /// Build a predicate comparing `field` against a literal
    pub fn new(field: impl Into<String>, op: CmpOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Evaluate against a point's metadata. Absent metadata or an absent
    /// field never matches.
    pub fn eval(&self, metadata: Option<&ByteMap>) -> bool {
        let Some(metadata) = metadata else {
            return false;
        };
        let Some(actual) = metadata.get(&self.field) else {
            return false;
        };
        match (actual.as_f64(), self.value.as_f64()) {
            (Some(a), Some(b)) => self.compare(a.partial_cmp(&b)),
            _ => match (&actual, &self.value) {
                (Value::Str(a), Value::Str(b)) => self.compare(a.partial_cmp(b)),
                (Value::Bool(a), Value::Bool(b)) => match self.op {
                    CmpOp::Eq => a == b,
                    CmpOp::Ne => a != b,
                    _ => false,
                },
                _ => false,
            },
        }
    }

    fn compare(&self, ordering: Option<std::cmp::Ordering>) -> bool {
        use std::cmp::Ordering::*;
        match (self.op, ordering) {
            (CmpOp::Eq, Some(Equal)) => true,
            (CmpOp::Ne, Some(Less | Greater)) => true,
            (CmpOp::Lt, Some(Less)) => true,
            (CmpOp::Le, Some(Less | Equal)) => true,
            (CmpOp::Gt, Some(Greater)) => true,
            (CmpOp::Ge, Some(Greater | Equal)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.op, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn metadata(entries: &[(&str, Value)]) -> ByteMap {
        let m: BTreeMap<String, Value> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        ByteMap::new(&m)
    }

    #[test]
    fn test_numeric_comparisons() {
        let md = metadata(&[("r", Value::Int(5))]);
        assert!(Cond::new("r", CmpOp::Eq, 5.0).eval(Some(&md)));
        assert!(Cond::new("r", CmpOp::Lt, 6.0).eval(Some(&md)));
        assert!(Cond::new("r", CmpOp::Ge, 5.0).eval(Some(&md)));
        assert!(!Cond::new("r", CmpOp::Gt, 5.0).eval(Some(&md)));
    }

    #[test]
    fn test_string_and_bool() {
        let md = metadata(&[("host", Value::Str("h1".into())), ("b", Value::Bool(true))]);
        assert!(Cond::new("host", CmpOp::Eq, "h1").eval(Some(&md)));
        assert!(Cond::new("host", CmpOp::Ne, "h2").eval(Some(&md)));
        assert!(Cond::new("b", CmpOp::Eq, true).eval(Some(&md)));
        assert!(!Cond::new("b", CmpOp::Lt, true).eval(Some(&md)));
    }

    #[test]
    fn test_absent_never_matches() {
        assert!(!Cond::new("r", CmpOp::Eq, 5.0).eval(None));
        let md = metadata(&[("other", Value::Int(1))]);
        assert!(!Cond::new("r", CmpOp::Eq, 5.0).eval(Some(&md)));
    }

    #[test]
    fn test_display() {
        let c = Cond::new("r", CmpOp::Le, 5.0);
        assert_eq!(c.to_string(), "r <= 5");
    }
}
