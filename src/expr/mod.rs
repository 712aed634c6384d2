//! Aggregation expression engine
//!
//! An expression is a tree of pure, composable aggregators. Every node
//! encodes its partial state into a fixed-width byte slice so accumulator
//! state can live inline inside bucketed sequences and merge associatively:
//! a sequence slot for an expression of width W is exactly W contiguous
//! bytes, child state following parent state.
//!
//! The minimum alphabet: constants, field references, binary arithmetic
//! (ADD/SUB/MULT/DIV), the aggregators SUM/COUNT/MIN/MAX/AVG, a metadata
//! conditional wrapping an aggregator, and `calc` for parsing infix
//! arithmetic like `"ii / i"` into a tree of field references.

mod agg;
mod binary;
mod calc;
mod cond;

pub use agg::AggregateKind;
pub use binary::BinaryOp;
pub use calc::calc;
pub use cond::{CmpOp, Cond};

use crate::bytemap::ByteMap;
use crate::error::{CadenceError, Result};
use std::collections::BTreeSet;
use std::fmt;

/// Byte width of one encoded f64 word
pub(crate) const WORD: usize = 8;

/// Source of named float values for expression updates
pub trait Params {
    /// Look up a field value
    fn get(&self, field: &str) -> Option<f64>;
}

impl Params for std::collections::BTreeMap<String, f64> {
    fn get(&self, field: &str) -> Option<f64> {
        std::collections::BTreeMap::get(self, field).copied()
    }
}

impl Params for ByteMap {
    fn get(&self, field: &str) -> Option<f64> {
        ByteMap::get(self, field).and_then(|v| v.as_f64())
    }
}

/// A node in an aggregation expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A fixed value; contributes no state and never marks an update
    Constant(f64),
    /// A reference to a measurement by name; legal only under an aggregator
    Field(String),
    /// Binary arithmetic over two children
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// An aggregator folding its child's derived values, optionally gated
    /// by a metadata predicate
    Aggregate {
        kind: AggregateKind,
        wrapped: Box<Expr>,
        cond: Option<Cond>,
    },
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Expr::Constant(v)
    }
}

impl From<&str> for Expr {
    fn from(name: &str) -> Self {
        Expr::Field(name.to_string())
    }
}

impl From<String> for Expr {
    fn from(name: String) -> Self {
        Expr::Field(name)
    }
}

/// A fixed value
pub fn constant(v: f64) -> Expr {
    Expr::Constant(v)
}

/// A reference to a measurement by name
pub fn field(name: impl Into<String>) -> Expr {
    Expr::Field(name.into())
}

fn binary(op: BinaryOp, left: impl Into<Expr>, right: impl Into<Expr>) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left.into()),
        right: Box::new(right.into()),
    }
}

/// Sum of two expressions
pub fn add(left: impl Into<Expr>, right: impl Into<Expr>) -> Expr {
    binary(BinaryOp::Add, left, right)
}

/// Difference of two expressions
pub fn sub(left: impl Into<Expr>, right: impl Into<Expr>) -> Expr {
    binary(BinaryOp::Sub, left, right)
}

/// Product of two expressions
pub fn mult(left: impl Into<Expr>, right: impl Into<Expr>) -> Expr {
    binary(BinaryOp::Mult, left, right)
}

/// Quotient of two expressions; division by zero derives 0 without
/// marking an update
pub fn div(left: impl Into<Expr>, right: impl Into<Expr>) -> Expr {
    binary(BinaryOp::Div, left, right)
}

fn aggregate(kind: AggregateKind, wrapped: impl Into<Expr>) -> Expr {
    Expr::Aggregate {
        kind,
        wrapped: Box::new(wrapped.into()),
        cond: None,
    }
}

/// Running total of the wrapped expression
pub fn sum(wrapped: impl Into<Expr>) -> Expr {
    aggregate(AggregateKind::Sum, wrapped)
}

/// Count of updates the wrapped expression contributed to
pub fn count(wrapped: impl Into<Expr>) -> Expr {
    aggregate(AggregateKind::Count, wrapped)
}

/// Smallest value the wrapped expression produced
pub fn min(wrapped: impl Into<Expr>) -> Expr {
    aggregate(AggregateKind::Min, wrapped)
}

/// Largest value the wrapped expression produced
pub fn max(wrapped: impl Into<Expr>) -> Expr {
    aggregate(AggregateKind::Max, wrapped)
}

/// Average of the values the wrapped expression produced
pub fn avg(wrapped: impl Into<Expr>) -> Expr {
    aggregate(AggregateKind::Avg, wrapped)
}

impl Expr {
    /// Gate this aggregator behind a metadata predicate. Updates are
    /// skipped entirely when the predicate does not hold.
    pub fn with_cond(self, cond: Cond) -> Expr {
        match self {
            Expr::Aggregate { kind, wrapped, .. } => Expr::Aggregate {
                kind,
                wrapped,
                cond: Some(cond),
            },
            other => other,
        }
    }

    /// Total bytes of inline state for this expression and its children
    pub fn encoded_width(&self) -> usize {
        match self {
            Expr::Constant(_) | Expr::Field(_) => 0,
            Expr::Binary { left, right, .. } => left.encoded_width() + right.encoded_width(),
            Expr::Aggregate { kind, wrapped, .. } => {
                kind.state_width() + wrapped.encoded_width()
            }
        }
    }

    /// Names of the measurements this expression ultimately reads, sorted
    pub fn depends_on(&self) -> Vec<String> {
        let mut fields = BTreeSet::new();
        self.collect_fields(&mut fields);
        fields.into_iter().collect()
    }

    fn collect_fields(&self, fields: &mut BTreeSet<String>) {
        match self {
            Expr::Constant(_) => {}
            Expr::Field(name) => {
                fields.insert(name.clone());
            }
            Expr::Binary { left, right, .. } => {
                left.collect_fields(fields);
                right.collect_fields(fields);
            }
            Expr::Aggregate { wrapped, .. } => wrapped.collect_fields(fields),
        }
    }

    /// Structural check: field references are legal only under an
    /// aggregator, and aggregators do not nest
    pub fn validate(&self) -> Result<()> {
        self.validate_in(false)
    }

    fn validate_in(&self, in_aggregate: bool) -> Result<()> {
        match self {
            Expr::Constant(_) => Ok(()),
            Expr::Field(name) => {
                if in_aggregate {
                    Ok(())
                } else {
                    Err(CadenceError::Expr(format!(
                        "field {} must be wrapped in an aggregate",
                        name
                    )))
                }
            }
            Expr::Binary { left, right, .. } => {
                left.validate_in(in_aggregate)?;
                right.validate_in(in_aggregate)
            }
            Expr::Aggregate { kind, wrapped, .. } => {
                if in_aggregate {
                    return Err(CadenceError::Expr(format!(
                        "{} may not be nested inside another aggregate",
                        kind
                    )));
                }
                wrapped.validate_in(true)
            }
        }
    }

    /// Apply one event to the state slice. `state` must be exactly
    /// `encoded_width()` bytes. Returns the derived value after the event
    /// and whether this event contributed anything.
    pub fn update(
        &self,
        state: &mut [u8],
        params: &dyn Params,
        metadata: Option<&ByteMap>,
    ) -> (f64, bool) {
        match self {
            Expr::Constant(v) => (*v, false),
            Expr::Field(name) => match params.get(name) {
                Some(v) if !v.is_nan() => (v, true),
                _ => (0.0, false),
            },
            Expr::Binary { op, left, right } => {
                let lw = left.encoded_width();
                let (lv, lup) = left.update(&mut state[..lw], params, metadata);
                let (rv, rup) = right.update(&mut state[lw..], params, metadata);
                op.derive(lv, rv, lup || rup)
            }
            Expr::Aggregate {
                kind,
                wrapped,
                cond,
            } => {
                let hw = kind.state_width();
                if let Some(cond) = cond {
                    if !cond.eval(metadata) {
                        return (agg::derive(*kind, &state[..hw]).0, false);
                    }
                }
                let (v, updated) = wrapped.update(&mut state[hw..], params, metadata);
                if updated {
                    agg::fold(*kind, &mut state[..hw], v);
                }
                (agg::derive(*kind, &state[..hw]).0, updated)
            }
        }
    }

    /// Associatively combine the states `a` and `b` into `dst`. All three
    /// slices must be exactly `encoded_width()` bytes; if only one side was
    /// ever set, its state is copied, and if neither was, `dst` stays unset.
    pub fn merge(&self, dst: &mut [u8], a: &[u8], b: &[u8]) {
        match self {
            Expr::Constant(_) | Expr::Field(_) => {}
            Expr::Binary { left, right, .. } => {
                let lw = left.encoded_width();
                left.merge(&mut dst[..lw], &a[..lw], &b[..lw]);
                right.merge(&mut dst[lw..], &a[lw..], &b[lw..]);
            }
            Expr::Aggregate { kind, wrapped, .. } => {
                let hw = kind.state_width();
                agg::merge(*kind, &mut dst[..hw], &a[..hw], &b[..hw]);
                wrapped.merge(&mut dst[hw..], &a[hw..], &b[hw..]);
            }
        }
    }

    /// Derive the final value from a state slice, plus whether any event
    /// was ever folded into it
    pub fn get(&self, state: &[u8]) -> (f64, bool) {
        match self {
            Expr::Constant(v) => (*v, true),
            Expr::Field(_) => (0.0, false),
            Expr::Binary { op, left, right } => {
                let lw = left.encoded_width();
                let (lv, lset) = left.get(&state[..lw]);
                let (rv, rset) = right.get(&state[lw..]);
                let (v, _) = op.derive(lv, rv, lset || rset);
                (v, lset || rset)
            }
            Expr::Aggregate { kind, .. } => agg::derive(*kind, &state[..kind.state_width()]),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Constant(v) => write!(f, "{}", v),
            Expr::Field(name) => write!(f, "{}", name),
            Expr::Binary { op, left, right } => write!(f, "({} {} {})", left, op, right),
            Expr::Aggregate {
                kind,
                wrapped,
                cond,
            } => match cond {
                Some(cond) => write!(f, "{}({} IF {})", kind, wrapped, cond),
                None => write!(f, "{}({})", kind, wrapped),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use std::collections::BTreeMap;

    fn params(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn test_field_update() {
        let f = field("a");
        assert_eq!(f.encoded_width(), 0);
        let (v, updated) = f.update(&mut [], &params(&[("a", 4.4)]), None);
        assert_eq!(v, 4.4);
        assert!(updated);
    }

    #[test]
    fn test_combined() {
        // MULT(AVG(SUB(ADD(DIV(a, b), 1), 0.5)), 2)
        let e = mult(
            avg(sub(add(div(field("a"), field("b")), 1.0), 0.5)),
            2.0,
        );
        assert_eq!(e.depends_on(), vec!["a".to_string(), "b".to_string()]);
        e.validate().unwrap();

        let mut state = vec![0u8; e.encoded_width()];
        e.update(&mut state, &params(&[("a", 8.8), ("b", 4.4)]), None);
        e.update(&mut state, &params(&[("a", 20.0), ("b", 5.0)]), None);
        let (v, set) = e.get(&state);
        assert!(set);
        assert!((v - 7.0).abs() < 1e-9);

        // state bytes round-trip into a fresh accumulator
        let mut restored = state.clone();
        let (v, _) = e.get(&restored);
        assert!((v - 7.0).abs() < 1e-9);

        e.update(&mut restored, &params(&[("a", 0.0), ("b", 1.0)]), None);
        let (v, _) = e.get(&restored);
        assert!((v - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_div_by_zero_suppressed() {
        let e = avg(div(field("a"), field("b")));
        let mut state = vec![0u8; e.encoded_width()];
        let (v, updated) = e.update(&mut state, &params(&[("a", 1.0), ("b", 0.0)]), None);
        assert_eq!(v, 0.0);
        assert!(!updated);
        let (_, set) = e.get(&state);
        assert!(!set);
    }

    #[test]
    fn test_nan_suppressed() {
        let e = sum(field("a"));
        let mut state = vec![0u8; e.encoded_width()];
        let (_, updated) = e.update(&mut state, &params(&[("a", f64::NAN)]), None);
        assert!(!updated);
    }

    #[test]
    fn test_missing_field_suppressed() {
        let e = sum(field("a"));
        let mut state = vec![0u8; e.encoded_width()];
        let (_, updated) = e.update(&mut state, &params(&[("b", 1.0)]), None);
        assert!(!updated);
        let (v, set) = e.get(&state);
        assert_eq!(v, 0.0);
        assert!(!set);
    }

    #[test]
    fn test_min_max() {
        let lo = min(field("a"));
        let hi = max(field("a"));
        let mut lo_state = vec![0u8; lo.encoded_width()];
        let mut hi_state = vec![0u8; hi.encoded_width()];
        for v in [5.0, 2.0, 8.0, 1.0, 9.0] {
            lo.update(&mut lo_state, &params(&[("a", v)]), None);
            hi.update(&mut hi_state, &params(&[("a", v)]), None);
        }
        assert_eq!(lo.get(&lo_state).0, 1.0);
        assert_eq!(hi.get(&hi_state).0, 9.0);
    }

    #[test]
    fn test_count() {
        let e = count(field("a"));
        let mut state = vec![0u8; e.encoded_width()];
        e.update(&mut state, &params(&[("a", 5.0)]), None);
        e.update(&mut state, &params(&[("a", 7.0)]), None);
        e.update(&mut state, &params(&[("b", 1.0)]), None);
        assert_eq!(e.get(&state).0, 2.0);
    }

    #[test]
    fn test_validate_rejects_bare_field() {
        assert!(field("a").validate().is_err());
        assert!(add(field("a"), 1.0).validate().is_err());
        assert!(sum(field("a")).validate().is_ok());
        assert!(div(sum(field("a")), count(field("a"))).validate().is_ok());
        assert!(sum(avg(field("a"))).validate().is_err());
    }

    #[test]
    fn test_conditional_update() {
        let e = sum(field("a")).with_cond(Cond::new("flagged", CmpOp::Eq, Value::Bool(true)));
        let mut state = vec![0u8; e.encoded_width()];

        let mut on = BTreeMap::new();
        on.insert("flagged".to_string(), Value::Bool(true));
        let on = ByteMap::new(&on);
        let mut off = BTreeMap::new();
        off.insert("flagged".to_string(), Value::Bool(false));
        let off = ByteMap::new(&off);

        e.update(&mut state, &params(&[("a", 1.0)]), Some(&on));
        e.update(&mut state, &params(&[("a", 10.0)]), Some(&off));
        e.update(&mut state, &params(&[("a", 2.0)]), Some(&on));
        e.update(&mut state, &params(&[("a", 100.0)]), None);
        assert_eq!(e.get(&state).0, 3.0);
    }

    #[test]
    fn test_display_deterministic() {
        let e = mult(avg(div(field("ii"), field("i"))), 2.0);
        assert_eq!(e.to_string(), "(AVG((ii / i)) * 2)");
    }
}
