//! Table schema and retention bookkeeping

use crate::bytemap::ByteMap;
use crate::error::{CadenceError, Result};
use crate::expr::Expr;
use crate::store::{InsertRequest, RowStore, RowStoreOptions};
use crate::types::{align, nanos, Point, Timestamp};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A named derived column with its aggregation expression
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    name: String,
    expr: Expr,
}

impl Field {
    /// Build a field, validating the expression structurally. Field names
    /// may not contain `,` or `:` (both are schema-header delimiters).
    pub fn new(name: impl Into<String>, expr: Expr) -> Result<Field> {
        let name = name.into();
        if name.is_empty() || name.contains(',') || name.contains(':') {
            return Err(CadenceError::Config(format!(
                "invalid field name: {:?}",
                name
            )));
        }
        expr.validate()?;
        Ok(Field { name, expr })
    }

    /// The field name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The field's aggregation expression
    pub fn expr(&self) -> &Expr {
        &self.expr
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.expr)
    }
}

/// Table statistics
#[derive(Debug, Clone, Serialize)]
pub struct TableStats {
    /// Keys currently held in the writing memstore
    pub hot_keys: usize,
    /// Cumulative period buckets written to disk by flushes
    pub archived_buckets: u64,
}

/// Source of the current time for retention decisions
pub(crate) trait Clock: fmt::Debug + Send + Sync {
    fn now(&self) -> Timestamp;
}

/// The wall clock
#[derive(Debug)]
struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as i64
    }
}

/// A manually advanced clock, for driving retention in tests without
/// real waiting
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct ManualClock(std::sync::atomic::AtomicI64);

#[cfg(test)]
impl ManualClock {
    pub fn new(ts: Timestamp) -> Arc<ManualClock> {
        Arc::new(ManualClock(std::sync::atomic::AtomicI64::new(ts)))
    }

    pub fn set(&self, ts: Timestamp) {
        self.0.store(ts, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Schema and clock shared by a table's tasks
#[derive(Debug)]
pub(crate) struct TableCore {
    pub name: String,
    pub fields: Vec<Field>,
    pub resolution: i64,
    pub hot_period: i64,
    pub retention_period: i64,
    clock: Arc<dyn Clock>,
}

impl TableCore {
    pub fn new(
        name: &str,
        resolution: Duration,
        hot_period: Duration,
        retention_period: Duration,
        fields: Vec<Field>,
    ) -> Result<TableCore> {
        Self::with_clock(
            name,
            resolution,
            hot_period,
            retention_period,
            fields,
            Arc::new(SystemClock),
        )
    }

    pub fn with_clock(
        name: &str,
        resolution: Duration,
        hot_period: Duration,
        retention_period: Duration,
        fields: Vec<Field>,
        clock: Arc<dyn Clock>,
    ) -> Result<TableCore> {
        if name.is_empty() {
            return Err(CadenceError::Config("table name must not be empty".into()));
        }
        if resolution.is_zero() {
            return Err(CadenceError::Config(format!(
                "table {} needs a nonzero resolution",
                name
            )));
        }
        if retention_period < resolution {
            return Err(CadenceError::Config(format!(
                "table {} retention must cover at least one resolution period",
                name
            )));
        }
        if fields.is_empty() {
            return Err(CadenceError::Config(format!(
                "table {} needs at least one field",
                name
            )));
        }
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].iter().any(|f| f.name() == field.name()) {
                return Err(CadenceError::Config(format!(
                    "table {} declares field {} twice",
                    name,
                    field.name()
                )));
            }
        }
        Ok(TableCore {
            name: name.to_string(),
            fields,
            resolution: nanos(resolution),
            hot_period: nanos(hot_period),
            retention_period: nanos(retention_period),
            clock,
        })
    }

    /// Current wall time aligned down to resolution
    pub fn now(&self) -> Timestamp {
        align(self.clock.now(), self.resolution)
    }

    /// Wall-clock cutoff below which periods are discarded
    pub fn truncate_before(&self) -> Timestamp {
        self.now().saturating_sub(self.retention_period)
    }

    /// Whether queries read the currently-writing memstore
    pub fn include_memstore_in_query(&self) -> bool {
        self.hot_period > 0
    }

    /// Comma-joined field schema, as written to the filestore header
    pub fn schema_header(&self) -> String {
        self.fields
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A table: schema plus its row store
pub(crate) struct Table {
    pub core: Arc<TableCore>,
    pub rows: RowStore,
}

impl Table {
    pub fn open(core: Arc<TableCore>, opts: RowStoreOptions) -> Result<Table> {
        let rows = RowStore::open(core.clone(), opts)?;
        Ok(Table { core, rows })
    }

    /// Serialize a point's dimensions into the row key and enqueue it
    pub async fn insert(&self, point: &Point) -> Result<()> {
        let key = ByteMap::new(&point.dims);
        let vals = ByteMap::from_floats(&point.vals);
        self.rows
            .insert(InsertRequest {
                key,
                ts: point.ts,
                vals,
            })
            .await
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            hot_keys: self.rows.hot_keys(),
            archived_buckets: self.rows.archived_buckets(),
        }
    }

    /// Check whether a conflicting definition differs from this table's
    pub fn matches(
        &self,
        resolution: Duration,
        hot_period: Duration,
        retention_period: Duration,
        fields: &[Field],
    ) -> bool {
        self.core.resolution == nanos(resolution)
            && self.core.hot_period == nanos(hot_period)
            && self.core.retention_period == nanos(retention_period)
            && self.core.fields == fields
    }
}
