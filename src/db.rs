//! Database facade: tables, ingress and queries

use crate::config;
use crate::error::{CadenceError, Result};
use crate::store::RowStoreOptions;
use crate::table::{Field, Table, TableCore, TableStats};
use crate::types::{align, Point, Timestamp, Value};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Root directory; each table gets a subdirectory
    pub dir: PathBuf,
    /// Per-table memstore size that forces a flush
    pub max_memstore_bytes: usize,
    /// Lower bound on the adaptive flush interval
    pub min_flush_latency: Duration,
    /// Upper bound on the adaptive flush interval
    pub max_flush_latency: Duration,
}

impl DbOptions {
    /// Defaults from [`crate::config`] with the given root directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_memstore_bytes: config::MAX_MEMSTORE_BYTES,
            min_flush_latency: config::MIN_FLUSH_LATENCY,
            max_flush_latency: config::MAX_FLUSH_LATENCY,
        }
    }
}

/// A range query over one table's fields
#[derive(Debug, Clone)]
pub struct Query {
    /// Table to read
    pub table: String,
    /// Field names to report, each against every key
    pub fields: Vec<String>,
    /// Start of the range (inclusive), aligned down to resolution
    pub from: Timestamp,
    /// End of the range (inclusive), aligned down to resolution
    pub to: Timestamp,
}

/// An embedded time-series database over one data directory.
///
/// Must be used within a tokio runtime: every table spawns its own
/// inserter, flusher and sweeper tasks.
pub struct Db {
    opts: DbOptions,
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl Db {
    /// Create a database rooted at the options' directory
    pub fn new(opts: DbOptions) -> Db {
        Db {
            opts,
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Create a table. Idempotent by name: recreating with an identical
    /// definition is a no-op, a conflicting one is an error.
    pub fn create_table(
        &self,
        name: &str,
        resolution: Duration,
        hot_period: Duration,
        retention_period: Duration,
        fields: Vec<Field>,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.get(name) {
            return if existing.matches(resolution, hot_period, retention_period, &fields) {
                Ok(())
            } else {
                Err(CadenceError::Config(format!(
                    "table {} already exists with a different schema",
                    name
                )))
            };
        }

        let core = Arc::new(TableCore::new(
            name,
            resolution,
            hot_period,
            retention_period,
            fields,
        )?);
        let store_opts = RowStoreOptions {
            dir: self.opts.dir.join(name),
            max_memstore_bytes: self.opts.max_memstore_bytes,
            min_flush_latency: self.opts.min_flush_latency,
            max_flush_latency: self.opts.max_flush_latency,
        };
        let table = Table::open(core, store_opts)?;
        tables.insert(name.to_string(), Arc::new(table));
        info!("Created table: {}", name);
        Ok(())
    }

    /// List table names
    pub fn list_tables(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Enqueue one point; blocks when the table's inserter is saturated
    pub async fn insert(&self, table: &str, point: Point) -> Result<()> {
        let table = self.table(table)?;
        table.insert(&point).await
    }

    /// Run a range query, reporting each (key, field) pair's bucket values
    /// newest-first: `vals[i]` is the bucket at `to - i * resolution`.
    pub fn run_query<F>(&self, query: &Query, mut on_values: F) -> Result<()>
    where
        F: FnMut(&BTreeMap<String, Value>, &str, &[f64]),
    {
        let table = self.table(&query.table)?;
        let core = &table.core;

        let mut indices = Vec::with_capacity(query.fields.len());
        for name in &query.fields {
            let idx = core
                .fields
                .iter()
                .position(|f| f.name() == name)
                .ok_or_else(|| CadenceError::UnknownField(name.clone()))?;
            indices.push(idx);
        }

        let resolution = core.resolution;
        let from = align(query.from, resolution);
        let to = align(query.to, resolution);
        if to < from {
            return Err(CadenceError::Config(format!(
                "query to {} precedes from {}",
                query.to, query.from
            )));
        }
        let num_periods = ((to - from) / resolution + 1) as usize;

        table.rows.iterate(|key, columns| {
            let dims = crate::bytemap::ByteMap::from_bytes(key.to_vec()).as_map();
            for &idx in &indices {
                let field = &core.fields[idx];
                let mut vals = vec![0f64; num_periods];
                if let Some(seq) = columns.get(idx) {
                    for (i, val) in vals.iter_mut().enumerate() {
                        let ts = to - i as i64 * resolution;
                        *val = seq.value_at_time(ts, field.expr(), resolution).0;
                    }
                }
                on_values(&dims, field.name(), &vals);
            }
            Ok(())
        })
    }

    /// Table statistics
    pub fn table_stats(&self, table: &str) -> Result<TableStats> {
        Ok(self.table(table)?.stats())
    }

    /// Current wall time aligned down to the table's resolution
    pub fn now(&self, table: &str) -> Result<Timestamp> {
        Ok(self.table(table)?.core.now())
    }

    fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CadenceError::TableNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{avg, calc, field, sum};
    use tempfile::TempDir;

    const RES: i64 = 60_000_000_000;
    const MINUTE: Duration = Duration::from_secs(60);
    const HOT: Duration = Duration::from_secs(600);
    const RETENTION: Duration = Duration::from_secs(3600);

    // tables built through Db run on the wall clock, so test points are
    // anchored to it to stay inside the retention window
    fn base_ts() -> Timestamp {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos() as i64;
        align(now, RES)
    }

    fn test_options(dir: &std::path::Path) -> DbOptions {
        DbOptions {
            dir: dir.to_path_buf(),
            max_memstore_bytes: 1 << 20,
            min_flush_latency: Duration::from_secs(300),
            max_flush_latency: Duration::from_secs(300),
        }
    }

    fn schema() -> Vec<Field> {
        vec![
            Field::new("i", sum(field("i"))).unwrap(),
            Field::new("iii", avg(calc("ii / i").unwrap())).unwrap(),
        ]
    }

    fn query_results(db: &Db, q: &Query) -> BTreeMap<(i64, String), Vec<f64>> {
        let mut results = BTreeMap::new();
        db.run_query(q, |dims, field, vals| {
            if let Some(Value::Int(r)) = dims.get("r") {
                results.insert((*r, field.to_string()), vals.to_vec());
            }
        })
        .unwrap();
        results
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_insert_and_query() {
        let dir = TempDir::new().unwrap();
        let db = Db::new(test_options(dir.path()));
        db.create_table("metrics", MINUTE, HOT, RETENTION, schema())
            .unwrap();

        let ts = base_ts();
        for r in 0..3i64 {
            let point = Point::new(ts)
                .with_dim("r", r)
                .with_val("i", 4.0)
                .with_val("ii", 8.0);
            db.insert("metrics", point).await.unwrap();
        }
        let older = Point::new(ts - RES)
            .with_dim("r", 0i64)
            .with_val("i", 2.0)
            .with_val("ii", 1.0);
        db.insert("metrics", older).await.unwrap();

        let now = db.now("metrics").unwrap();
        assert_eq!(now, align(now, RES));
        assert!(now >= ts);

        let q = Query {
            table: "metrics".to_string(),
            fields: vec!["i".to_string(), "iii".to_string()],
            from: ts - RES,
            to: ts,
        };
        wait_until(|| {
            let results = query_results(&db, &q);
            results.get(&(0, "i".to_string())) == Some(&vec![4.0, 2.0])
        })
        .await;

        let results = query_results(&db, &q);
        assert_eq!(results.len(), 6);
        assert_eq!(results[&(0, "i".to_string())], vec![4.0, 2.0]);
        assert_eq!(results[&(1, "i".to_string())], vec![4.0, 0.0]);
        assert_eq!(results[&(2, "i".to_string())], vec![4.0, 0.0]);
        assert_eq!(results[&(0, "iii".to_string())], vec![2.0, 0.5]);
        assert_eq!(results[&(1, "iii".to_string())], vec![2.0, 0.0]);

        let stats = db.table_stats("metrics").unwrap();
        assert_eq!(stats.hot_keys, 3);
    }

    #[tokio::test]
    async fn test_create_table_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = Db::new(test_options(dir.path()));
        db.create_table("t", MINUTE, HOT, RETENTION, schema())
            .unwrap();
        // identical definition: no-op
        db.create_table("t", MINUTE, HOT, RETENTION, schema())
            .unwrap();
        // conflicting schema: error
        let other = vec![Field::new("x", sum(field("x"))).unwrap()];
        assert!(matches!(
            db.create_table("t", MINUTE, HOT, RETENTION, other),
            Err(CadenceError::Config(_))
        ));
        assert_eq!(db.list_tables(), vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_table_and_field() {
        let dir = TempDir::new().unwrap();
        let db = Db::new(test_options(dir.path()));
        db.create_table("t", MINUTE, HOT, RETENTION, schema())
            .unwrap();

        let ts = base_ts();
        assert!(matches!(
            db.insert("missing", Point::new(ts)).await,
            Err(CadenceError::TableNotFound(_))
        ));

        let q = Query {
            table: "t".to_string(),
            fields: vec!["nope".to_string()],
            from: ts,
            to: ts,
        };
        assert!(matches!(
            db.run_query(&q, |_, _, _| {}),
            Err(CadenceError::UnknownField(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_insert_and_query() {
        let dir = TempDir::new().unwrap();
        let mut opts = test_options(dir.path());
        // churn flushes while writers and readers run
        opts.max_memstore_bytes = 4096;
        opts.min_flush_latency = Duration::from_millis(50);
        opts.max_flush_latency = Duration::from_millis(50);
        let db = Arc::new(Db::new(opts));
        db.create_table("t", MINUTE, HOT, RETENTION, schema())
            .unwrap();

        let ts = base_ts();
        let writers: Vec<_> = (0..4i64)
            .map(|w| {
                let db = db.clone();
                tokio::spawn(async move {
                    for i in 0..250i64 {
                        let point = Point::new(ts)
                            .with_dim("r", (w * 250 + i) % 50)
                            .with_val("i", 1.0)
                            .with_val("ii", 1.0);
                        db.insert("t", point).await.unwrap();
                    }
                })
            })
            .collect();

        let q = Query {
            table: "t".to_string(),
            fields: vec!["i".to_string()],
            from: ts,
            to: ts,
        };

        // concurrent reads must always observe complete rows
        let reader = {
            let db = db.clone();
            let q = q.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    let mut total = 0.0;
                    db.run_query(&q, |_, _, vals| total += vals[0]).unwrap();
                    assert!(total <= 1000.0);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        };

        for writer in writers {
            writer.await.unwrap();
        }
        reader.await.unwrap();

        wait_until(|| {
            let mut keys = 0;
            let mut total = 0.0;
            db.run_query(&q, |_, _, vals| {
                keys += 1;
                total += vals[0];
            })
            .unwrap();
            keys == 50 && total == 1000.0
        })
        .await;
    }
}
