//! CadenceDB - Embedded Columnar Time-Series Engine
//!
//! A Rust engine for dimensioned metric points, optimized for:
//! - High-throughput insertion of points carrying string-keyed dimensions
//!   and float measurements
//! - Low-latency range queries over recent data
//! - Compact storage: per (dimension-tuple, field) pairs, aggregated values
//!   are kept as time-bucketed byte-encoded sequences
//!
//! # Architecture
//!
//! CadenceDB pairs an in-memory write path with a single rotating on-disk
//! file per table:
//!
//! - **Expressions**: composable aggregators (SUM, AVG, COUNT, MIN, MAX,
//!   arithmetic, conditionals) that encode their partial state into
//!   fixed-width byte slices and merge associatively
//! - **Sequences**: contiguous newest-first vectors of per-period
//!   aggregator states, aligned to a resolution
//! - **MemStore**: a byte-keyed radix tree over dimension tuples holding
//!   recent updates
//! - **FileStore**: a snappy-compressed, optionally externally-sorted row
//!   file; a background flusher merges retired memstores into it

pub mod bytemap;
pub mod bytetree;
pub mod expr;
pub mod sequence;
pub mod store;

mod db;
mod error;
mod table;
mod types;

pub use db::{Db, DbOptions, Query};
pub use error::{CadenceError, Result};
pub use table::{Field, TableStats};
pub use types::{align, Point, Timestamp, Value};

/// CadenceDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// Maximum memstore size before a forced flush (64MB)
    pub const MAX_MEMSTORE_BYTES: usize = 64 * 1024 * 1024;

    /// Lower bound on the adaptive flush interval
    pub const MIN_FLUSH_LATENCY: Duration = Duration::from_secs(1);

    /// Upper bound on the adaptive flush interval
    pub const MAX_FLUSH_LATENCY: Duration = Duration::from_secs(300);

    /// Every Nth flush routes rows through the external sorter
    pub const SORT_CADENCE: u64 = 10;

    /// Buffered reader/writer size around the snappy stream (64KB)
    pub const IO_BUFFER_SIZE: usize = 64 * 1024;

    /// Insert channel depth; a saturated inserter backpressures callers
    pub const INSERT_QUEUE_DEPTH: usize = 64;

    /// Age below which superseded filestore files are kept for in-flight readers
    pub const FILE_GRACE_PERIOD: Duration = Duration::from_secs(5 * 60);

    /// How often the sweeper scans for superseded filestore files
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
}
