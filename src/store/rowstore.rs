//! Row store coordinator
//!
//! Owns the map of active memstores (keyed by flush generation) and the
//! current filestore reference. Three long-running tasks per store:
//!
//! - **inserter**: drains the insert channel into the current memstore,
//!   retiring it for flush when the byte threshold or flush timer fires
//! - **flusher**: streams the prior filestore merged with the retired
//!   memstore into a new file, rotating it in on success; failures are
//!   retried with capped backoff while the retired memstore stays visible
//! - **sweeper**: deletes superseded row files once they age past the
//!   grace period that in-flight readers rely on
//!
//! The flush channel holds a single request, so a second retirement blocks
//! the inserter until the previous flush completes, which in turn
//! backpressures callers through the insert channel.

use super::{ExternalSorter, FileStore};
use crate::bytemap::ByteMap;
use crate::bytetree::Tree;
use crate::config;
use crate::error::{CadenceError, Result};
use crate::sequence::Sequence;
use crate::table::TableCore;
use crate::types::Timestamp;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Row store tuning knobs
#[derive(Debug, Clone)]
pub struct RowStoreOptions {
    /// Directory holding this store's row files
    pub dir: PathBuf,
    /// Memstore size that forces a flush
    pub max_memstore_bytes: usize,
    /// Lower bound on the adaptive flush interval
    pub min_flush_latency: Duration,
    /// Upper bound on the adaptive flush interval
    pub max_flush_latency: Duration,
}

impl RowStoreOptions {
    /// Defaults from [`crate::config`] with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_memstore_bytes: config::MAX_MEMSTORE_BYTES,
            min_flush_latency: config::MIN_FLUSH_LATENCY,
            max_flush_latency: config::MAX_FLUSH_LATENCY,
        }
    }
}

/// One enqueued point, dimensions already serialized into the key
#[derive(Debug)]
pub(crate) struct InsertRequest {
    pub key: ByteMap,
    pub ts: Timestamp,
    pub vals: ByteMap,
}

struct FlushRequest {
    idx: u64,
    memstore: Tree,
    sort: bool,
}

struct State {
    mem_stores: BTreeMap<u64, Tree>,
    current_idx: u64,
    file_store: Arc<FileStore>,
}

struct Shared {
    core: Arc<TableCore>,
    opts: RowStoreOptions,
    state: RwLock<State>,
    archived_buckets: AtomicU64,
}

/// The two-level write path for one table
pub struct RowStore {
    shared: Arc<Shared>,
    insert_tx: mpsc::Sender<InsertRequest>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RowStore {
    /// Open the store, loading the latest row file in the directory and
    /// spawning the inserter, flusher and sweeper tasks
    pub fn open(core: Arc<TableCore>, opts: RowStoreOptions) -> Result<RowStore> {
        std::fs::create_dir_all(&opts.dir)?;
        let file_store = Arc::new(FileStore::open(&opts.dir, &core.fields, core.resolution)?);
        if let Some(name) = file_store.filename() {
            debug!(
                "Initializing row store for {} from {}",
                core.name,
                name.display()
            );
        }

        let mut mem_stores = BTreeMap::new();
        mem_stores.insert(0, Tree::new());
        let shared = Arc::new(Shared {
            core,
            opts,
            state: RwLock::new(State {
                mem_stores,
                current_idx: 0,
                file_store,
            }),
            archived_buckets: AtomicU64::new(0),
        });

        let (insert_tx, insert_rx) = mpsc::channel(config::INSERT_QUEUE_DEPTH);
        let (flush_tx, flush_rx) = mpsc::channel(1);
        let (finished_tx, finished_rx) = mpsc::channel(1);

        let tasks = vec![
            tokio::spawn(run_inserter(
                shared.clone(),
                insert_rx,
                flush_tx,
                finished_rx,
            )),
            tokio::spawn(run_flusher(shared.clone(), flush_rx, finished_tx)),
            tokio::spawn(run_sweeper(shared.opts.dir.clone())),
        ];

        Ok(RowStore {
            shared,
            insert_tx,
            tasks,
        })
    }

    /// Enqueue one point; blocks when the inserter is saturated
    pub(crate) async fn insert(&self, req: InsertRequest) -> Result<()> {
        self.insert_tx
            .send(req)
            .await
            .map_err(|_| CadenceError::Internal("row store is shut down".to_string()))
    }

    /// Iterate the merged view of the filestore and a snapshot of the
    /// memstores. The youngest (currently-writing) memstore is copied, and
    /// only included when the table opts into hot reads.
    pub fn iterate<F>(&self, on_row: F) -> Result<()>
    where
        F: FnMut(&[u8], Vec<Sequence>) -> Result<()>,
    {
        let include_current = self.shared.core.include_memstore_in_query();
        let (file_store, mem_stores) = {
            let state = self.shared.state.read();
            let mut copies = Vec::with_capacity(state.mem_stores.len());
            for (idx, ms) in state.mem_stores.iter() {
                if *idx == state.current_idx && !include_current {
                    continue;
                }
                copies.push(ms.copy());
            }
            (state.file_store.clone(), copies)
        };
        file_store.iterate(self.shared.core.truncate_before(), mem_stores, on_row)
    }

    /// Keys in the currently-writing memstore
    pub fn hot_keys(&self) -> usize {
        let state = self.shared.state.read();
        state
            .mem_stores
            .get(&state.current_idx)
            .map(|ms| ms.length())
            .unwrap_or(0)
    }

    /// Cumulative period buckets written to disk
    pub fn archived_buckets(&self) -> u64 {
        self.shared.archived_buckets.load(Ordering::Relaxed)
    }
}

impl Drop for RowStore {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn run_inserter(
    shared: Arc<Shared>,
    mut inserts: mpsc::Receiver<InsertRequest>,
    flushes: mpsc::Sender<FlushRequest>,
    mut flush_finished: mpsc::Receiver<Duration>,
) {
    let mut mem_bytes = 0usize;
    let mut flush_idx = 0u64;
    let mut interval = shared.opts.max_flush_latency;
    let timer = tokio::time::sleep(interval);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            req = inserts.recv() => {
                let Some(req) = req else { break };
                let truncate_before = shared.core.truncate_before();
                let delta = {
                    let mut state = shared.state.write();
                    let current = state.current_idx;
                    match state.mem_stores.get_mut(&current) {
                        Some(tree) => tree.update(
                            &shared.core.fields,
                            shared.core.resolution,
                            truncate_before,
                            req.key.as_bytes(),
                            req.ts,
                            &req.vals,
                            Some(&req.key),
                        ),
                        None => 0,
                    }
                };
                mem_bytes = (mem_bytes as isize + delta).max(0) as usize;
                if mem_bytes >= shared.opts.max_memstore_bytes {
                    if let Some(fr) = retire_memstore(&shared, &mut flush_idx, &mut mem_bytes) {
                        if flushes.send(fr).await.is_err() {
                            break;
                        }
                    }
                }
            }
            _ = &mut timer => {
                if let Some(fr) = retire_memstore(&shared, &mut flush_idx, &mut mem_bytes) {
                    if flushes.send(fr).await.is_err() {
                        break;
                    }
                }
                timer.as_mut().reset(tokio::time::Instant::now() + interval);
            }
            finished = flush_finished.recv() => {
                if let Some(duration) = finished {
                    interval = (duration * 10)
                        .clamp(shared.opts.min_flush_latency, shared.opts.max_flush_latency);
                    timer.as_mut().reset(tokio::time::Instant::now() + interval);
                }
            }
        }
    }
}

/// Swap in a fresh memstore under the write lock and hand back a copy of
/// the retired one for flushing. The retired memstore stays in the map,
/// visible to queries, until its flush succeeds.
fn retire_memstore(
    shared: &Shared,
    flush_idx: &mut u64,
    mem_bytes: &mut usize,
) -> Option<FlushRequest> {
    if *mem_bytes == 0 {
        return None;
    }
    debug!("Requesting flush at memstore size {}", mem_bytes);
    let mut state = shared.state.write();
    let current = state.current_idx;
    let memstore = state.mem_stores.get(&current)?.copy();
    let sort = *flush_idx % config::SORT_CADENCE == 0;
    *flush_idx += 1;
    state.current_idx += 1;
    let next = state.current_idx;
    state.mem_stores.insert(next, Tree::new());
    *mem_bytes = 0;
    Some(FlushRequest {
        idx: current,
        memstore,
        sort,
    })
}

async fn run_flusher(
    shared: Arc<Shared>,
    mut flushes: mpsc::Receiver<FlushRequest>,
    flush_finished: mpsc::Sender<Duration>,
) {
    while let Some(req) = flushes.recv().await {
        let started = Instant::now();
        let mut backoff = Duration::from_millis(100);
        loop {
            match flush_once(&shared, &req) {
                Ok(()) => break,
                Err(e) => {
                    error!("Flush failed, retrying in {:?}: {}", backoff, e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
        let _ = flush_finished.send(started.elapsed()).await;
    }
}

fn flush_once(shared: &Shared, req: &FlushRequest) -> Result<()> {
    let started = Instant::now();
    let truncate_before = shared.core.truncate_before();
    let file_store = shared.state.read().file_store.clone();

    let temp = NamedTempFile::new_in(&shared.opts.dir)?;
    let encoder = snap::write::FrameEncoder::new(temp);
    let mut out = std::io::BufWriter::with_capacity(config::IO_BUFFER_SIZE, encoder);
    FileStore::write_header(&mut out, &shared.core.fields)?;

    let mut sorter = if req.sort {
        Some(ExternalSorter::new(
            shared.opts.max_memstore_bytes / 2,
            &shared.opts.dir,
        ))
    } else {
        None
    };

    let mut buckets = 0u64;
    let mut scratch = Vec::new();
    file_store.iterate(
        truncate_before,
        vec![req.memstore.copy()],
        |key, mut columns| {
            let mut has_active_sequence = false;
            for (i, field) in shared.core.fields.iter().enumerate() {
                if i >= columns.len() {
                    break;
                }
                let width = field.expr().encoded_width();
                let truncated = std::mem::take(&mut columns[i]).truncate(
                    width,
                    shared.core.resolution,
                    truncate_before,
                );
                if !truncated.is_empty() {
                    has_active_sequence = true;
                    buckets += truncated.num_periods(width) as u64;
                }
                columns[i] = truncated;
            }
            if !has_active_sequence {
                // all sequences expired, drop the key
                return Ok(());
            }
            FileStore::encode_row(&mut scratch, key, &columns);
            match &mut sorter {
                Some(sorter) => sorter.push(scratch.clone())?,
                None => out.write_all(&scratch)?,
            }
            Ok(())
        },
    )?;

    if let Some(sorter) = sorter {
        sorter.finish(&mut out)?;
    }

    // unwind the writer chain in order: buffer, snappy frame, file
    out.flush()?;
    let mut encoder = out
        .into_inner()
        .map_err(|e| CadenceError::Io(e.into_error()))?;
    encoder.flush()?;
    let temp = encoder
        .into_inner()
        .map_err(|e| CadenceError::Internal(format!("snappy stream: {}", e.error())))?;

    let new_name = FileStore::next_filename(&shared.opts.dir);
    let persisted = temp.persist(&new_name).map_err(|e| CadenceError::Io(e.error))?;
    let size = persisted.metadata().map(|m| m.len()).unwrap_or(0);

    let new_store = Arc::new(FileStore::with_file(
        &shared.core.fields,
        shared.core.resolution,
        new_name.clone(),
    ));
    {
        let mut state = shared.state.write();
        state.mem_stores.remove(&req.idx);
        state.file_store = new_store;
    }
    shared.archived_buckets.fetch_add(buckets, Ordering::Relaxed);

    info!(
        "Flushed to {} in {:?}, size {}. {}.",
        new_name.display(),
        started.elapsed(),
        size,
        if req.sort { "sorted" } else { "not sorted" }
    );
    Ok(())
}

async fn run_sweeper(dir: PathBuf) {
    let mut tick = tokio::time::interval(config::SWEEP_INTERVAL);
    loop {
        tick.tick().await;
        if let Err(e) = sweep(&dir) {
            warn!("Old-file sweep failed: {}", e);
        }
    }
}

/// Delete superseded row files older than the grace period, always
/// sparing the lexicographically largest (current) one
fn sweep(dir: &Path) -> Result<()> {
    let mut files = FileStore::list_files(dir)?;
    if files.len() <= 1 {
        return Ok(());
    }
    files.pop();
    let now = SystemTime::now();
    for path in files {
        let modified = std::fs::metadata(&path)?.modified()?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age >= config::FILE_GRACE_PERIOD {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Deleted superseded row file {}", path.display()),
                Err(e) => warn!(
                    "Unable to delete old row file {}, still consuming disk space: {}",
                    path.display(),
                    e
                ),
            }
        }
    }
    Ok(())
}
