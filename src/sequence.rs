//! Time-bucketed sequence codec
//!
//! A sequence is one contiguous byte buffer holding per-period aggregator
//! states for a single (key, field) pair:
//!
//! ```text
//! start:i64 | period 0 state | period 1 state | ...
//! ```
//!
//! Periods are stored newest-first: index 0 is the bucket at `start`, index
//! i the bucket `i * resolution` older. Every state slot is exactly the
//! field expression's encoded width. The empty sequence is a zero-length
//! buffer. Updates and merges consume the sequence by value and return the
//! (possibly reallocated) result; callers replace their slot with it.

use crate::bytemap::ByteMap;
use crate::expr::{Expr, Params};
use crate::types::{align, Timestamp};
use bytes::Buf;

/// Bytes reserved for the start timestamp header
const START_WIDTH: usize = 8;

/// A newest-first vector of per-period aggregator states
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Sequence(Vec<u8>);

impl Sequence {
    /// The empty sequence
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Reconstruct from raw encoded bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The raw encoded bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encoded length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Timestamp of the newest bucket (period 0)
    pub fn start(&self) -> Timestamp {
        (&self.0[..START_WIDTH]).get_i64_le()
    }

    fn set_start(&mut self, ts: Timestamp) {
        self.0[..START_WIDTH].copy_from_slice(&ts.to_le_bytes());
    }

    /// Number of period slots for a state width
    pub fn num_periods(&self, width: usize) -> usize {
        if width == 0 || self.0.len() < START_WIDTH {
            return 0;
        }
        (self.0.len() - START_WIDTH) / width
    }

    fn slot(&self, i: usize, width: usize) -> &[u8] {
        &self.0[START_WIDTH + i * width..START_WIDTH + (i + 1) * width]
    }

    fn slot_mut(&mut self, i: usize, width: usize) -> &mut [u8] {
        &mut self.0[START_WIDTH + i * width..START_WIDTH + (i + 1) * width]
    }

    /// Apply one event at `ts` to the bucket it aligns into, growing the
    /// sequence forward (prepend) or backward (append) as needed, then
    /// enforce retention.
    pub fn update(
        mut self,
        ts: Timestamp,
        params: &dyn Params,
        metadata: Option<&ByteMap>,
        e: &Expr,
        resolution: i64,
        truncate_before: Timestamp,
    ) -> Sequence {
        let width = e.encoded_width();
        let ts = align(ts, resolution);

        if self.is_empty() {
            let mut created = Sequence(vec![0u8; START_WIDTH + width]);
            created.set_start(ts);
            e.update(created.slot_mut(0, width), params, metadata);
            return created.truncate(width, resolution, truncate_before);
        }

        let start = self.start();
        if ts > start {
            // point is newer than the head: prepend new period slots
            let delta = ((ts - start) / resolution) as usize;
            let mut grown = Sequence(vec![0u8; self.0.len() + delta * width]);
            grown.0[START_WIDTH + delta * width..].copy_from_slice(&self.0[START_WIDTH..]);
            grown.set_start(ts);
            e.update(grown.slot_mut(0, width), params, metadata);
            return grown.truncate(width, resolution, truncate_before);
        }

        let idx = ((start - ts) / resolution) as usize;
        if idx >= self.num_periods(width) {
            // point is older than the tail: append, unless already expired
            if ts <= truncate_before {
                return self.truncate(width, resolution, truncate_before);
            }
            self.0.resize(START_WIDTH + (idx + 1) * width, 0);
        }
        e.update(self.slot_mut(idx, width), params, metadata);
        self.truncate(width, resolution, truncate_before)
    }

    /// Drop periods older than `truncate_before`. A sequence whose start
    /// is itself beyond retention collapses to empty.
    pub fn truncate(
        mut self,
        width: usize,
        resolution: i64,
        truncate_before: Timestamp,
    ) -> Sequence {
        if self.is_empty() {
            return self;
        }
        let start = self.start();
        if start <= truncate_before {
            return Sequence::new();
        }
        let span = start.saturating_sub(truncate_before);
        let max_periods = ((span + resolution - 1) / resolution) as usize;
        if width > 0 && self.num_periods(width) > max_periods {
            self.0.truncate(START_WIDTH + max_periods * width);
        }
        self
    }

    /// Associatively merge two sequences for the same key and field. The
    /// result starts at the newer of the two heads and covers every bucket
    /// either side covers, bounded by retention.
    pub fn merge(
        self,
        other: Sequence,
        e: &Expr,
        resolution: i64,
        truncate_before: Timestamp,
    ) -> Sequence {
        let width = e.encoded_width();
        if self.is_empty() {
            return other.truncate(width, resolution, truncate_before);
        }
        if other.is_empty() {
            return self.truncate(width, resolution, truncate_before);
        }

        let (a, b) = if self.start() >= other.start() {
            (self, other)
        } else {
            (other, self)
        };
        let start = a.start();
        if start <= truncate_before {
            return Sequence::new();
        }

        let na = a.num_periods(width);
        let nb = b.num_periods(width);
        let earliest_a = start - (na as i64 - 1) * resolution;
        let earliest_b = b.start() - (nb as i64 - 1) * resolution;
        let total = ((start - earliest_a.min(earliest_b)) / resolution + 1) as usize;

        let span = start.saturating_sub(truncate_before);
        let max_periods = ((span + resolution - 1) / resolution) as usize;
        let total = total.min(max_periods);

        let offset_b = ((start - b.start()) / resolution) as usize;
        let mut merged = Sequence(vec![0u8; START_WIDTH + total * width]);
        merged.set_start(start);
        for i in 0..total {
            let in_a = i < na;
            let bi = i.checked_sub(offset_b).filter(|bi| *bi < nb);
            match (in_a, bi) {
                (true, Some(bi)) => {
                    e.merge(merged.slot_mut(i, width), a.slot(i, width), b.slot(bi, width))
                }
                (true, None) => merged.slot_mut(i, width).copy_from_slice(a.slot(i, width)),
                (false, Some(bi)) => {
                    merged.slot_mut(i, width).copy_from_slice(b.slot(bi, width))
                }
                (false, None) => {}
            }
        }
        merged
    }

    /// Derived value for period `i`, plus whether its state was ever set
    pub fn value_at(&self, i: usize, e: &Expr) -> (f64, bool) {
        let width = e.encoded_width();
        if i >= self.num_periods(width) {
            return (0.0, false);
        }
        e.get(self.slot(i, width))
    }

    /// Derived value for the bucket `ts` aligns into
    pub fn value_at_time(&self, ts: Timestamp, e: &Expr, resolution: i64) -> (f64, bool) {
        if self.is_empty() {
            return (0.0, false);
        }
        let ts = align(ts, resolution);
        if ts > self.start() {
            return (0.0, false);
        }
        self.value_at(((self.start() - ts) / resolution) as usize, e)
    }

    /// Raw state slice for period `i`
    pub fn data_at(&self, i: usize, e: &Expr) -> Option<&[u8]> {
        let width = e.encoded_width();
        if i >= self.num_periods(width) {
            return None;
        }
        Some(self.slot(i, width))
    }

    /// Merge a foreign state into period `i` in place
    pub fn merge_value_at(&mut self, i: usize, e: &Expr, other: &[u8]) {
        let width = e.encoded_width();
        if i >= self.num_periods(width) {
            return;
        }
        let mine = self.slot(i, width).to_vec();
        let mut combined = vec![0u8; width];
        e.merge(&mut combined, &mine, other);
        self.slot_mut(i, width).copy_from_slice(&combined);
    }
}
