//! External merge sort over length-prefixed rows
//!
//! Rows are buffered in memory up to a limit, spilled as sorted runs to
//! unlinked temp files, and merged k-way on finish. Ordering is a plain
//! bytewise comparison of whole encoded rows, the same comparison the
//! sorted filestore is read back with.

use super::read_frame;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Seek, Write};
use std::path::PathBuf;

/// Chunked external sorter bounded to roughly `mem_limit` buffered bytes
pub struct ExternalSorter {
    mem_limit: usize,
    mem_bytes: usize,
    rows: Vec<Vec<u8>>,
    chunks: Vec<File>,
    dir: PathBuf,
}

impl ExternalSorter {
    /// Create a sorter spilling runs into `dir` once `mem_limit` bytes of
    /// rows are buffered
    pub fn new(mem_limit: usize, dir: impl Into<PathBuf>) -> Self {
        Self {
            mem_limit: mem_limit.max(1),
            mem_bytes: 0,
            rows: Vec::new(),
            chunks: Vec::new(),
            dir: dir.into(),
        }
    }

    /// Buffer one encoded row
    pub fn push(&mut self, row: Vec<u8>) -> io::Result<()> {
        self.mem_bytes += row.len();
        self.rows.push(row);
        if self.mem_bytes >= self.mem_limit {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> io::Result<()> {
        if self.rows.is_empty() {
            return Ok(());
        }
        self.rows.sort_unstable();
        let mut file = tempfile::tempfile_in(&self.dir)?;
        {
            let mut w = BufWriter::new(&mut file);
            for row in &self.rows {
                w.write_all(row)?;
            }
            w.flush()?;
        }
        file.rewind()?;
        self.chunks.push(file);
        self.rows.clear();
        self.mem_bytes = 0;
        Ok(())
    }

    /// Sort everything buffered and stream the merged rows to `out`
    pub fn finish(mut self, out: &mut impl Write) -> io::Result<()> {
        if self.chunks.is_empty() {
            self.rows.sort_unstable();
            for row in &self.rows {
                out.write_all(row)?;
            }
            return Ok(());
        }

        self.spill()?;
        let mut readers: Vec<BufReader<File>> =
            self.chunks.drain(..).map(BufReader::new).collect();
        let mut heap: BinaryHeap<Reverse<(Vec<u8>, usize)>> = BinaryHeap::new();
        for (i, r) in readers.iter_mut().enumerate() {
            if let Some(row) = read_frame(r)? {
                heap.push(Reverse((row, i)));
            }
        }
        while let Some(Reverse((row, i))) = heap.pop() {
            out.write_all(&row)?;
            if let Some(next) = read_frame(&mut readers[i])? {
                heap.push(Reverse((next, i)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut row = Vec::new();
        row.extend_from_slice(&((body.len() + 8) as u64).to_le_bytes());
        row.extend_from_slice(body);
        row
    }

    fn sorted_bodies(mem_limit: usize, bodies: &[&[u8]]) -> Vec<Vec<u8>> {
        let dir = TempDir::new().unwrap();
        let mut sorter = ExternalSorter::new(mem_limit, dir.path());
        for body in bodies {
            sorter.push(frame(body)).unwrap();
        }
        let mut out = Vec::new();
        sorter.finish(&mut out).unwrap();

        let mut r = &out[..];
        let mut result = Vec::new();
        while let Some(row) = read_frame(&mut r).unwrap() {
            result.push(row[8..].to_vec());
        }
        result
    }

    #[test]
    fn test_in_memory_sort() {
        let result = sorted_bodies(1 << 20, &[b"delta", b"alpha", b"gamma", b"bravo"]);
        let want: Vec<Vec<u8>> = [b"alpha", b"bravo", b"delta", b"gamma"]
            .iter()
            .map(|b| b.to_vec())
            .collect();
        assert_eq!(result, want);
    }

    #[test]
    fn test_spilled_merge() {
        // a tiny limit forces a spill after every row
        let result = sorted_bodies(1, &[b"delta", b"alpha", b"gamma", b"bravo"]);
        let want: Vec<Vec<u8>> = [b"alpha", b"bravo", b"delta", b"gamma"]
            .iter()
            .map(|b| b.to_vec())
            .collect();
        assert_eq!(result, want);
    }

    #[test]
    fn test_duplicates_survive() {
        let result = sorted_bodies(16, &[b"kk", b"aa", b"kk", b"aa"]);
        let want: Vec<Vec<u8>> = [b"aa", b"aa", b"kk", b"kk"]
            .iter()
            .map(|b| b.to_vec())
            .collect();
        assert_eq!(result, want);
    }
}
