//! Snappy-compressed row file
//!
//! One file holds every flushed row for a table:
//!
//! ```text
//! headerLength:u32 | headerBytes ("field1,field2,...")
//! rowLength:u64 | keyLength:u16 | keyBytes | numColumns:u16
//!   | col1Len:u64 ... colNLen:u64 | col1Bytes ... colNBytes
//! ```
//!
//! The whole stream, header included, is snappy-framed with a 64KB
//! buffered reader/writer on either side. All integers are little-endian.
//! `rowLength` includes itself; keys go up to 64KB and rows up to 65,536
//! columns.
//!
//! Filenames are `filestore_<unixNanos padded to 20 digits>_<version>.dat`
//! so a lexicographic directory listing is also a chronological one; the
//! largest name is the authoritative store. Files below version 2 carry no
//! header and are read with the table's current schema.

use crate::bytetree::Tree;
use crate::error::{CadenceError, Result};
use crate::sequence::Sequence;
use crate::store::{read_frame, FRAME_PREFIX};
use crate::table::Field;
use crate::types::Timestamp;
use crate::config;
use bytes::{Buf, BufMut};
use snap::read::FrameDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current file format version
pub const FILE_VERSION: u32 = 2;

const FILE_PREFIX: &str = "filestore_";
const FILE_SUFFIX: &str = ".dat";

static NEXT_WALK_CTX: AtomicI64 = AtomicI64::new(1);

fn next_walk_ctx() -> i64 {
    NEXT_WALK_CTX.fetch_add(1, Ordering::Relaxed)
}

/// An immutable view of one on-disk row file: filename plus the schema
/// snapshot needed to map its columns onto the table's fields
pub struct FileStore {
    filename: Option<PathBuf>,
    version: u32,
    fields: Vec<Field>,
    file_fields: Vec<Option<usize>>,
    resolution: i64,
}

impl FileStore {
    /// Open the latest row file in `dir`, reconciling its header schema
    /// with the table's fields. With no file present the store starts
    /// empty.
    pub fn open(dir: &Path, fields: &[Field], resolution: i64) -> Result<FileStore> {
        let filename = Self::latest_file(dir)?;
        let (version, file_fields) = match &filename {
            None => (FILE_VERSION, Vec::new()),
            Some(path) => {
                let version = Self::parse_version(path);
                if version >= 2 {
                    let file = File::open(path)?;
                    let mut r =
                        FrameDecoder::new(BufReader::with_capacity(config::IO_BUFFER_SIZE, file));
                    let header = Self::read_header(&mut r)?;
                    (version, Self::reconcile(path, &header, fields)?)
                } else {
                    // legacy file without a header: assume the current schema
                    (version, (0..fields.len()).map(Some).collect())
                }
            }
        };
        Ok(FileStore {
            filename,
            version,
            fields: fields.to_vec(),
            file_fields,
            resolution,
        })
    }

    /// View of a file this process just wrote: columns are in table order
    pub(crate) fn with_file(fields: &[Field], resolution: i64, filename: PathBuf) -> FileStore {
        FileStore {
            filename: Some(filename),
            version: FILE_VERSION,
            fields: fields.to_vec(),
            file_fields: (0..fields.len()).map(Some).collect(),
            resolution,
        }
    }

    /// The current file, if any
    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    /// Iterate the merged view of this file and the given memstores.
    /// Each file row is joined with matching memstore entries (which are
    /// consumed as seen); afterwards the remaining memstore-only keys are
    /// emitted, cross-merged so every key appears exactly once.
    pub fn iterate<F>(
        &self,
        truncate_before: Timestamp,
        mut mem_stores: Vec<Tree>,
        mut on_row: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8], Vec<Sequence>) -> Result<()>,
    {
        let ctx = next_walk_ctx();

        if let Some(path) = &self.filename {
            match File::open(path) {
                // swept away after this snapshot was taken: nothing to read
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
                Ok(file) => {
                    let mut r =
                        FrameDecoder::new(BufReader::with_capacity(config::IO_BUFFER_SIZE, file));
                    if self.version >= 2 {
                        Self::read_header(&mut r)?;
                    }
                    while let Some(row) = read_frame(&mut r)? {
                        let (key, file_columns) = self.decode_row(&row)?;
                        let mut columns: Vec<Sequence> =
                            vec![Sequence::new(); self.fields.len()];
                        for (ci, seq) in file_columns.into_iter().enumerate() {
                            if let Some(Some(ti)) = self.file_fields.get(ci) {
                                columns[*ti] = seq;
                            }
                        }
                        for ms in mem_stores.iter_mut() {
                            if let Some(others) = ms.remove(ctx, key) {
                                self.merge_columns(&mut columns, others, truncate_before);
                            }
                        }
                        on_row(key, columns)?;
                    }
                }
            }
        }

        // remaining keys only the memstores know about
        for i in 0..mem_stores.len() {
            let (head, tail) = mem_stores.split_at_mut(i + 1);
            let ms = &mut head[i];
            let mut result = Ok(());
            ms.walk(ctx, &mut |key, data| {
                if result.is_err() {
                    return true;
                }
                let mut columns = data.to_vec();
                for other in tail.iter_mut() {
                    if let Some(others) = other.remove(ctx, key) {
                        self.merge_columns(&mut columns, others, truncate_before);
                    }
                }
                result = on_row(key, columns);
                false
            });
            result?;
        }

        Ok(())
    }

    fn merge_columns(
        &self,
        columns: &mut Vec<Sequence>,
        others: Vec<Sequence>,
        truncate_before: Timestamp,
    ) {
        for (i, other) in others.into_iter().enumerate() {
            if i >= self.fields.len() {
                break;
            }
            if columns.len() <= i {
                columns.resize_with(i + 1, Sequence::new);
            }
            let current = std::mem::take(&mut columns[i]);
            columns[i] = current.merge(
                other,
                self.fields[i].expr(),
                self.resolution,
                truncate_before,
            );
        }
    }

    fn decode_row<'a>(&self, row: &'a [u8]) -> Result<(&'a [u8], Vec<Sequence>)> {
        let corrupt = || CadenceError::Corruption("truncated row".to_string());
        let mut buf = &row[FRAME_PREFIX..];
        if buf.remaining() < 2 {
            return Err(corrupt());
        }
        let key_len = buf.get_u16_le() as usize;
        if buf.remaining() < key_len + 2 {
            return Err(corrupt());
        }
        let key = &buf[..key_len];
        buf.advance(key_len);
        let num_columns = buf.get_u16_le() as usize;
        if buf.remaining() < num_columns * 8 {
            return Err(corrupt());
        }
        let lengths: Vec<usize> = (0..num_columns)
            .map(|_| buf.get_u64_le() as usize)
            .collect();
        let mut columns = Vec::with_capacity(num_columns);
        for len in lengths {
            if buf.remaining() < len {
                return Err(corrupt());
            }
            columns.push(Sequence::from_bytes(buf[..len].to_vec()));
            buf.advance(len);
        }
        Ok((key, columns))
    }

    /// Encode one row into `buf` (cleared first)
    pub(crate) fn encode_row(buf: &mut Vec<u8>, key: &[u8], columns: &[Sequence]) {
        let row_length = FRAME_PREFIX
            + 2
            + key.len()
            + 2
            + columns.len() * 8
            + columns.iter().map(|c| c.len()).sum::<usize>();
        buf.clear();
        buf.reserve(row_length);
        buf.put_u64_le(row_length as u64);
        buf.put_u16_le(key.len() as u16);
        buf.put_slice(key);
        buf.put_u16_le(columns.len() as u16);
        for column in columns {
            buf.put_u64_le(column.len() as u64);
        }
        for column in columns {
            buf.put_slice(column.as_bytes());
        }
    }

    /// Write the schema header for the current field set
    pub(crate) fn write_header(w: &mut impl Write, fields: &[Field]) -> io::Result<()> {
        let header = fields
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",");
        w.write_all(&(header.len() as u32).to_le_bytes())?;
        w.write_all(header.as_bytes())
    }

    fn read_header(r: &mut impl Read) -> Result<Vec<String>> {
        let mut len_bytes = [0u8; 4];
        r.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > 1 << 20 {
            return Err(CadenceError::InvalidFormat(format!(
                "implausible header length {}",
                len
            )));
        }
        let mut header = vec![0u8; len];
        r.read_exact(&mut header)?;
        let header = String::from_utf8(header)
            .map_err(|e| CadenceError::InvalidFormat(e.to_string()))?;
        Ok(header.split(',').map(|s| s.to_string()).collect())
    }

    /// Map file columns onto table fields by their `name:EXPR` strings.
    /// Columns unknown to the table are dropped on read; a known name with
    /// a different expression is a schema mismatch.
    fn reconcile(
        path: &Path,
        header_fields: &[String],
        fields: &[Field],
    ) -> Result<Vec<Option<usize>>> {
        let mut mapping = Vec::with_capacity(header_fields.len());
        for header_field in header_fields {
            match fields.iter().position(|f| f.to_string() == *header_field) {
                Some(i) => mapping.push(Some(i)),
                None => {
                    let file_name = header_field.split(':').next().unwrap_or_default();
                    if fields.iter().any(|f| f.name() == file_name) {
                        return Err(CadenceError::SchemaMismatch {
                            file: path.display().to_string(),
                            field: header_field.clone(),
                        });
                    }
                    mapping.push(None);
                }
            }
        }
        Ok(mapping)
    }

    /// Name for a newly flushed file, stamped with the current wall clock
    pub(crate) fn next_filename(dir: &Path) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        dir.join(format!(
            "{}{:020}_{}{}",
            FILE_PREFIX, now, FILE_VERSION, FILE_SUFFIX
        ))
    }

    /// Version tag embedded in a filename; names without one are version 0
    pub(crate) fn parse_version(path: &Path) -> u32 {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(FILE_PREFIX))
            .and_then(|n| n.strip_suffix(FILE_SUFFIX))
            .and_then(|n| n.split('_').nth(1))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// All row files in `dir`, lexicographically sorted (oldest first)
    pub(crate) fn list_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !dir.exists() {
            return Ok(files);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX) {
                    files.push(entry.path());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    fn latest_file(dir: &Path) -> io::Result<Option<PathBuf>> {
        Ok(Self::list_files(dir)?.pop())
    }
}
