//! Row store: two-level write path
//!
//! Writes populate an in-memory radix memstore; a background flusher
//! periodically retires the current memstore and streams it, merged with
//! the prior filestore, into a new snappy-compressed file. Reads iterate
//! memstores plus the filestore as one merged view.

mod emsort;
mod filestore;
mod rowstore;

pub use emsort::ExternalSorter;
pub use filestore::{FileStore, FILE_VERSION};
pub use rowstore::{RowStore, RowStoreOptions};

pub(crate) use rowstore::InsertRequest;

use std::io::{self, Read};

/// Width of the row-length prefix every framed row starts with
pub(crate) const FRAME_PREFIX: usize = 8;

/// Read one length-prefixed row, returning the full frame including its
/// prefix. `Ok(None)` signals clean end of stream; a partial prefix or a
/// short body is an error.
pub(crate) fn read_frame(r: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; FRAME_PREFIX];
    let mut filled = 0;
    while filled < FRAME_PREFIX {
        let n = r.read(&mut prefix[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated row length",
            ));
        }
        filled += n;
    }
    let row_length = u64::from_le_bytes(prefix) as usize;
    if row_length < FRAME_PREFIX {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("row length {} below prefix width", row_length),
        ));
    }
    let mut row = vec![0u8; row_length];
    row[..FRAME_PREFIX].copy_from_slice(&prefix);
    r.read_exact(&mut row[FRAME_PREFIX..])?;
    Ok(Some(row))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_frame() {
        let mut data = Vec::new();
        data.extend_from_slice(&12u64.to_le_bytes());
        data.extend_from_slice(b"abcd");
        data.extend_from_slice(&9u64.to_le_bytes());
        data.push(b'z');

        let mut r = &data[..];
        assert_eq!(read_frame(&mut r).unwrap().unwrap()[FRAME_PREFIX..], *b"abcd");
        assert_eq!(read_frame(&mut r).unwrap().unwrap()[FRAME_PREFIX..], *b"z");
        assert!(read_frame(&mut r).unwrap().is_none());
    }

    #[test]
    fn test_read_frame_truncated() {
        let mut data = Vec::new();
        data.extend_from_slice(&20u64.to_le_bytes());
        data.extend_from_slice(b"short");
        let mut r = &data[..];
        assert!(read_frame(&mut r).is_err());
    }
}
