//! Binary-sortable byte-map codec
//!
//! Serializes a string-keyed map of values into one contiguous byte slice.
//! Entries are laid out sorted by key, so two maps with the same keys
//! compare bytewise the way their values compare entry by entry, which is
//! what lets the row store treat dimension tuples as opaque sortable keys.
//!
//! Entry layout (little-endian): `keyLen:u16 | keyBytes | tag:u8 | payload`
//! where the payload is fixed-width for bools/ints/floats and
//! `len:u16 | bytes` for strings.

use crate::types::Value;
use bytes::{Buf, BufMut};
use std::collections::BTreeMap;
use std::fmt;

const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STR: u8 = 4;

/// An immutable, binary-sortable encoding of a string->value map
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ByteMap(Vec<u8>);

impl ByteMap {
    /// Encode a map of values. Entries are written in key order.
    pub fn new(entries: &BTreeMap<String, Value>) -> Self {
        let mut buf = Vec::with_capacity(entries.len() * 16);
        for (key, value) in entries {
            buf.put_u16_le(key.len() as u16);
            buf.put_slice(key.as_bytes());
            match value {
                Value::Bool(v) => {
                    buf.put_u8(TAG_BOOL);
                    buf.put_u8(*v as u8);
                }
                Value::Int(v) => {
                    buf.put_u8(TAG_INT);
                    buf.put_i64_le(*v);
                }
                Value::Float(v) => {
                    buf.put_u8(TAG_FLOAT);
                    buf.put_f64_le(*v);
                }
                Value::Str(v) => {
                    buf.put_u8(TAG_STR);
                    buf.put_u16_le(v.len() as u16);
                    buf.put_slice(v.as_bytes());
                }
            }
        }
        Self(buf)
    }

    /// Encode a map of float measurements
    pub fn from_floats(entries: &BTreeMap<String, f64>) -> Self {
        let converted = entries
            .iter()
            .map(|(k, v)| (k.clone(), Value::Float(*v)))
            .collect();
        Self::new(&converted)
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

    /// Look up a single entry by key
    pub fn get(&self, field: &str) -> Option<Value> {
        let mut entries = Entries(&self.0);
        entries.find_map(|(key, value)| if key == field { Some(value) } else { None })
    }

    /// Decode every entry back into a map
    pub fn as_map(&self) -> BTreeMap<String, Value> {
        Entries(&self.0)
            .map(|(key, value)| (key.to_string(), value))
            .collect()
    }
}

impl fmt::Display for ByteMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_map())
    }
}

/// Iterator over decoded entries; stops at the first malformed entry
struct Entries<'a>(&'a [u8]);

impl<'a> Iterator for Entries<'a> {
    type Item = (&'a str, Value);

    fn next(&mut self) -> Option<Self::Item> {
        if self.0.remaining() < 3 {
            return None;
        }
        let key_len = self.0.get_u16_le() as usize;
        if self.0.remaining() < key_len + 1 {
            return None;
        }
        let key = std::str::from_utf8(&self.0[..key_len]).ok()?;
        self.0.advance(key_len);
        let tag = self.0.get_u8();
        let value = match tag {
            TAG_BOOL if self.0.remaining() >= 1 => Value::Bool(self.0.get_u8() == 1),
            TAG_INT if self.0.remaining() >= 8 => Value::Int(self.0.get_i64_le()),
            TAG_FLOAT if self.0.remaining() >= 8 => Value::Float(self.0.get_f64_le()),
            TAG_STR if self.0.remaining() >= 2 => {
                let len = self.0.get_u16_le() as usize;
                if self.0.remaining() < len {
                    return None;
                }
                let s = std::str::from_utf8(&self.0[..len]).ok()?.to_string();
                self.0.advance(len);
                Value::Str(s)
            }
            _ => return None,
        };
        Some((key, value))
    }
}
