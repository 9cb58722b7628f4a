//! Tag dictionary
//!
//! Every unique tag body is interned to a dense 32-bit id starting at 1.
//! Entity blocks store tag ids plus per-tag timestamps, never raw strings.
//!
//! On-disk segment:
//!
//! ```text
//! ┌──────────────┬─────────────────────────────────────────┐
//! │ count (4 B)  │ count × { id: 4 B, len: 2 B, bytes }    │
//! └──────────────┴─────────────────────────────────────────┘
//! ```
//!
//! The segment is self-contained and reloadable without the rest of the
//! file, which recovery relies on.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use entitydb_core::Error;
use rustc_hash::FxHashMap;
use std::io::Cursor;
use thiserror::Error;

/// Largest encodable tag body, limited by the 2-byte length prefix
pub const MAX_TAG_BODY_BYTES: usize = u16::MAX as usize;

/// Dictionary codec and interning failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DictionaryError {
    /// The 32-bit id space is exhausted
    #[error("dictionary overflow at {0} entries")]
    Overflow(u64),

    /// A body exceeds the 2-byte length prefix
    #[error("tag body of {0} bytes exceeds the dictionary limit")]
    BodyTooLong(usize),

    /// Segment ended mid-entry
    #[error("truncated dictionary segment")]
    Truncated,

    /// Entry ids must be dense from 1 in segment order
    #[error("non-dense dictionary id {found}, expected {expected}")]
    NonDenseId {
        /// Id read from the segment
        found: u32,
        /// Id that was expected
        expected: u32,
    },

    /// A body was not valid UTF-8
    #[error("dictionary entry {0} is not valid UTF-8")]
    InvalidUtf8(u32),
}

impl From<DictionaryError> for Error {
    fn from(e: DictionaryError) -> Self {
        match e {
            DictionaryError::Overflow(count) => Error::DictOverflow { count },
            other => Error::CorruptHeader {
                reason: format!("dictionary: {}", other),
            },
        }
    }
}

/// In-memory tag dictionary: body ↔ dense u32 id
#[derive(Debug, Default, Clone)]
pub struct TagDict {
    by_body: FxHashMap<String, u32>,
    by_id: Vec<String>,
}

impl TagDict {
    /// An empty dictionary
    pub fn new() -> Self {
        TagDict::default()
    }

    /// Number of interned bodies
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// True if nothing is interned yet
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Intern a body, returning its id; existing bodies return their
    /// original id
    pub fn intern(&mut self, body: &str) -> Result<u32, DictionaryError> {
        if let Some(&id) = self.by_body.get(body) {
            return Ok(id);
        }
        if body.len() > MAX_TAG_BODY_BYTES {
            return Err(DictionaryError::BodyTooLong(body.len()));
        }
        if self.by_id.len() >= u32::MAX as usize {
            return Err(DictionaryError::Overflow(self.by_id.len() as u64));
        }
        let id = self.by_id.len() as u32 + 1;
        self.by_id.push(body.to_owned());
        self.by_body.insert(body.to_owned(), id);
        Ok(id)
    }

    /// Resolve an id back to its body
    pub fn resolve(&self, id: u32) -> Option<&str> {
        if id == 0 {
            return None;
        }
        self.by_id.get(id as usize - 1).map(String::as_str)
    }

    /// The id of an already-interned body
    pub fn lookup(&self, body: &str) -> Option<u32> {
        self.by_body.get(body).copied()
    }

    /// Encode only the entries with id ≥ `first_id`, in the segment format
    ///
    /// This is the WAL delta written alongside blocks that reference
    /// bodies interned since the last checkpoint.
    pub fn encode_entries_from(&self, first_id: u32) -> Vec<u8> {
        let start = (first_id.max(1) as usize) - 1;
        let entries = self.by_id.get(start..).unwrap_or(&[]);
        let mut out =
            Vec::with_capacity(4 + entries.iter().map(|b| 6 + b.len()).sum::<usize>());
        out.write_u32::<LittleEndian>(entries.len() as u32)
            .expect("vec write");
        for (offset, body) in entries.iter().enumerate() {
            out.write_u32::<LittleEndian>(first_id.max(1) + offset as u32)
                .expect("vec write");
            out.write_u16::<LittleEndian>(body.len() as u16)
                .expect("vec write");
            out.extend_from_slice(body.as_bytes());
        }
        out
    }

    /// Apply a delta produced by [`TagDict::encode_entries_from`]
    ///
    /// Idempotent: entries whose id is already interned must carry the
    /// same body; entries one past the end extend the dictionary.
    pub fn apply_delta(&mut self, bytes: &[u8]) -> Result<(), DictionaryError> {
        let mut cursor = Cursor::new(bytes);
        let count = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| DictionaryError::Truncated)?;

        for _ in 0..count {
            let id = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| DictionaryError::Truncated)?;
            let len = cursor
                .read_u16::<LittleEndian>()
                .map_err(|_| DictionaryError::Truncated)? as usize;
            let pos = cursor.position() as usize;
            let end = pos
                .checked_add(len)
                .filter(|&e| e <= bytes.len())
                .ok_or(DictionaryError::Truncated)?;
            let body = std::str::from_utf8(&bytes[pos..end])
                .map_err(|_| DictionaryError::InvalidUtf8(id))?;
            cursor.set_position(end as u64);

            if self.resolve(id) == Some(body) {
                continue;
            }
            if id as usize == self.by_id.len() + 1 {
                self.by_id.push(body.to_owned());
                self.by_body.insert(body.to_owned(), id);
            } else {
                return Err(DictionaryError::NonDenseId {
                    found: id,
                    expected: self.by_id.len() as u32 + 1,
                });
            }
        }
        Ok(())
    }

    /// Encode the on-disk segment
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.by_id.iter().map(|b| 6 + b.len()).sum::<usize>());
        out.write_u32::<LittleEndian>(self.by_id.len() as u32)
            .expect("vec write");
        for (i, body) in self.by_id.iter().enumerate() {
            out.write_u32::<LittleEndian>(i as u32 + 1).expect("vec write");
            out.write_u16::<LittleEndian>(body.len() as u16)
                .expect("vec write");
            out.extend_from_slice(body.as_bytes());
        }
        out
    }

    /// Decode an on-disk segment
    pub fn decode(bytes: &[u8]) -> Result<TagDict, DictionaryError> {
        let mut cursor = Cursor::new(bytes);
        let count = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| DictionaryError::Truncated)?;

        let mut dict = TagDict {
            by_body: FxHashMap::default(),
            by_id: Vec::with_capacity(count as usize),
        };

        for expected in 1..=count {
            let id = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| DictionaryError::Truncated)?;
            if id != expected {
                return Err(DictionaryError::NonDenseId {
                    found: id,
                    expected,
                });
            }
            let len = cursor
                .read_u16::<LittleEndian>()
                .map_err(|_| DictionaryError::Truncated)? as usize;

            let pos = cursor.position() as usize;
            let end = pos
                .checked_add(len)
                .filter(|&e| e <= bytes.len())
                .ok_or(DictionaryError::Truncated)?;
            let body = std::str::from_utf8(&bytes[pos..end])
                .map_err(|_| DictionaryError::InvalidUtf8(id))?
                .to_owned();
            cursor.set_position(end as u64);

            dict.by_body.insert(body.clone(), id);
            dict.by_id.push(body);
        }
        Ok(dict)
    }
}
