//! Entity index
//!
//! The on-disk index segment holds fixed-size 32-byte entries:
//!
//! ```text
//! ┌───────────────┬──────────────┬──────────┬───────────┐
//! │ key (16 B)    │ offset (8 B) │ size 4 B │ flags 4 B │
//! └───────────────┴──────────────┴──────────┴───────────┘
//! ```
//!
//! `key` is the canonical 16-byte id form; ids longer than 16 raw bytes
//! are keyed by a SHA-256 prefix and the segment carries an overflow side
//! table mapping those keys back to full strings. Segment layout:
//!
//! ```text
//! entry_count: u32
//! entry_count × 32 B entries (sorted by key bytes)
//! overflow_count: u32
//! overflow_count × { key: 16 B, len: u16, id bytes }
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use entitydb_core::{Entity, EntityId, Error, IndexKey};
use rustc_hash::FxHashMap;
use std::io::Cursor;
use thiserror::Error;

/// Flag bits of an index entry
pub mod flags {
    /// Entity is deleted; readers skip it except via history queries
    pub const TOMBSTONE: u32 = 1;
    /// Content lives in chunk children, not inline
    pub const CHUNKED: u32 = 1 << 1;
    /// Entry changed since the last checkpoint
    pub const DIRTY: u32 = 1 << 2;
    /// Key is a SHA-256 prefix; the full id is in the overflow table
    pub const HASHED_ID: u32 = 1 << 3;
}

/// Size of one on-disk index entry
pub const INDEX_ENTRY_SIZE: usize = 32;

/// One entity's index entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Canonical 16-byte key
    pub key: IndexKey,
    /// File offset of the latest data block
    pub offset: u64,
    /// Byte length of that block
    pub size: u32,
    /// Flag bits
    pub flags: u32,
}

impl IndexEntry {
    /// True if the tombstone bit is set
    pub fn is_tombstoned(&self) -> bool {
        self.flags & flags::TOMBSTONE != 0
    }

    /// True if the chunked bit is set
    pub fn is_chunked(&self) -> bool {
        self.flags & flags::CHUNKED != 0
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.key.as_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> IndexEntry {
        let key: [u8; 16] = bytes[0..16].try_into().unwrap();
        IndexEntry {
            key: IndexKey::from_bytes(key),
            offset: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            size: u32::from_le_bytes(bytes[24..28].try_into().unwrap()),
            flags: u32::from_le_bytes(bytes[28..32].try_into().unwrap()),
        }
    }
}

/// Index segment failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    /// Segment ended mid-entry
    #[error("truncated index segment")]
    Truncated,

    /// A hashed key had no overflow table entry
    #[error("hashed index key {0} has no overflow entry")]
    MissingOverflow(String),

    /// A short key could not be decoded back to an id string
    #[error("index key {0} does not decode to an id")]
    UndecodableKey(String),

    /// An overflow id failed validation
    #[error("overflow id invalid: {0}")]
    InvalidId(String),
}

impl From<IndexError> for Error {
    fn from(e: IndexError) -> Self {
        Error::CorruptHeader {
            reason: format!("index: {}", e),
        }
    }
}

/// In-memory entity index: id → latest block location
#[derive(Debug, Default, Clone)]
pub struct EntityIndex {
    entries: FxHashMap<EntityId, IndexEntry>,
}

impl EntityIndex {
    /// An empty index
    pub fn new() -> Self {
        EntityIndex::default()
    }

    /// Total entries, tombstones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no entries exist
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose tombstone bit is clear
    pub fn live_len(&self) -> usize {
        self.entries.values().filter(|e| !e.is_tombstoned()).count()
    }

    /// Insert or replace the entry for `id`
    pub fn upsert(&mut self, id: EntityId, offset: u64, size: u32, mut entry_flags: u32) {
        let key = id.index_key();
        if id.is_hashed() {
            entry_flags |= flags::HASHED_ID;
        }
        self.entries.insert(
            id,
            IndexEntry {
                key,
                offset,
                size,
                flags: entry_flags | flags::DIRTY,
            },
        );
    }

    /// Look up an entry
    pub fn get(&self, id: &EntityId) -> Option<&IndexEntry> {
        self.entries.get(id)
    }

    /// True if `id` has an entry, tombstoned or not
    pub fn contains(&self, id: &EntityId) -> bool {
        self.entries.contains_key(id)
    }

    /// Set the tombstone bit; returns false if the id is unknown
    pub fn tombstone(&mut self, id: &EntityId) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.flags |= flags::TOMBSTONE | flags::DIRTY;
                true
            }
            None => false,
        }
    }

    /// Remove an entry entirely (compaction only)
    pub fn remove(&mut self, id: &EntityId) -> Option<IndexEntry> {
        self.entries.remove(id)
    }

    /// Iterate over all entries
    pub fn iter(&self) -> impl Iterator<Item = (&EntityId, &IndexEntry)> {
        self.entries.iter()
    }

    /// Ids of live (non-tombstoned) entities
    pub fn live_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.is_tombstoned())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Clear every dirty bit (after a checkpoint persists the index)
    pub fn clear_dirty(&mut self) {
        for entry in self.entries.values_mut() {
            entry.flags &= !flags::DIRTY;
        }
    }

    /// Encode the on-disk segment
    pub fn encode(&self) -> Vec<u8> {
        let mut sorted: Vec<(&EntityId, &IndexEntry)> = self.entries.iter().collect();
        sorted.sort_by(|a, b| a.1.key.as_bytes().cmp(b.1.key.as_bytes()));

        let mut out = Vec::with_capacity(8 + sorted.len() * INDEX_ENTRY_SIZE);
        out.write_u32::<LittleEndian>(sorted.len() as u32)
            .expect("vec write");
        for (_, entry) in &sorted {
            // The dirty bit is volatile state, never persisted.
            let mut entry = (*entry).clone();
            entry.flags &= !flags::DIRTY;
            entry.encode_into(&mut out);
        }

        let overflow: Vec<(&EntityId, &IndexEntry)> = sorted
            .iter()
            .filter(|(_, e)| e.flags & flags::HASHED_ID != 0)
            .cloned()
            .collect();
        out.write_u32::<LittleEndian>(overflow.len() as u32)
            .expect("vec write");
        for (id, entry) in overflow {
            out.extend_from_slice(entry.key.as_bytes());
            out.write_u16::<LittleEndian>(id.as_bytes().len() as u16)
                .expect("vec write");
            out.extend_from_slice(id.as_bytes());
        }
        out
    }

    /// Decode an on-disk segment
    pub fn decode(bytes: &[u8]) -> Result<EntityIndex, IndexError> {
        let mut cursor = Cursor::new(bytes);
        let count = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| IndexError::Truncated)? as usize;

        let entries_end = 4usize
            .checked_add(count.checked_mul(INDEX_ENTRY_SIZE).ok_or(IndexError::Truncated)?)
            .filter(|&e| e <= bytes.len())
            .ok_or(IndexError::Truncated)?;

        let mut raw = Vec::with_capacity(count);
        for i in 0..count {
            let start = 4 + i * INDEX_ENTRY_SIZE;
            raw.push(IndexEntry::decode(&bytes[start..start + INDEX_ENTRY_SIZE]));
        }
        cursor.set_position(entries_end as u64);

        // Overflow side table: hashed key → full id.
        let overflow_count = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| IndexError::Truncated)?;
        let mut overflow: FxHashMap<[u8; 16], String> = FxHashMap::default();
        for _ in 0..overflow_count {
            let mut key = [0u8; 16];
            std::io::Read::read_exact(&mut cursor, &mut key).map_err(|_| IndexError::Truncated)?;
            let len = cursor
                .read_u16::<LittleEndian>()
                .map_err(|_| IndexError::Truncated)? as usize;
            let pos = cursor.position() as usize;
            let end = pos
                .checked_add(len)
                .filter(|&e| e <= bytes.len())
                .ok_or(IndexError::Truncated)?;
            let id = std::str::from_utf8(&bytes[pos..end])
                .map_err(|e| IndexError::InvalidId(e.to_string()))?
                .to_owned();
            cursor.set_position(end as u64);
            overflow.insert(key, id);
        }

        let mut index = EntityIndex::new();
        for entry in raw {
            let id = if entry.flags & flags::HASHED_ID != 0 {
                let full = overflow
                    .get(entry.key.as_bytes())
                    .ok_or_else(|| IndexError::MissingOverflow(hex::encode(entry.key.as_bytes())))?;
                EntityId::from_stored(full.clone())
                    .map_err(|e| IndexError::InvalidId(e.to_string()))?
            } else {
                let short = entry.key.decode_short().ok_or_else(|| {
                    IndexError::UndecodableKey(hex::encode(entry.key.as_bytes()))
                })?;
                EntityId::from_stored(short).map_err(|e| IndexError::InvalidId(e.to_string()))?
            };
            index.entries.insert(id, entry);
        }
        Ok(index)
    }

    /// Flags a fresh entry for `entity` should carry
    pub fn flags_for(entity: &Entity, chunked: bool) -> u32 {
        let mut f = 0;
        if chunked {
            f |= flags::CHUNKED;
        }
        if entity.id.is_hashed() {
            f |= flags::HASHED_ID;
        }
        f
    }
}
