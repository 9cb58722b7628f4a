//! Entity data block codec
//!
//! A block is one full version of one entity. Layout:
//!
//! ```text
//! ┌─────────────────────── 16 B header ───────────────────────┐
//! │ modified_ts: u64 │ tag_count: u16 │ content_count: u16    │
//! │ id_len: u16      │ reserved: u16                          │
//! ├───────────────────────────────────────────────────────────┤
//! │ id bytes (id_len)                                         │
//! │ tag_count × { tag_id: u32, timestamp: u64 }               │
//! │ content_count × { len: u32, bytes }                       │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Tags are stored as dictionary ids plus per-tag timestamps, in write
//! order; readers break equal-timestamp ties by this order. Chunked
//! entities have `content_count == 0`.

use super::dictionary::TagDict;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use entitydb_core::{Entity, EntityId, Error, TagBody, TemporalTag};
use std::io::Cursor;
use thiserror::Error;

/// Size of the fixed block header
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Block codec failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    /// Block ended mid-section
    #[error("truncated data block")]
    Truncated,

    /// More tags than the 2-byte count can carry
    #[error("{0} tags exceed the per-block limit")]
    TooManyTags(usize),

    /// Id longer than the 2-byte length prefix
    #[error("id of {0} bytes exceeds the block limit")]
    IdTooLong(usize),

    /// A tag id is not present in the dictionary
    #[error("block references unknown tag id {0}")]
    UnknownTagId(u32),

    /// A stored timestamp does not fit the nanosecond range
    #[error("stored timestamp {0} outside the nanosecond range")]
    BadTimestamp(u64),

    /// The stored id or a body failed validation
    #[error("invalid stored field: {0}")]
    Invalid(String),
}

impl From<BlockError> for Error {
    fn from(e: BlockError) -> Self {
        Error::CorruptBlock {
            reason: e.to_string(),
        }
    }
}

/// Encode an entity into a data block, interning new bodies into `dict`
pub fn encode_block(entity: &Entity, dict: &mut TagDict) -> Result<Vec<u8>, Error> {
    if entity.tags.len() > u16::MAX as usize {
        return Err(BlockError::TooManyTags(entity.tags.len()).into());
    }
    if entity.id.as_bytes().len() > u16::MAX as usize {
        return Err(BlockError::IdTooLong(entity.id.as_bytes().len()).into());
    }

    let content_count: u16 = if entity.content.is_empty() { 0 } else { 1 };
    let modified_ts = entity.updated_at().unwrap_or(0).max(0) as u64;

    let mut out = Vec::with_capacity(
        BLOCK_HEADER_SIZE
            + entity.id.as_bytes().len()
            + entity.tags.len() * 12
            + if content_count == 1 {
                4 + entity.content.len()
            } else {
                0
            },
    );

    out.write_u64::<LittleEndian>(modified_ts).expect("vec write");
    out.write_u16::<LittleEndian>(entity.tags.len() as u16)
        .expect("vec write");
    out.write_u16::<LittleEndian>(content_count).expect("vec write");
    out.write_u16::<LittleEndian>(entity.id.as_bytes().len() as u16)
        .expect("vec write");
    out.write_u16::<LittleEndian>(0).expect("vec write");

    out.extend_from_slice(entity.id.as_bytes());

    for tag in &entity.tags {
        let tag_id = dict.intern(tag.body.as_str()).map_err(Error::from)?;
        out.write_u32::<LittleEndian>(tag_id).expect("vec write");
        out.write_u64::<LittleEndian>(tag.timestamp.max(0) as u64)
            .expect("vec write");
    }

    if content_count == 1 {
        out.write_u32::<LittleEndian>(entity.content.len() as u32)
            .expect("vec write");
        out.extend_from_slice(&entity.content);
    }

    Ok(out)
}

/// Decode a data block back into an entity
pub fn decode_block(bytes: &[u8], dict: &TagDict) -> Result<Entity, BlockError> {
    let mut cursor = Cursor::new(bytes);

    let _modified_ts = cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| BlockError::Truncated)?;
    let tag_count = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| BlockError::Truncated)?;
    let content_count = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| BlockError::Truncated)?;
    let id_len = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| BlockError::Truncated)? as usize;
    let _reserved = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| BlockError::Truncated)?;

    let pos = cursor.position() as usize;
    let id_end = pos
        .checked_add(id_len)
        .filter(|&e| e <= bytes.len())
        .ok_or(BlockError::Truncated)?;
    let id_str = std::str::from_utf8(&bytes[pos..id_end])
        .map_err(|e| BlockError::Invalid(e.to_string()))?;
    let id = EntityId::from_stored(id_str).map_err(|e| BlockError::Invalid(e.to_string()))?;
    cursor.set_position(id_end as u64);

    let mut tags = Vec::with_capacity(tag_count as usize);
    for _ in 0..tag_count {
        let tag_id = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| BlockError::Truncated)?;
        let ts = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| BlockError::Truncated)?;
        if ts > i64::MAX as u64 {
            return Err(BlockError::BadTimestamp(ts));
        }
        let body = dict
            .resolve(tag_id)
            .ok_or(BlockError::UnknownTagId(tag_id))?;
        let body = TagBody::new(body).map_err(|e| BlockError::Invalid(e.to_string()))?;
        tags.push(TemporalTag {
            timestamp: ts as i64,
            body,
        });
    }

    let mut content = Vec::new();
    for _ in 0..content_count {
        let len = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| BlockError::Truncated)? as usize;
        let pos = cursor.position() as usize;
        let end = pos
            .checked_add(len)
            .filter(|&e| e <= bytes.len())
            .ok_or(BlockError::Truncated)?;
        content.extend_from_slice(&bytes[pos..end]);
        cursor.set_position(end as u64);
    }

    Ok(Entity::new(id, tags, content))
}
