//! Entity identifiers
//!
//! An [`EntityId`] is an opaque string of at most [`MAX_ID_BYTES`] bytes,
//! unique within one database. Chunk children of a large entity are named
//! `"{parent}-chunk-{n}"` and are constructed internally, bypassing the
//! caller-facing length cap.
//!
//! The on-disk entity index stores a canonical 16-byte [`IndexKey`] per
//! entry: ids of up to 16 raw bytes are zero-padded in place, longer ids
//! are replaced by the first 16 bytes of their SHA-256 (the index entry's
//! `hashed` flag records which form was used, and an overflow side table
//! maps hashed keys back to full strings).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Maximum length of a caller-supplied entity id, in bytes
pub const MAX_ID_BYTES: usize = 64;

const CHUNK_INFIX: &str = "-chunk-";

/// Validated entity identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Validate and wrap a caller-supplied id
    ///
    /// Rejects empty ids, ids longer than [`MAX_ID_BYTES`] bytes, and ids
    /// containing control characters or `|` (which would collide with the
    /// temporal tag delimiter).
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::invalid_tag("entity id must not be empty"));
        }
        if id.len() > MAX_ID_BYTES {
            return Err(Error::invalid_tag(format!(
                "entity id is {} bytes, maximum is {}",
                id.len(),
                MAX_ID_BYTES
            )));
        }
        if id.chars().any(|c| c.is_control() || c == '|') {
            return Err(Error::invalid_tag(format!(
                "entity id {:?} contains a control character or '|'",
                id
            )));
        }
        Ok(EntityId(id))
    }

    /// Wrap an id read back from storage
    ///
    /// Persisted ids were validated on the way in; chunk children may
    /// legitimately exceed [`MAX_ID_BYTES`], so only the character rules
    /// are re-checked here.
    pub fn from_stored(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::invalid_tag("stored entity id is empty"));
        }
        if id.chars().any(|c| c.is_control() || c == '|') {
            return Err(Error::invalid_tag(format!(
                "stored entity id {:?} contains a control character or '|'",
                id
            )));
        }
        Ok(EntityId(id))
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id as raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Name of the `i`-th chunk child of this entity
    ///
    /// Chunk ids are internal and may exceed [`MAX_ID_BYTES`].
    pub fn chunk_child(&self, index: u32) -> EntityId {
        EntityId(format!("{}{}{}", self.0, CHUNK_INFIX, index))
    }

    /// If this id names a chunk child, its parent id string and chunk index
    pub fn chunk_parts(&self) -> Option<(&str, u32)> {
        let pos = self.0.rfind(CHUNK_INFIX)?;
        let index: u32 = self.0[pos + CHUNK_INFIX.len()..].parse().ok()?;
        Some((&self.0[..pos], index))
    }

    /// True if this id names a chunk child
    pub fn is_chunk(&self) -> bool {
        self.chunk_parts().is_some()
    }

    /// True for metric entities, which are excluded from integrity recovery
    /// because they are safely regenerable
    pub fn is_metric(&self) -> bool {
        self.0.starts_with("metric_") || self.0.starts_with("measurement_")
    }

    /// True if the canonical index form of this id is a SHA-256 prefix
    pub fn is_hashed(&self) -> bool {
        self.0.len() > 16
    }

    /// Canonical 16-byte form for the on-disk entity index
    pub fn index_key(&self) -> IndexKey {
        IndexKey::for_id(&self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Canonical 16-byte index key derived from an entity id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexKey([u8; 16]);

impl IndexKey {
    /// Derive the key for an id string
    pub fn for_id(id: &str) -> IndexKey {
        let bytes = id.as_bytes();
        let mut key = [0u8; 16];
        if bytes.len() <= 16 {
            key[..bytes.len()].copy_from_slice(bytes);
        } else {
            let digest = Sha256::digest(bytes);
            key.copy_from_slice(&digest[..16]);
        }
        IndexKey(key)
    }

    /// Wrap raw bytes read from an index entry
    pub fn from_bytes(bytes: [u8; 16]) -> IndexKey {
        IndexKey(bytes)
    }

    /// The raw key bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Recover the id string from a non-hashed key
    ///
    /// Returns `None` if the padding or encoding is not that of a short id;
    /// hashed keys must go through the overflow side table instead.
    pub fn decode_short(&self) -> Option<String> {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(16);
        if self.0[end..].iter().any(|&b| b != 0) {
            return None;
        }
        std::str::from_utf8(&self.0[..end]).ok().map(str::to_owned)
    }
}
