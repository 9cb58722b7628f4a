//! File header codec
//!
//! One 64-byte slot:
//!
//! ```text
//! ┌───────┬─────────┬───────────┬──────────┬───────────┬───────────┬────────────┬───────┬─────┬───────────────┐
//! │ magic │ version │ file_size │ dict_off │ dict_size │ index_off │ index_size │ count │ crc │ last_modified │
//! │  4 B  │   4 B   │    8 B    │   8 B    │    8 B    │    8 B    │    8 B     │  4 B  │ 4 B │      8 B      │
//! └───────┴─────────┴───────────┴──────────┴───────────┴───────────┴────────────┴───────┴─────┴───────────────┘
//! ```
//!
//! The CRC32 covers the whole slot with the crc field zeroed. Two slots
//! are kept: the primary at offset 0 and the prior header at offset 64.
//! A reader that fails the primary CRC falls back to the copy; only if
//! both fail is the file corrupt.

use super::{FORMAT_VERSION, HEADER_SLOT_SIZE, MAGIC};
use entitydb_core::Error;
use thiserror::Error;

const CRC_RANGE: std::ops::Range<usize> = 52..56;

/// Decoded file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Format version
    pub version: u32,
    /// Durable checkpointed extent; the WAL region starts here
    pub file_size: u64,
    /// Offset of the tag dictionary segment
    pub dict_offset: u64,
    /// Byte length of the tag dictionary segment
    pub dict_size: u64,
    /// Offset of the entity index segment
    pub index_offset: u64,
    /// Byte length of the entity index segment
    pub index_size: u64,
    /// Number of index entries
    pub entity_count: u32,
    /// Last modification wall time, ns
    pub last_modified: u64,
}

/// Header slot decode failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    /// Slot does not start with `EBDF`
    #[error("bad magic {found:#010x}")]
    BadMagic {
        /// The four bytes found, big-endian for display
        found: u32,
    },

    /// Slot CRC did not match its contents
    #[error("header crc mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        /// CRC read from the slot
        stored: u32,
        /// CRC computed over the slot
        computed: u32,
    },

    /// Format version this build does not understand
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),

    /// Fewer than 64 bytes available
    #[error("truncated header slot: {0} bytes")]
    Truncated(usize),
}

impl From<HeaderError> for Error {
    fn from(e: HeaderError) -> Self {
        match e {
            HeaderError::BadMagic { found } => Error::BadMagic { found },
            other => Error::CorruptHeader {
                reason: other.to_string(),
            },
        }
    }
}

impl FileHeader {
    /// Header of a freshly created file, before any segments exist
    pub fn empty() -> Self {
        FileHeader {
            version: FORMAT_VERSION,
            file_size: 0,
            dict_offset: 0,
            dict_size: 0,
            index_offset: 0,
            index_size: 0,
            entity_count: 0,
            last_modified: 0,
        }
    }

    /// Encode into one 64-byte slot, computing the CRC
    pub fn encode_slot(&self) -> [u8; HEADER_SLOT_SIZE] {
        let mut slot = [0u8; HEADER_SLOT_SIZE];
        slot[0..4].copy_from_slice(&MAGIC);
        slot[4..8].copy_from_slice(&self.version.to_le_bytes());
        slot[8..16].copy_from_slice(&self.file_size.to_le_bytes());
        slot[16..24].copy_from_slice(&self.dict_offset.to_le_bytes());
        slot[24..32].copy_from_slice(&self.dict_size.to_le_bytes());
        slot[32..40].copy_from_slice(&self.index_offset.to_le_bytes());
        slot[40..48].copy_from_slice(&self.index_size.to_le_bytes());
        slot[48..52].copy_from_slice(&self.entity_count.to_le_bytes());
        // CRC over the slot with the crc field still zeroed.
        slot[56..64].copy_from_slice(&self.last_modified.to_le_bytes());
        let crc = crc32fast::hash(&slot);
        slot[CRC_RANGE].copy_from_slice(&crc.to_le_bytes());
        slot
    }

    /// Decode and verify one 64-byte slot
    pub fn decode_slot(bytes: &[u8]) -> Result<FileHeader, HeaderError> {
        if bytes.len() < HEADER_SLOT_SIZE {
            return Err(HeaderError::Truncated(bytes.len()));
        }
        let slot: [u8; HEADER_SLOT_SIZE] = bytes[..HEADER_SLOT_SIZE].try_into().unwrap();

        if slot[0..4] != MAGIC {
            return Err(HeaderError::BadMagic {
                found: u32::from_be_bytes(slot[0..4].try_into().unwrap()),
            });
        }

        let stored = u32::from_le_bytes(slot[CRC_RANGE].try_into().unwrap());
        let mut zeroed = slot;
        zeroed[CRC_RANGE].fill(0);
        let computed = crc32fast::hash(&zeroed);
        if stored != computed {
            return Err(HeaderError::CrcMismatch { stored, computed });
        }

        let version = u32::from_le_bytes(slot[4..8].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }

        Ok(FileHeader {
            version,
            file_size: u64::from_le_bytes(slot[8..16].try_into().unwrap()),
            dict_offset: u64::from_le_bytes(slot[16..24].try_into().unwrap()),
            dict_size: u64::from_le_bytes(slot[24..32].try_into().unwrap()),
            index_offset: u64::from_le_bytes(slot[32..40].try_into().unwrap()),
            index_size: u64::from_le_bytes(slot[40..48].try_into().unwrap()),
            entity_count: u32::from_le_bytes(slot[48..52].try_into().unwrap()),
            last_modified: u64::from_le_bytes(slot[56..64].try_into().unwrap()),
        })
    }
}
