//! WAL record format
//!
//! ```text
//! ┌────────────┬───────────┬──────────┬─────────────┬──────────────┐
//! │ len: u32   │ lsn: u64  │ op: u8   │ payload     │ crc32c: u32  │
//! └────────────┴───────────┴──────────┴─────────────┴──────────────┘
//! ```
//!
//! `len` counts lsn + op + payload. The CRC32C (Castagnoli) covers the
//! same span. A record that fails any structural check is treated by the
//! replay scanner as the torn tail of the log.

use byteorder::{LittleEndian, WriteBytesExt};
use thiserror::Error;

/// Frame bytes around the payload: len + lsn + op + crc
pub const WAL_RECORD_OVERHEAD: usize = 4 + 8 + 1 + 4;

/// Offset of the payload within a record
pub const WAL_PAYLOAD_OFFSET: u64 = 4 + 8 + 1;

/// Mutation kind carried by a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalOp {
    /// Full entity block (create or update)
    PutEntity = 1,
    /// Tombstone; payload is the entity id bytes
    DeleteEntity = 2,
    /// Chunk-child entity block
    PutChunk = 3,
    /// Checkpoint marker; payload is a header snapshot plus the tag-shard
    /// snapshot
    Checkpoint = 4,
    /// Tag dictionary image written by a checkpoint; never replayed, the
    /// header addresses its payload directly
    DictSegment = 5,
    /// Entity index image written by a checkpoint; never replayed
    IndexSegment = 6,
    /// Dictionary entries interned since the last checkpoint; replayed
    /// before the block records that reference them
    DictDelta = 7,
}

impl WalOp {
    /// Decode an op byte
    pub fn from_u8(op: u8) -> Option<WalOp> {
        match op {
            1 => Some(WalOp::PutEntity),
            2 => Some(WalOp::DeleteEntity),
            3 => Some(WalOp::PutChunk),
            4 => Some(WalOp::Checkpoint),
            5 => Some(WalOp::DictSegment),
            6 => Some(WalOp::IndexSegment),
            7 => Some(WalOp::DictDelta),
            _ => None,
        }
    }

    /// True for ops that mutate entity state on replay
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            WalOp::PutEntity | WalOp::DeleteEntity | WalOp::PutChunk
        )
    }
}

/// One WAL record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Log sequence number; the total write order
    pub lsn: u64,
    /// Mutation kind
    pub op: WalOp,
    /// Op-specific payload
    pub payload: Vec<u8>,
}

/// Record decode failures
///
/// Every variant except `BadOp` means the bytes end mid-record or were
/// never a record; the scanner treats all of them as the torn tail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalRecordError {
    /// Fewer bytes than the frame requires
    #[error("truncated wal record")]
    Truncated,

    /// Length prefix smaller than lsn + op
    #[error("wal record length {0} below minimum")]
    BadLength(u32),

    /// CRC32C did not match
    #[error("wal crc mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        /// CRC read from the record
        stored: u32,
        /// CRC computed over the record
        computed: u32,
    },

    /// Unknown op byte under a valid CRC
    #[error("unknown wal op {0:#04x}")]
    BadOp(u8),
}

impl WalRecord {
    /// Assemble a record
    pub fn new(lsn: u64, op: WalOp, payload: Vec<u8>) -> Self {
        WalRecord { lsn, op, payload }
    }

    /// Encoded size of this record
    pub fn encoded_len(&self) -> usize {
        WAL_RECORD_OVERHEAD + self.payload.len()
    }

    /// Encode into the on-disk frame
    pub fn encode(&self) -> Vec<u8> {
        let len = (8 + 1 + self.payload.len()) as u32;
        let mut out = Vec::with_capacity(self.encoded_len());
        out.write_u32::<LittleEndian>(len).expect("vec write");
        out.write_u64::<LittleEndian>(self.lsn).expect("vec write");
        out.push(self.op as u8);
        out.extend_from_slice(&self.payload);
        let crc = crc32c::crc32c(&out[4..]);
        out.write_u32::<LittleEndian>(crc).expect("vec write");
        out
    }

    /// Decode one record from the front of `bytes`
    ///
    /// Returns the record and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(WalRecord, usize), WalRecordError> {
        if bytes.len() < 4 {
            return Err(WalRecordError::Truncated);
        }
        let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if len < 9 {
            return Err(WalRecordError::BadLength(len));
        }
        let body_end = 4usize
            .checked_add(len as usize)
            .ok_or(WalRecordError::Truncated)?;
        let frame_end = body_end.checked_add(4).ok_or(WalRecordError::Truncated)?;
        if bytes.len() < frame_end {
            return Err(WalRecordError::Truncated);
        }

        let stored = u32::from_le_bytes(bytes[body_end..frame_end].try_into().unwrap());
        let computed = crc32c::crc32c(&bytes[4..body_end]);
        if stored != computed {
            return Err(WalRecordError::CrcMismatch { stored, computed });
        }

        let lsn = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
        let op = WalOp::from_u8(bytes[12]).ok_or(WalRecordError::BadOp(bytes[12]))?;
        let payload = bytes[13..body_end].to_vec();

        Ok((WalRecord { lsn, op, payload }, frame_end))
    }
}
