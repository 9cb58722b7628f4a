//! Checkpointing
//!
//! A checkpoint makes the WAL region redundant:
//!
//! 1. fresh dictionary and index segments are appended at the file tail
//! 2. the header is swapped to cover them (extending the durable extent
//!    past every replayed record)
//! 3. a `Checkpoint` record opens the new, empty WAL region; its payload
//!    is the header snapshot plus the tag-shard snapshot, which gives
//!    startup its fast path
//!
//! A crash before the header swap leaves the old header pointing at the
//! old segments; the new segment frames are either skipped by replay
//! (they are not mutations) or truncated as a torn tail. A crash after
//! the swap but before the `Checkpoint` record merely costs the shard
//! fast path. No window loses data.

use crate::file::UnifiedFile;
use crate::format::dictionary::TagDict;
use crate::format::header::{FileHeader, HeaderError};
use crate::format::index::EntityIndex;
use crate::format::HEADER_SLOT_SIZE;
use crate::wal::record::WalOp;
use entitydb_core::Result;
use tracing::info;

/// What a checkpoint produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointOutcome {
    /// LSN of the `Checkpoint` record
    pub lsn: u64,
    /// New durable extent
    pub file_size: u64,
    /// Dictionary entries persisted
    pub dict_entries: usize,
    /// Index entries persisted
    pub index_entries: usize,
}

/// Run a checkpoint
///
/// `shard_snapshot` is the serialized tag-shard state as of this
/// checkpoint; `now_ns` stamps the header. The index's dirty bits are
/// cleared once its image is durable.
pub fn checkpoint(
    file: &mut UnifiedFile,
    dict: &TagDict,
    index: &mut EntityIndex,
    shard_snapshot: &[u8],
    now_ns: u64,
) -> Result<CheckpointOutcome> {
    let dict_bytes = dict.encode();
    let index_bytes = index.encode();

    let dict_info = file.append_record(WalOp::DictSegment, dict_bytes)?;
    let index_info = file.append_record(WalOp::IndexSegment, index_bytes)?;
    file.sync_all()?;

    let new_header = FileHeader {
        file_size: file.physical_size(),
        dict_offset: dict_info.payload_offset,
        dict_size: dict_info.payload_len as u64,
        index_offset: index_info.payload_offset,
        index_size: index_info.payload_len as u64,
        entity_count: index.len() as u32,
        last_modified: now_ns,
        ..*file.header()
    };
    file.write_header(new_header)?;
    index.clear_dirty();
    file.reset_wal_bytes();

    // Open the fresh WAL region with the checkpoint marker.
    let mut payload = Vec::with_capacity(HEADER_SLOT_SIZE + shard_snapshot.len());
    payload.extend_from_slice(&new_header.encode_slot());
    payload.extend_from_slice(shard_snapshot);
    let info = file.append_record(WalOp::Checkpoint, payload)?;
    file.reset_wal_bytes();

    info!(
        target: "entitydb::storage",
        lsn = info.lsn,
        file_size = new_header.file_size,
        entities = new_header.entity_count,
        "checkpoint complete"
    );

    Ok(CheckpointOutcome {
        lsn: info.lsn,
        file_size: new_header.file_size,
        dict_entries: dict.len(),
        index_entries: index.len(),
    })
}

/// Split a `Checkpoint` record payload into the header snapshot and the
/// tag-shard snapshot bytes
pub fn parse_checkpoint_payload(payload: &[u8]) -> Result<(FileHeader, &[u8])> {
    if payload.len() < HEADER_SLOT_SIZE {
        return Err(HeaderError::Truncated(payload.len()).into());
    }
    let header = FileHeader::decode_slot(&payload[..HEADER_SLOT_SIZE])?;
    Ok((header, &payload[HEADER_SLOT_SIZE..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::replay::scan_wal;
    use entitydb_core::EntityId;
    use tempfile::tempdir;

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entities.edb");
        let mut file = UnifiedFile::create(&path).unwrap();

        let mut dict = TagDict::new();
        dict.intern("type:doc").unwrap();
        let mut index = EntityIndex::new();
        index.upsert(EntityId::new("e1").unwrap(), 4096, 64, 0);

        let outcome = checkpoint(&mut file, &dict, &mut index, b"snapshot", 777).unwrap();
        assert_eq!(outcome.dict_entries, 1);
        assert_eq!(outcome.index_entries, 1);
        assert_eq!(file.header().entity_count, 1);
        assert_eq!(file.header().last_modified, 777);
        assert_eq!(file.wal_bytes(), 0);

        // Reopen: segments load, and the WAL region starts with the
        // checkpoint marker.
        drop(file);
        let mut reopened = UnifiedFile::open(&path).unwrap();
        let dict2 = reopened.load_dict().unwrap();
        assert_eq!(dict2.lookup("type:doc"), Some(1));
        let index2 = reopened.load_index().unwrap();
        assert_eq!(index2.len(), 1);

        let start = reopened.header().file_size;
        let scan = scan_wal(reopened.file_mut(), start).unwrap();
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.records[0].record.op, WalOp::Checkpoint);

        let (snap_header, shard_bytes) =
            parse_checkpoint_payload(&scan.records[0].record.payload).unwrap();
        assert_eq!(snap_header.file_size, reopened.header().file_size);
        assert_eq!(shard_bytes, b"snapshot");
    }

    #[test]
    fn test_checkpoint_clears_dirty_bits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entities.edb");
        let mut file = UnifiedFile::create(&path).unwrap();

        let dict = TagDict::new();
        let mut index = EntityIndex::new();
        let id = EntityId::new("e1").unwrap();
        index.upsert(id.clone(), 4096, 64, 0);
        assert!(index.get(&id).unwrap().flags & crate::format::index::flags::DIRTY != 0);

        checkpoint(&mut file, &dict, &mut index, &[], 1).unwrap();
        assert_eq!(index.get(&id).unwrap().flags & crate::format::index::flags::DIRTY, 0);
    }

    #[test]
    fn test_parse_checkpoint_payload_truncated() {
        assert!(parse_checkpoint_payload(&[0u8; 10]).is_err());
    }
}
