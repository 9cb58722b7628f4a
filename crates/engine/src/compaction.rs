//! Compaction
//!
//! Rewrites the database to a fresh file holding only the latest version
//! of every live entity, with a rebuilt dictionary and index, then
//! atomically renames it over the old file. Tombstones, superseded
//! versions, and dead checkpoint segments are all reclaimed.
//!
//! Runs on the writer thread, so no mutation can interleave; readers
//! keep serving from the old inode until the engine bumps the reader
//! pool's generation.

use entitydb_core::{Entity, Result};
use entitydb_storage::{
    checkpoint, decode_block, encode_block, EntityIndex, ShardedTagIndex, TagDict, UnifiedFile,
    WalOp,
};
use std::path::PathBuf;
use tracing::info;

/// What compaction produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactOutcome {
    /// Live entities carried over
    pub live_entities: usize,
    /// Bytes reclaimed (old physical size minus new)
    pub reclaimed_bytes: u64,
    /// New durable extent
    pub file_size: u64,
}

/// The rewritten storage state, ready to swap in
pub(crate) struct CompactionResult {
    pub file: UnifiedFile,
    pub dict: TagDict,
    pub index: EntityIndex,
    pub outcome: CompactOutcome,
}

pub(crate) fn compact(
    old: &mut UnifiedFile,
    old_dict: &TagDict,
    old_index: &EntityIndex,
    shards: &ShardedTagIndex,
    now: i64,
) -> Result<CompactionResult> {
    let target: PathBuf = old.path().to_path_buf();
    let tmp = target.with_extension("edb.compact");
    if tmp.exists() {
        std::fs::remove_file(&tmp)?;
    }

    let mut new_file = UnifiedFile::create(&tmp)?;
    let mut new_dict = TagDict::new();
    let mut new_index = EntityIndex::new();

    let mut live: Vec<_> = old_index
        .iter()
        .filter(|(_, entry)| !entry.is_tombstoned())
        .map(|(id, entry)| (id.clone(), entry.clone()))
        .collect();
    live.sort_by(|a, b| a.0.cmp(&b.0));
    let live_count = live.len();

    for (id, entry) in live {
        let bytes = old.read_at(entry.offset, entry.size as usize)?;
        let entity: Entity = decode_block(&bytes, old_dict)?;
        let block = encode_block(&entity, &mut new_dict)?;
        let op = if id.is_chunk() {
            WalOp::PutChunk
        } else {
            WalOp::PutEntity
        };
        let info = new_file.append_record(op, block)?;
        new_index.upsert(
            id,
            info.payload_offset,
            info.payload_len,
            entry.flags & entitydb_storage::flags::CHUNKED,
        );
    }

    // One checkpoint gives the new file its dictionary, index, header,
    // and shard snapshot; the shard contents are unchanged by design.
    let snapshot = shards.snapshot_bytes(new_file.next_lsn());
    checkpoint(
        &mut new_file,
        &new_dict,
        &mut new_index,
        &snapshot,
        now.max(0) as u64,
    )?;

    let old_size = old.physical_size();
    new_file.rename_to(&target)?;
    new_file.sync_all()?;

    let outcome = CompactOutcome {
        live_entities: live_count,
        reclaimed_bytes: old_size.saturating_sub(new_file.physical_size()),
        file_size: new_file.header().file_size,
    };

    info!(
        target: "entitydb::storage",
        live = outcome.live_entities,
        reclaimed = outcome.reclaimed_bytes,
        "compaction complete"
    );

    Ok(CompactionResult {
        file: new_file,
        dict: new_dict,
        index: new_index,
        outcome,
    })
}
