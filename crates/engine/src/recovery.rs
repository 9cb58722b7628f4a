//! Startup recovery and the quarantine
//!
//! On open, the WAL region is scanned forward and every intact mutation
//! is replayed against the in-memory index and tag shards. A torn tail is
//! truncated. Replay is idempotent: applying the same record twice leaves
//! the index and shards unchanged.
//!
//! An entity whose data block fails its integrity check is recovered *at
//! most once per process lifetime*: it is tombstoned, remembered in the
//! bounded quarantine, and never re-attempted, so one pathological record
//! cannot generate a recovery loop. Metric entities (`metric_`,
//! `measurement_` prefixes) are exempt from recovery entirely; they are
//! regenerable and not worth a tombstone.

use entitydb_core::{Entity, EntityId, Result, TemporalTag};
use entitydb_storage::{
    decode_block, parse_checkpoint_payload, scan_wal, EntityIndex, ShardedTagIndex, TagDict,
    UnifiedFile, WalOp,
};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

const QUARANTINE_CAPACITY: usize = 1024;

/// Bounded record of ids tombstoned by integrity recovery
#[derive(Debug, Default)]
pub struct Quarantine {
    inner: Mutex<QuarantineInner>,
}

#[derive(Debug, Default)]
struct QuarantineInner {
    attempted: FxHashSet<EntityId>,
    listed: VecDeque<EntityId>,
}

impl Quarantine {
    /// Fresh, empty quarantine
    pub fn new() -> Self {
        Quarantine::default()
    }

    /// Whether recovery may be attempted for `id`
    ///
    /// False for metric entities and for ids already attempted this
    /// process lifetime.
    pub fn should_attempt(&self, id: &EntityId) -> bool {
        if id.is_metric() {
            return false;
        }
        !self.inner.lock().attempted.contains(id)
    }

    /// Record a recovery attempt for `id`
    pub fn record(&self, id: &EntityId) {
        let mut inner = self.inner.lock();
        if inner.attempted.insert(id.clone()) {
            if inner.listed.len() == QUARANTINE_CAPACITY {
                inner.listed.pop_front();
            }
            inner.listed.push_back(id.clone());
        }
    }

    /// True if `id` was quarantined this process lifetime
    pub fn contains(&self, id: &EntityId) -> bool {
        self.inner.lock().attempted.contains(id)
    }

    /// Quarantined ids, oldest first
    pub fn list(&self) -> Vec<EntityId> {
        self.inner.lock().listed.iter().cloned().collect()
    }

    /// Number of quarantined ids
    pub fn len(&self) -> usize {
        self.inner.lock().listed.len()
    }

    /// True if nothing is quarantined
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What startup recovery did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    /// Mutation records replayed
    pub replayed: u64,
    /// Bytes of torn tail truncated
    pub truncated_bytes: u64,
    /// True if the shard snapshot fast path applied
    pub shards_from_snapshot: bool,
    /// Entities quarantined during replay
    pub quarantined: u64,
}

/// Replay the WAL region against the index and shards
///
/// Assumes `dict` and `index` were just loaded from the checkpointed
/// segments. Returns the report plus the next LSN to assign.
pub fn recover(
    file: &mut UnifiedFile,
    dict: &mut TagDict,
    index: &mut EntityIndex,
    shards: &ShardedTagIndex,
    quarantine: &Quarantine,
) -> Result<RecoveryReport> {
    let wal_start = file.header().file_size;
    let scan = scan_wal(file.file_mut(), wal_start)?;
    let mut report = RecoveryReport::default();

    if scan.is_torn() {
        report.truncated_bytes = scan.torn_bytes;
        file.truncate_to(scan.valid_end)?;
    }

    // Fast path: a leading checkpoint record carries the shard snapshot
    // taken at exactly this durable extent.
    let mut shards_loaded = false;
    if let Some(first) = scan.records.first() {
        if first.record.op == WalOp::Checkpoint {
            match parse_checkpoint_payload(&first.record.payload) {
                Ok((snap_header, shard_bytes)) if snap_header.file_size == wal_start => {
                    match shards.load_snapshot_bytes(shard_bytes) {
                        Ok(lsn) => {
                            debug!(
                                target: "entitydb::wal",
                                lsn,
                                "tag shards loaded from checkpoint snapshot"
                            );
                            shards_loaded = true;
                        }
                        Err(e) => {
                            warn!(target: "entitydb::wal", error = %e, "shard snapshot unusable")
                        }
                    }
                }
                Ok(_) => warn!(
                    target: "entitydb::wal",
                    "checkpoint snapshot belongs to a different extent"
                ),
                Err(e) => warn!(target: "entitydb::wal", error = %e, "checkpoint payload unreadable"),
            }
        }
    }
    if !shards_loaded {
        // A brand-new file has nothing to rebuild and its (empty) variants
        // are trivially complete; anything else rebuilt from live blocks
        // cannot vouch for historical retraction times.
        if !(index.is_empty() && scan.records.is_empty()) {
            rebuild_shards(file, dict, index, shards, false)?;
        }
    }
    report.shards_from_snapshot = shards_loaded;

    let mut next_lsn = file.next_lsn().max(scan.last_lsn().map_or(1, |l| l + 1));

    for scanned in &scan.records {
        next_lsn = next_lsn.max(scanned.record.lsn + 1);
        match scanned.record.op {
            // Bodies interned after the persisted dictionary arrive as
            // deltas ahead of the blocks that reference them.
            WalOp::DictDelta => {
                if let Err(e) = dict.apply_delta(&scanned.record.payload) {
                    warn!(
                        target: "entitydb::wal",
                        lsn = scanned.record.lsn,
                        error = %e,
                        "dictionary delta rejected"
                    );
                }
            }
            WalOp::PutEntity | WalOp::PutChunk => {
                let entity = match decode_block(&scanned.record.payload, dict) {
                    Ok(entity) => entity,
                    Err(e) => {
                        // The CRC was intact, so this is a dictionary or
                        // codec-level inconsistency; skip the record.
                        warn!(
                            target: "entitydb::wal",
                            lsn = scanned.record.lsn,
                            error = %e,
                            "unreplayable wal record skipped"
                        );
                        report.quarantined += 1;
                        continue;
                    }
                };
                apply_put(
                    index,
                    shards,
                    &entity,
                    scanned.payload_offset,
                    scanned.record.payload.len() as u32,
                    file,
                    dict,
                );
                report.replayed += 1;
            }
            WalOp::DeleteEntity => {
                if let Some((timestamp, id)) = decode_delete_payload(&scanned.record.payload) {
                    apply_delete(index, shards, &id, timestamp, file, dict);
                    report.replayed += 1;
                } else {
                    warn!(
                        target: "entitydb::wal",
                        lsn = scanned.record.lsn,
                        "malformed delete record skipped"
                    );
                }
            }
            WalOp::Checkpoint | WalOp::DictSegment | WalOp::IndexSegment => {}
        }
    }

    file.set_next_lsn(next_lsn);

    info!(
        target: "entitydb::wal",
        replayed = report.replayed,
        truncated = report.truncated_bytes,
        fast_path = report.shards_from_snapshot,
        "recovery complete"
    );
    Ok(report)
}

/// Apply one put to index and shards; idempotent
pub(crate) fn apply_put(
    index: &mut EntityIndex,
    shards: &ShardedTagIndex,
    entity: &Entity,
    offset: u64,
    size: u32,
    file: &mut UnifiedFile,
    dict: &TagDict,
) {
    // An update drops shard registrations for bodies the new version no
    // longer carries; the retraction is stamped with the version's write
    // time.
    let write_time = entity.updated_at().unwrap_or(0);
    if let Some(previous) = index.get(&entity.id) {
        if !previous.is_tombstoned() {
            if let Ok(old) = read_entity_at(file, dict, previous.offset, previous.size) {
                for body in old.bodies() {
                    if !entity.tags.iter().any(|t| &t.body == body) {
                        shards.remove(body.as_str(), write_time, &entity.id);
                    }
                }
            }
        }
    }

    let chunked = entity.content.is_empty() && entity.value_after("content:chunks:").is_some();
    index.upsert(
        entity.id.clone(),
        offset,
        size,
        EntityIndex::flags_for(entity, chunked),
    );
    for TemporalTag { timestamp, body } in &entity.tags {
        shards.add(body.as_str(), *timestamp, &entity.id);
    }
}

/// Apply one delete to index and shards; idempotent, and a no-op for
/// unknown ids
pub(crate) fn apply_delete(
    index: &mut EntityIndex,
    shards: &ShardedTagIndex,
    id: &EntityId,
    timestamp: i64,
    file: &mut UnifiedFile,
    dict: &TagDict,
) {
    if let Some(entry) = index.get(id) {
        let (offset, size) = (entry.offset, entry.size);
        if let Ok(entity) = read_entity_at(file, dict, offset, size) {
            for body in entity.bodies() {
                shards.remove(body.as_str(), timestamp, id);
            }
        }
    }
    index.tombstone(id);
}

/// `DeleteEntity` payload: `{ timestamp: u64, id bytes }`
pub(crate) fn encode_delete_payload(timestamp: i64, id: &EntityId) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + id.as_bytes().len());
    payload.extend_from_slice(&(timestamp.max(0) as u64).to_le_bytes());
    payload.extend_from_slice(id.as_bytes());
    payload
}

/// Decode a `DeleteEntity` payload
pub(crate) fn decode_delete_payload(payload: &[u8]) -> Option<(i64, EntityId)> {
    if payload.len() < 8 {
        return None;
    }
    let ts = u64::from_le_bytes(payload[0..8].try_into().unwrap());
    if ts > i64::MAX as u64 {
        return None;
    }
    let id = std::str::from_utf8(&payload[8..]).ok()?;
    let id = EntityId::from_stored(id).ok()?;
    Some((ts as i64, id))
}

fn read_entity_at(
    file: &mut UnifiedFile,
    dict: &TagDict,
    offset: u64,
    size: u32,
) -> Result<Entity> {
    let bytes = file.read_at(offset, size as usize)?;
    Ok(decode_block(&bytes, dict)?)
}

/// Rebuild the tag shards from the entity index and data blocks
///
/// The slow path when no usable shard snapshot exists, and the
/// implementation behind `reindex`. The id sets are a pure function of
/// the live data blocks; `preserve_history` keeps the change-timestamp
/// variants this process already knows (reindex), while recovery without
/// a snapshot starts them over and drops their authoritative status.
pub fn rebuild_shards(
    file: &mut UnifiedFile,
    dict: &TagDict,
    index: &EntityIndex,
    shards: &ShardedTagIndex,
    preserve_history: bool,
) -> Result<()> {
    let entries: Vec<(EntityId, u64, u32)> = index
        .iter()
        .filter(|(_, e)| !e.is_tombstoned())
        .map(|(id, e)| (id.clone(), e.offset, e.size))
        .collect();

    let mut triples: Vec<(String, i64, EntityId)> = Vec::new();
    let mut unreadable = 0u64;
    for (id, offset, size) in entries {
        match read_entity_at(file, dict, offset, size) {
            Ok(entity) => {
                for TemporalTag { timestamp, body } in &entity.tags {
                    triples.push((body.as_str().to_owned(), *timestamp, id.clone()));
                }
            }
            Err(e) => {
                unreadable += 1;
                warn!(target: "entitydb::storage", %id, error = %e, "block unreadable during rebuild");
            }
        }
    }
    shards.rebuild(triples, preserve_history);

    info!(
        target: "entitydb::storage",
        bodies = shards.body_count(),
        unreadable,
        "tag shards rebuilt from data blocks"
    );
    Ok(())
}
