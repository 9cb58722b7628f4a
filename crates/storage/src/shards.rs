//! Sharded tag index
//!
//! 256 independent shards, each guarding a `tag body → sorted id set`
//! map with its own read/write lock. Shard selection is
//! `xxh3(body) mod 256`, so different bodies rarely contend and readers
//! of one shard never block readers of another.
//!
//! Alongside the id sets each shard keeps a variants map
//! `body → {timestamps}`: every timestamp at which the body was asserted
//! or retracted. It is the accelerator behind
//! [`ShardedTagIndex::any_timestamp_after`], which lets a changes-since
//! query answer "nothing happened" without scanning the file. Variants
//! persist in the checkpoint snapshot and outlive the last id carrying
//! the body, since a retraction is itself a change worth remembering.
//!
//! The whole index is a deterministic function of the data blocks:
//! rebuilding from a scan must produce exactly the same pairs as the live
//! index, which [`ShardedTagIndex::all_pairs`] exists to verify.

use entitydb_core::{EntityId, Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;
use xxhash_rust::xxh3::xxh3_64;

/// Number of shards; fixed by the on-disk snapshot format
pub const TAG_SHARD_COUNT: usize = 256;

/// One shard's state
#[derive(Debug, Default)]
struct TagShard {
    by_body: BTreeMap<String, BTreeSet<EntityId>>,
    variants: BTreeMap<String, BTreeSet<i64>>,
}

/// Serialized form of the whole index, stamped with the checkpoint LSN
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSnapshot {
    /// LSN of the checkpoint this snapshot belongs to
    pub lsn: u64,
    /// `(body, sorted ids)` pairs, sorted by body
    pub entries: Vec<(String, Vec<EntityId>)>,
    /// `(body, sorted timestamps)` variants pairs, sorted by body
    pub variants: Vec<(String, Vec<i64>)>,
    /// Whether the variants cover every change since database creation
    pub variants_authoritative: bool,
}

/// 256-way concurrent `tag → {entity-id}` map
pub struct ShardedTagIndex {
    shards: Vec<RwLock<TagShard>>,
    /// True while the variants hold every change timestamp the data
    /// region could yield. A rebuild from live blocks alone cannot
    /// reconstruct old retraction times, so it clears the flag and
    /// [`ShardedTagIndex::any_timestamp_after`] stops short-circuiting.
    variants_authoritative: AtomicBool,
}

impl Default for ShardedTagIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardedTagIndex {
    /// An empty index
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(TAG_SHARD_COUNT);
        for _ in 0..TAG_SHARD_COUNT {
            shards.push(RwLock::new(TagShard::default()));
        }
        ShardedTagIndex {
            shards,
            variants_authoritative: AtomicBool::new(true),
        }
    }

    fn shard_of(&self, body: &str) -> &RwLock<TagShard> {
        let shard = (xxh3_64(body.as_bytes()) % TAG_SHARD_COUNT as u64) as usize;
        &self.shards[shard]
    }

    /// Register `id` under `body`; idempotent
    pub fn add(&self, body: &str, timestamp: i64, id: &EntityId) {
        let mut shard = self.shard_of(body).write();
        shard
            .by_body
            .entry(body.to_owned())
            .or_default()
            .insert(id.clone());
        shard
            .variants
            .entry(body.to_owned())
            .or_default()
            .insert(timestamp);
        trace!(target: "entitydb::query", body, %id, "tag index add");
    }

    /// Remove `id` from `body` at `timestamp`; empty id sets are dropped
    ///
    /// The retraction timestamp joins the body's variants so temporal
    /// queries can see that something changed here even after the last
    /// carrier of the body is gone.
    pub fn remove(&self, body: &str, timestamp: i64, id: &EntityId) {
        let mut shard = self.shard_of(body).write();
        if let Some(set) = shard.by_body.get_mut(body) {
            set.remove(id);
            if set.is_empty() {
                shard.by_body.remove(body);
            }
        }
        shard
            .variants
            .entry(body.to_owned())
            .or_default()
            .insert(timestamp);
        trace!(target: "entitydb::query", body, %id, "tag index remove");
    }

    /// All ids under `body`, sorted
    pub fn lookup(&self, body: &str) -> Vec<EntityId> {
        self.shard_of(body)
            .read()
            .by_body
            .get(body)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// True if `id` is registered under `body`
    pub fn contains(&self, body: &str, id: &EntityId) -> bool {
        self.shard_of(body)
            .read()
            .by_body
            .get(body)
            .map(|set| set.contains(id))
            .unwrap_or(false)
    }

    /// Number of ids under `body`
    pub fn cardinality(&self, body: &str) -> usize {
        self.shard_of(body)
            .read()
            .by_body
            .get(body)
            .map(BTreeSet::len)
            .unwrap_or(0)
    }

    /// Timestamps at which `body` was asserted or retracted, sorted
    pub fn timestamps(&self, body: &str) -> Vec<i64> {
        self.shard_of(body)
            .read()
            .variants
            .get(body)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// True if any body changed strictly after `t`
    ///
    /// The changes-since guard: when this is false the file scan is
    /// skipped outright, because every change timestamp a scan could
    /// derive is recorded in some body's variants. While the variants are
    /// not authoritative (after a rebuild from live blocks) this answers
    /// true unconditionally, trading the shortcut for correctness.
    pub fn any_timestamp_after(&self, t: i64) -> bool {
        if !self.variants_authoritative.load(Ordering::SeqCst) {
            return true;
        }
        self.shards.iter().any(|shard| {
            shard
                .read()
                .variants
                .values()
                .any(|set| set.last().is_some_and(|&latest| latest > t))
        })
    }

    /// Intersect the id sets of several bodies
    ///
    /// Bodies are processed in ascending cardinality: the smallest set
    /// seeds the result and each further set filters it, stopping early
    /// the moment the intersection (or any input) is empty.
    pub fn intersect(&self, bodies: &[&str]) -> Vec<EntityId> {
        if bodies.is_empty() {
            return Vec::new();
        }

        let mut ordered: Vec<(&str, usize)> = bodies
            .iter()
            .map(|&body| (body, self.cardinality(body)))
            .collect();
        ordered.sort_by_key(|&(_, n)| n);

        if ordered[0].1 == 0 {
            return Vec::new();
        }

        let mut result: BTreeSet<EntityId> = {
            let shard = self.shard_of(ordered[0].0).read();
            match shard.by_body.get(ordered[0].0) {
                Some(set) => set.clone(),
                None => return Vec::new(),
            }
        };

        for &(body, _) in &ordered[1..] {
            let shard = self.shard_of(body).read();
            match shard.by_body.get(body) {
                Some(set) => result.retain(|id| set.contains(id)),
                None => return Vec::new(),
            }
            if result.is_empty() {
                return Vec::new();
            }
        }

        result.into_iter().collect()
    }

    /// Distinct bodies across all shards
    pub fn body_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().by_body.len()).sum()
    }

    /// Every `(body, sorted ids)` pair, sorted by body
    ///
    /// This is the canonical flat view used for snapshots and for the
    /// rebuild-determinism check.
    pub fn all_pairs(&self) -> Vec<(String, Vec<EntityId>)> {
        let mut pairs: Vec<(String, Vec<EntityId>)> = Vec::new();
        for shard in &self.shards {
            let shard = shard.read();
            for (body, set) in &shard.by_body {
                pairs.push((body.clone(), set.iter().cloned().collect()));
            }
        }
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
    }

    fn all_variants(&self) -> Vec<(String, Vec<i64>)> {
        let mut pairs: Vec<(String, Vec<i64>)> = Vec::new();
        for shard in &self.shards {
            let shard = shard.read();
            for (body, set) in &shard.variants {
                pairs.push((body.clone(), set.iter().copied().collect()));
            }
        }
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
    }

    /// Serialize the index for the checkpoint record
    pub fn snapshot_bytes(&self, lsn: u64) -> Vec<u8> {
        let snapshot = ShardSnapshot {
            lsn,
            entries: self.all_pairs(),
            variants: self.all_variants(),
            variants_authoritative: self.variants_authoritative.load(Ordering::SeqCst),
        };
        bincode::serialize(&snapshot).expect("shard snapshot serialize")
    }

    /// Restore the index from checkpoint bytes, returning the stamped LSN
    pub fn load_snapshot_bytes(&self, bytes: &[u8]) -> Result<u64> {
        let snapshot: ShardSnapshot = bincode::deserialize(bytes).map_err(|e| {
            Error::CorruptBlock {
                reason: format!("shard snapshot: {}", e),
            }
        })?;
        self.clear();
        for (body, ids) in snapshot.entries {
            let mut shard = self.shard_of(&body).write();
            shard
                .by_body
                .insert(body.clone(), ids.into_iter().collect());
        }
        for (body, timestamps) in snapshot.variants {
            let mut shard = self.shard_of(&body).write();
            shard
                .variants
                .insert(body.clone(), timestamps.into_iter().collect());
        }
        self.variants_authoritative
            .store(snapshot.variants_authoritative, Ordering::SeqCst);
        Ok(snapshot.lsn)
    }

    /// Replace the whole index from scanned `(body, timestamp, id)` triples
    ///
    /// With `preserve_history`, previously recorded variants (and their
    /// authoritative status) carry over — the reindex case, where the id
    /// sets are refreshed but the change history already known to this
    /// process is still valid. Without it, the variants start over from
    /// the triples alone and the index stops claiming authority.
    pub fn rebuild(&self, entries: Vec<(String, i64, EntityId)>, preserve_history: bool) {
        let (authoritative, remembered) = if preserve_history {
            (
                self.variants_authoritative.load(Ordering::SeqCst),
                self.all_variants(),
            )
        } else {
            (false, Vec::new())
        };

        self.clear();
        for (body, timestamp, id) in entries {
            self.add(&body, timestamp, &id);
        }
        for (body, timestamps) in remembered {
            let mut shard = self.shard_of(&body).write();
            shard
                .variants
                .entry(body.clone())
                .or_default()
                .extend(timestamps);
        }
        self.variants_authoritative
            .store(authoritative, Ordering::SeqCst);
    }

    /// Declare the variants complete again
    ///
    /// Valid only when the caller knows the data region can no longer
    /// yield change timestamps outside the variants — compaction, which
    /// discards all history except the live blocks already registered
    /// here, is the one such moment.
    pub fn mark_variants_authoritative(&self) {
        self.variants_authoritative.store(true, Ordering::SeqCst);
    }

    /// Drop everything, including any claim to authoritative variants
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.write();
            shard.by_body.clear();
            shard.variants.clear();
        }
        self.variants_authoritative.store(false, Ordering::SeqCst);
    }
}
