//! Engine counters
//!
//! Cheap relaxed atomics bumped on the hot paths; `snapshot` folds in the
//! figures owned by other components (index sizes, cache hit rates,
//! quarantine depth).

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic operation counters
#[derive(Debug, Default)]
pub struct EngineStats {
    pub(crate) creates: AtomicU64,
    pub(crate) updates: AtomicU64,
    pub(crate) deletes: AtomicU64,
    pub(crate) reads: AtomicU64,
    pub(crate) checkpoints: AtomicU64,
    pub(crate) compactions: AtomicU64,
    pub(crate) recovered_records: AtomicU64,
}

impl EngineStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of the engine's counters and sizes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Successful `create` operations
    pub creates: u64,
    /// Successful `update` operations
    pub updates: u64,
    /// Successful `delete` operations
    pub deletes: u64,
    /// `get`/`stream` operations served
    pub reads: u64,
    /// Checkpoints completed
    pub checkpoints: u64,
    /// Compactions completed
    pub compactions: u64,
    /// WAL records replayed at the last startup
    pub recovered_records: u64,
    /// Index entries, tombstones included
    pub entities_total: usize,
    /// Live (non-tombstoned) entities
    pub entities_live: usize,
    /// Distinct tag bodies in the shard index
    pub tag_bodies: usize,
    /// WAL bytes accumulated since the last checkpoint
    pub wal_bytes: u64,
    /// Entity cache hits
    pub cache_hits: u64,
    /// Entity cache misses
    pub cache_misses: u64,
    /// Ids currently quarantined by integrity recovery
    pub quarantined: usize,
}
