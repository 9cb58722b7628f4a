//! The engine: repository operations over the unified file
//!
//! One `Engine` owns everything: the writer thread (which in turn owns
//! the file handle), the shared in-memory dictionary, index and tag
//! shards, the entity cache, the reader pool, the lock manager, the
//! memory guardian, and telemetry.
//!
//! Write path: caller validates and timestamps the entity, takes the
//! per-entity write lock, enqueues a command on the writer FIFO, and
//! blocks for completion. The writer thread appends the WAL record
//! durably, addresses the entity block in place, updates index and
//! shards, and invalidates the cache. Read path: per-entity read lock,
//! cache or block read through the reader pool, optional temporal filter
//! and chunk reassembly. Reads never queue behind writes.

use crate::chunking::{self, ContentStream};
use crate::compaction::{self, CompactOutcome};
use crate::datasets;
use crate::observability::Telemetry;
use crate::query::{Query, SortOrder};
use crate::recovery::{self, Quarantine};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::temporal::{self, EntityChange, TimelineEvent};
use entitydb_core::{
    now_nanos, Change, EngineConfig, Entity, EntityId, Error, Result, TagBody, TemporalTag,
    TraceSubsystem,
};
use entitydb_concurrency::{LockManager, MemoryGuardian, PressureLevel, WriterQueue};
use entitydb_storage::{
    checkpoint as run_checkpoint, decode_block, encode_block, scan_wal, BufferPools,
    CheckpointOutcome, EntityCache, EntityIndex, InternTable, ReaderPool, ShardedTagIndex,
    TagDict, UnifiedFile, WalOp, WalRecord, HEADER_REGION_SIZE,
};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options for [`Engine::get_with`]
#[derive(Debug, Clone, Copy)]
pub struct GetOptions {
    /// Return content (reassembled for chunked entities)
    pub include_content: bool,
    /// Reconstruct the state at this timestamp
    pub as_of: Option<i64>,
    /// Return the entity exactly as stored, skipping chunk reassembly
    pub raw: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        GetOptions {
            include_content: true,
            as_of: None,
            raw: false,
        }
    }
}

/// Result of a write operation
#[derive(Debug)]
pub enum WriteOutcome {
    /// An entity (and any chunks) was persisted
    Put {
        /// LSN of the parent's WAL record
        lsn: u64,
    },
    /// A delete was applied
    Deleted {
        /// True if the id was already tombstoned (no-op)
        already: bool,
    },
    /// A checkpoint completed
    Checkpointed(CheckpointOutcome),
    /// A compaction completed
    Compacted(CompactOutcome),
    /// The tag shards were rebuilt from data blocks
    Reindexed,
    /// An external WAL record was ingested
    Ingested {
        /// LSN it was re-appended under
        lsn: u64,
    },
}

/// Findings of [`Engine::verify`]
#[derive(Debug, Default)]
pub struct VerifyReport {
    /// Entities whose blocks were read and decoded
    pub entities_checked: usize,
    /// Chunked parents whose closure was verified
    pub chunked_checked: usize,
    /// Human-readable problems found
    pub problems: Vec<String>,
}

impl VerifyReport {
    /// True if nothing was found wrong
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

enum WriteCommand {
    Put {
        parent: Entity,
        chunks: Vec<Entity>,
        stale_chunks: Vec<EntityId>,
        expect_existing: bool,
    },
    Delete {
        id: EntityId,
        timestamp: i64,
    },
    Checkpoint,
    Compact,
    Reindex,
    Ingest {
        record: WalRecord,
    },
}

struct Shared {
    config: EngineConfig,
    dict: RwLock<TagDict>,
    index: RwLock<EntityIndex>,
    shards: ShardedTagIndex,
    cache: Arc<EntityCache>,
    interns: Arc<InternTable>,
    pools: BufferPools,
    readers: ReaderPool,
    locks: LockManager,
    guardian: MemoryGuardian,
    stats: EngineStats,
    quarantine: Quarantine,
    wal_bytes: AtomicU64,
}

struct WriterState {
    file: UnifiedFile,
    shared: Arc<Shared>,
}

/// The temporal entity database engine
pub struct Engine {
    shared: Arc<Shared>,
    writer: WriterQueue<WriteCommand, Result<WriteOutcome>>,
    telemetry: Telemetry,
}

impl Engine {
    /// Open (or create) the database described by `config`
    ///
    /// Runs crash recovery before accepting operations: the WAL region is
    /// replayed, a torn tail truncated, and the tag shards loaded from
    /// the checkpoint snapshot or rebuilt from data blocks.
    pub fn open(config: EngineConfig) -> Result<Engine> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_path)?;
        let path = config.database_path();

        let telemetry = Telemetry::install("info", &config.trace_subsystems);

        let mut file = if path.exists() {
            UnifiedFile::open(&path)?
        } else {
            UnifiedFile::create(&path)?
        };
        let mut dict = file.load_dict()?;
        let mut index = file.load_index()?;

        let shards = ShardedTagIndex::new();
        let quarantine = Quarantine::new();
        let report = recovery::recover(&mut file, &mut dict, &mut index, &shards, &quarantine)?;

        let cache = Arc::new(EntityCache::new(config.cache_capacity, config.cache_ttl()));
        let interns = Arc::new(InternTable::new(4096));
        let guardian = {
            let cache = Arc::clone(&cache);
            let interns = Arc::clone(&interns);
            MemoryGuardian::spawn(
                config.memory_soft_limit,
                config.memory_hard_limit,
                move |level| {
                    if level >= PressureLevel::Elevated {
                        cache.shrink_half();
                        interns.clear();
                    }
                },
            )
        };

        let shared = Arc::new(Shared {
            readers: ReaderPool::new(&path, config.high_performance_mode),
            locks: LockManager::new(config.lock_timeout()),
            dict: RwLock::new(dict),
            index: RwLock::new(index),
            shards,
            cache,
            interns,
            pools: BufferPools::new(),
            guardian,
            stats: EngineStats::default(),
            quarantine,
            wal_bytes: AtomicU64::new(file.wal_bytes()),
            config,
        });
        shared
            .stats
            .recovered_records
            .store(report.replayed, Ordering::Relaxed);

        let mut state = WriterState {
            file,
            shared: Arc::clone(&shared),
        };
        let writer = WriterQueue::spawn(shared.config.writer_queue_depth, move |cmd| {
            apply(&mut state, cmd)
        });

        info!(
            target: "entitydb::storage",
            path = %path.display(),
            replayed = report.replayed,
            "engine open"
        );

        Ok(Engine {
            shared,
            writer,
            telemetry,
        })
    }

    // =========================================================================
    // Repository operations
    // =========================================================================

    /// Create a new entity
    ///
    /// `tags` may be bare bodies (timestamped now) or full temporal
    /// strings. Content above the chunk threshold is split transparently;
    /// the returned entity is the parent exactly as persisted.
    pub fn create<S: AsRef<str>>(
        &self,
        id: &str,
        tags: &[S],
        content: Vec<u8>,
    ) -> Result<Entity> {
        let id = EntityId::new(id)?;
        self.shared.guardian.check_write()?;
        let now = now_nanos();
        let tags = self.parse_tags(tags, now)?;

        let _guard = self.shared.locks.write(&id)?;
        if let Some(entry) = self.shared.index.read().get(&id) {
            if !entry.is_tombstoned() {
                return Err(Error::duplicate_id(id));
            }
        }

        let (parent, chunks) = self.split_content(id, tags, content, now)?;
        let returned = parent.clone();
        self.writer.submit(WriteCommand::Put {
            parent,
            chunks,
            stale_chunks: Vec::new(),
            expect_existing: false,
        })??;
        EngineStats::bump(&self.shared.stats.creates);
        Ok(returned)
    }

    /// Replace an entity wholesale
    ///
    /// Full-replace semantics with history preserved through append-only
    /// blocks: resubmitted bodies keep their original timestamps, new
    /// bodies are stamped now, and bodies absent from `tags` are dropped
    /// from the current version (remaining visible to temporal queries).
    pub fn update<S: AsRef<str>>(
        &self,
        id: &str,
        tags: &[S],
        content: Vec<u8>,
    ) -> Result<Entity> {
        let id = EntityId::new(id)?;
        self.shared.guardian.check_write()?;
        let now = now_nanos();
        let parsed = self.parse_tags(tags, now)?;

        let _guard = self.shared.locks.write(&id)?;
        let old = self.shared.load_entity(&id)?;

        // Resubmitted bodies keep every (timestamp, body) pair already
        // recorded; only genuinely new bodies get the current wall time.
        // An explicitly timestamped resubmission of a known body is a
        // successive assignment and is kept alongside the prior pairs.
        let mut merged: Vec<TemporalTag> = Vec::with_capacity(parsed.len());
        for tag in parsed {
            let prior: Vec<&TemporalTag> =
                old.tags.iter().filter(|t| t.body == tag.body).collect();
            if prior.is_empty() {
                merged.push(tag);
            } else {
                for kept in prior {
                    if !merged.contains(kept) {
                        merged.push(kept.clone());
                    }
                }
                if tag.timestamp != now && !merged.contains(&tag) {
                    merged.push(tag);
                }
            }
        }

        let old_chunks = chunking::chunk_meta(&old).map(|m| m.count).unwrap_or(0);
        let (parent, chunks) = self.split_content(id.clone(), merged, content, now)?;
        let new_chunks = chunks.len() as u32;
        let stale_chunks: Vec<EntityId> = (new_chunks..old_chunks)
            .map(|i| id.chunk_child(i))
            .collect();

        let returned = parent.clone();
        self.writer.submit(WriteCommand::Put {
            parent,
            chunks,
            stale_chunks,
            expect_existing: true,
        })??;
        EngineStats::bump(&self.shared.stats.updates);
        Ok(returned)
    }

    /// Delete an entity and, transitively, its declared chunk children
    ///
    /// Deleting an already-tombstoned id is a no-op, not an error.
    pub fn delete(&self, id: &str) -> Result<()> {
        let id = EntityId::new(id)?;
        self.shared.guardian.check_write()?;
        let _guard = self.shared.locks.write(&id)?;
        self.writer.submit(WriteCommand::Delete {
            id,
            timestamp: now_nanos(),
        })??;
        EngineStats::bump(&self.shared.stats.deletes);
        Ok(())
    }

    /// Fetch an entity (content included, chunks reassembled)
    pub fn get(&self, id: &str) -> Result<Entity> {
        self.get_with(id, GetOptions::default())
    }

    /// Fetch an entity with explicit options
    pub fn get_with(&self, id: &str, opts: GetOptions) -> Result<Entity> {
        let id = EntityId::new(id)?;
        let _guard = self.shared.locks.read(&id)?;
        EngineStats::bump(&self.shared.stats.reads);

        let mut entity = match opts.as_of {
            // As-of reconstruction walks the append-only version timeline
            // so tags a later update removed are still visible, and it is
            // permitted on tombstoned ids like any temporal query.
            Some(t) => {
                if !self.shared.index.read().contains(&id) {
                    return Err(Error::not_found(id));
                }
                let events = self.timeline_for(&id)?;
                let version = temporal::version_at(&events, t)
                    .cloned()
                    .ok_or_else(|| Error::NotFoundAtTime {
                        id: id.clone(),
                        as_of: t,
                    })?;
                temporal::as_of_snapshot(&version, t)?
            }
            None => (*self.shared.load_entity(&id)?).clone(),
        };

        if !opts.include_content {
            entity.content.clear();
            return Ok(entity);
        }
        if !opts.raw && chunking::chunk_meta(&entity).is_some() {
            entity.content = self.reassemble(&entity)?;
        }
        Ok(entity)
    }

    /// Ids currently carrying `body`, sorted
    ///
    /// Unknown or malformed bodies yield an empty list; `listByTag` never
    /// errors.
    pub fn list_by_tag(&self, body: &str) -> Vec<EntityId> {
        let body = self.shared.interns.intern(body);
        self.shared.shards.lookup(&body)
    }

    /// Run a conjunctive tag query
    pub fn query(&self, query: &Query) -> Result<Vec<EntityId>> {
        let bodies = query.validated_bodies()?;
        let interned: Vec<Arc<str>> = bodies
            .iter()
            .map(|b| self.shared.interns.intern(b.as_str()))
            .collect();
        let refs: Vec<&str> = interned.iter().map(|b| b.as_ref()).collect();

        let mut ids = self.shared.shards.intersect(&refs);
        debug!(
            target: "entitydb::query",
            tags = query.tags.len(),
            matched = ids.len(),
            "query executed"
        );

        match query.sort {
            SortOrder::IdAscending => {}
            SortOrder::IdDescending => ids.reverse(),
            SortOrder::UpdatedDescending => {
                let mut keyed: Vec<(i64, EntityId)> = ids
                    .into_iter()
                    .map(|id| {
                        let updated = self
                            .shared
                            .load_entity(&id)
                            .ok()
                            .and_then(|e| e.updated_at())
                            .unwrap_or(i64::MIN);
                        (updated, id)
                    })
                    .collect();
                keyed.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
                ids = keyed.into_iter().map(|(_, id)| id).collect();
            }
        }

        let ids: Vec<EntityId> = ids
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(ids)
    }

    /// Stream an entity's content, verifying checksums chunk by chunk
    pub fn stream(&self, id: &str) -> Result<Box<dyn Iterator<Item = Result<Vec<u8>>> + '_>> {
        let id = EntityId::new(id)?;
        let _guard = self.shared.locks.read(&id)?;
        EngineStats::bump(&self.shared.stats.reads);

        let stored = self.shared.load_entity(&id)?;
        if chunking::chunk_meta(&stored).is_none() {
            let content = stored.content.clone();
            return Ok(Box::new(std::iter::once(Ok(content))));
        }

        let shared = Arc::clone(&self.shared);
        let stream = ContentStream::new(
            &stored,
            Box::new(move |child| shared.load_entity(child).map(|e| (*e).clone())),
        )?;
        Ok(Box::new(stream))
    }

    // =========================================================================
    // Temporal operations
    // =========================================================================

    /// Reconstruct an entity's state at time `t`
    pub fn as_of(&self, id: &str, t: i64) -> Result<Entity> {
        self.get_with(
            id,
            GetOptions {
                as_of: Some(t),
                ..GetOptions::default()
            },
        )
    }

    /// Per-entity change timeline, newest first
    pub fn history(&self, id: &str, limit: usize) -> Result<Vec<Change>> {
        let id = EntityId::new(id)?;
        if !self.shared.index.read().contains(&id) {
            return Err(Error::not_found(id));
        }
        let events = self.timeline_for(&id)?;
        Ok(temporal::history(&events, limit))
    }

    /// Snapshots at two points in time
    pub fn diff(&self, id: &str, t1: i64, t2: i64) -> Result<(Entity, Entity)> {
        Ok((self.as_of(id, t1)?, self.as_of(id, t2)?))
    }

    /// Changes across all entities strictly after `t`, in time order
    ///
    /// Chunk children are internal and excluded from the feed. The shard
    /// variants answer the common "anything new?" poll without touching
    /// the file: every derivable change timestamp is an assertion or
    /// retraction recorded there.
    pub fn changes_since(&self, t: i64, limit: usize) -> Result<Vec<EntityChange>> {
        if !self.shared.shards.any_timestamp_after(t) {
            debug!(target: "entitydb::temporal", after = t, "changes-since scan skipped");
            return Ok(Vec::new());
        }

        let mut timelines: FxHashMap<EntityId, Vec<TimelineEvent>> = FxHashMap::default();
        self.scan_timelines(|id, event| {
            if !id.is_chunk() {
                timelines.entry(id).or_default().push(event);
            }
        })?;
        Ok(temporal::changes_since(timelines, t, limit))
    }

    // =========================================================================
    // Datasets
    // =========================================================================

    /// Dataset names, from their registry entities
    pub fn list_datasets(&self) -> Vec<String> {
        self.list_by_tag("type:dataset")
            .iter()
            .filter_map(datasets::name_from_registry_id)
            .map(str::to_owned)
            .collect()
    }

    /// Create a dataset registry entity
    pub fn create_dataset(&self, name: &str) -> Result<()> {
        datasets::validate_name(name)?;
        let id = datasets::registry_id(name)?;
        self.create(
            id.as_str(),
            &["type:dataset".to_owned(), datasets::scope_tag(name)],
            Vec::new(),
        )?;
        Ok(())
    }

    /// Delete a dataset's registry entity
    ///
    /// Member entities keep their `dataset:` tags; datasets are a naming
    /// convention, not a container.
    pub fn delete_dataset(&self, name: &str) -> Result<()> {
        datasets::validate_name(name)?;
        self.delete(datasets::registry_id(name)?.as_str())
    }

    // =========================================================================
    // Maintenance operations
    // =========================================================================

    /// Force a checkpoint now
    pub fn checkpoint(&self) -> Result<CheckpointOutcome> {
        match self.writer.submit(WriteCommand::Checkpoint)?? {
            WriteOutcome::Checkpointed(outcome) => Ok(outcome),
            _ => Err(Error::invariant("checkpoint returned a foreign outcome")),
        }
    }

    /// Rewrite the file keeping only live entities
    pub fn compact(&self) -> Result<CompactOutcome> {
        match self.writer.submit(WriteCommand::Compact)?? {
            WriteOutcome::Compacted(outcome) => Ok(outcome),
            _ => Err(Error::invariant("compact returned a foreign outcome")),
        }
    }

    /// Discard and rebuild the tag shards from data blocks
    ///
    /// Blocks new writes for its duration (it runs on the writer thread);
    /// reads continue against the shards as they are swapped per shard.
    pub fn reindex(&self) -> Result<()> {
        self.writer.submit(WriteCommand::Reindex)??;
        Ok(())
    }

    /// Ingest a raw WAL record (admin reindex tooling only)
    pub fn ingest_wal_record(&self, raw: &[u8]) -> Result<u64> {
        let (record, _) = WalRecord::decode(raw).map_err(|e| Error::CorruptBlock {
            reason: format!("ingested record: {}", e),
        })?;
        if !record.op.is_mutation() {
            return Err(Error::invalid_filter(
                "only mutation records can be ingested",
            ));
        }
        match self.writer.submit(WriteCommand::Ingest { record })?? {
            WriteOutcome::Ingested { lsn } => Ok(lsn),
            _ => Err(Error::invariant("ingest returned a foreign outcome")),
        }
    }

    /// Full-scan integrity check
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        let entries: Vec<(EntityId, bool)> = {
            let index = self.shared.index.read();
            index
                .iter()
                .filter(|(_, e)| !e.is_tombstoned())
                .map(|(id, e)| (id.clone(), e.is_chunked()))
                .collect()
        };

        for (id, chunked) in entries {
            let entity = match self.shared.load_entity(&id) {
                Ok(entity) => entity,
                Err(e) => {
                    report.problems.push(format!("{}: {}", id, e));
                    continue;
                }
            };
            report.entities_checked += 1;

            if chunked || chunking::chunk_meta(&entity).is_some() {
                report.chunked_checked += 1;
                let shared = Arc::clone(&self.shared);
                match ContentStream::new(
                    &entity,
                    Box::new(move |child| shared.load_entity(child).map(|e| (*e).clone())),
                ) {
                    Ok(stream) => {
                        if let Err(e) = stream.read_all() {
                            report.problems.push(format!("{}: {}", id, e));
                        }
                    }
                    Err(e) => report.problems.push(format!("{}: {}", id, e)),
                }
            }
        }
        Ok(report)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Counters and sizes, point in time
    pub fn stats(&self) -> StatsSnapshot {
        let (entities_total, entities_live) = {
            let index = self.shared.index.read();
            (index.len(), index.live_len())
        };
        StatsSnapshot {
            creates: self.shared.stats.creates.load(Ordering::Relaxed),
            updates: self.shared.stats.updates.load(Ordering::Relaxed),
            deletes: self.shared.stats.deletes.load(Ordering::Relaxed),
            reads: self.shared.stats.reads.load(Ordering::Relaxed),
            checkpoints: self.shared.stats.checkpoints.load(Ordering::Relaxed),
            compactions: self.shared.stats.compactions.load(Ordering::Relaxed),
            recovered_records: self.shared.stats.recovered_records.load(Ordering::Relaxed),
            entities_total,
            entities_live,
            tag_bodies: self.shared.shards.body_count(),
            wal_bytes: self.shared.wal_bytes.load(Ordering::Relaxed),
            cache_hits: self.shared.cache.hits(),
            cache_misses: self.shared.cache.misses(),
            quarantined: self.shared.quarantine.len(),
        }
    }

    /// Ids tombstoned by integrity recovery this process lifetime
    pub fn quarantined(&self) -> Vec<EntityId> {
        self.shared.quarantine.list()
    }

    /// Change the base log level at runtime
    pub fn change_log_level(&self, level: &str) -> Result<()> {
        self.telemetry.change_log_level(level)
    }

    /// Replace the set of trace-enabled subsystems
    pub fn set_trace_subsystems(&self, subsystems: BTreeSet<TraceSubsystem>) -> Result<()> {
        self.telemetry.set_trace_subsystems(subsystems)
    }

    /// Current memory pressure level
    pub fn pressure(&self) -> PressureLevel {
        self.shared.guardian.level()
    }

    /// Drain pending writes, checkpoint, and stop background threads
    pub fn close(mut self) -> Result<()> {
        let result = self.writer.submit(WriteCommand::Checkpoint).and_then(|r| r);
        self.writer.shutdown();
        result.map(|_| ())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn parse_tags<S: AsRef<str>>(&self, tags: &[S], now: i64) -> Result<Vec<TemporalTag>> {
        let mut parsed = Vec::with_capacity(tags.len());
        for raw in tags {
            let raw = raw.as_ref();
            let tag = if raw.contains('|') || raw.contains("Z.") {
                TemporalTag::parse(raw)?
            } else {
                let interned = self.shared.interns.intern(raw);
                TemporalTag::at(now, TagBody::new(interned.as_ref())?)?
            };
            // The engine owns content metadata; caller echoes of it would
            // contradict the new content.
            if is_content_metadata(tag.body.as_str()) {
                continue;
            }
            if !parsed.contains(&tag) {
                parsed.push(tag);
            }
        }
        // Every fact in the system is a tag; an entity with none would be
        // unreachable by queries and invisible to the temporal index.
        if parsed.is_empty() {
            return Err(Error::invalid_tag("entity needs at least one tag"));
        }
        Ok(parsed)
    }

    fn split_content(
        &self,
        id: EntityId,
        tags: Vec<TemporalTag>,
        content: Vec<u8>,
        now: i64,
    ) -> Result<(Entity, Vec<Entity>)> {
        if content.len() > self.shared.config.chunk_size {
            let plan = chunking::plan_chunks(id, tags, content, self.shared.config.chunk_size, now)?;
            let mut parent = plan.parent;
            parent.normalize();
            Ok((parent, plan.chunks))
        } else {
            let mut parent = Entity::new(id, tags, content);
            parent.normalize();
            Ok((parent, Vec::new()))
        }
    }

    fn reassemble(&self, parent: &Entity) -> Result<Vec<u8>> {
        let shared = Arc::clone(&self.shared);
        ContentStream::new(
            parent,
            Box::new(move |child| shared.load_entity(child).map(|e| (*e).clone())),
        )?
        .read_all()
    }

    /// Scan every mutation frame in the file, in LSN order
    fn scan_timelines(&self, mut visit: impl FnMut(EntityId, TimelineEvent)) -> Result<()> {
        let path = self.shared.config.database_path();
        let mut handle = File::open(path)?;
        let scan = scan_wal(&mut handle, HEADER_REGION_SIZE as u64)?;
        let dict = self.shared.dict.read();

        for scanned in scan.records {
            match scanned.record.op {
                WalOp::PutEntity | WalOp::PutChunk => {
                    if let Ok(entity) = decode_block(&scanned.record.payload, &dict) {
                        let id = entity.id.clone();
                        visit(id, TimelineEvent::Put(entity));
                    }
                }
                WalOp::DeleteEntity => {
                    if let Some((timestamp, id)) =
                        recovery::decode_delete_payload(&scanned.record.payload)
                    {
                        visit(id, TimelineEvent::Delete { timestamp });
                    }
                }
                WalOp::Checkpoint
                | WalOp::DictSegment
                | WalOp::IndexSegment
                | WalOp::DictDelta => {}
            }
        }
        Ok(())
    }

    fn timeline_for(&self, id: &EntityId) -> Result<Vec<TimelineEvent>> {
        let mut events = Vec::new();
        self.scan_timelines(|event_id, event| {
            if &event_id == id {
                events.push(event);
            }
        })?;
        Ok(events)
    }
}

fn is_content_metadata(body: &str) -> bool {
    body.starts_with("content:chunks:")
        || body.starts_with("content:chunk-size:")
        || body.starts_with("content:size:")
        || body.starts_with("content:checksum:")
}

impl Shared {
    /// Load the stored (raw) entity behind `id`, through the cache
    fn load_entity(&self, id: &EntityId) -> Result<Arc<Entity>> {
        if let Some(cached) = self.cache.get(id) {
            return Ok(cached);
        }

        let (offset, size) = {
            let index = self.index.read();
            let entry = index.get(id).ok_or_else(|| Error::not_found(id.clone()))?;
            if entry.is_tombstoned() {
                return Err(Error::Tombstoned { id: id.clone() });
            }
            (entry.offset, entry.size)
        };

        let mut buf = self.pools.get(size as usize);
        let read = self.readers.read_into(offset, size as usize, &mut buf);
        let decoded = read.and_then(|()| {
            let dict = self.dict.read();
            decode_block(&buf, &dict).map_err(Error::from)
        });
        self.pools.put(buf);

        match decoded {
            Ok(entity) => {
                if &entity.id != id {
                    return Err(self.quarantine_block(id, "block id does not match index entry"));
                }
                let entity = Arc::new(entity);
                self.cache.insert(Arc::clone(&entity));
                Ok(entity)
            }
            // Transient I/O failures are retriable and must not cost the
            // entity its index entry.
            Err(e) if e.is_integrity() => Err(self.quarantine_block(id, &e.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Tombstone an unreadable block, at most once per id per process
    fn quarantine_block(&self, id: &EntityId, reason: &str) -> Error {
        if self.quarantine.should_attempt(id) {
            warn!(
                target: "entitydb::storage",
                %id,
                reason,
                "block failed integrity check, tombstoning"
            );
            self.quarantine.record(id);
            self.index.write().tombstone(id);
            self.cache.invalidate(id);
        }
        Error::CorruptBlock {
            reason: format!("{}: {}", id, reason),
        }
    }
}

fn apply(state: &mut WriterState, cmd: WriteCommand) -> Result<WriteOutcome> {
    let outcome = match cmd {
        WriteCommand::Put {
            parent,
            chunks,
            stale_chunks,
            expect_existing,
        } => apply_put_command(state, parent, chunks, stale_chunks, expect_existing),
        WriteCommand::Delete { id, timestamp } => apply_delete_command(state, id, timestamp),
        WriteCommand::Checkpoint => apply_checkpoint(state).map(WriteOutcome::Checkpointed),
        WriteCommand::Compact => apply_compact(state).map(WriteOutcome::Compacted),
        WriteCommand::Reindex => {
            let shared = Arc::clone(&state.shared);
            let dict = shared.dict.read();
            let index = shared.index.read();
            recovery::rebuild_shards(&mut state.file, &dict, &index, &shared.shards, true)
                .map(|()| WriteOutcome::Reindexed)
        }
        WriteCommand::Ingest { record } => apply_ingest(state, record),
    };

    state
        .shared
        .wal_bytes
        .store(state.file.wal_bytes(), Ordering::Relaxed);

    // Auto-checkpoint once the WAL region outgrows its threshold.
    if outcome.is_ok()
        && state.file.wal_bytes() >= state.shared.config.wal_checkpoint_threshold
    {
        if let Err(e) = apply_checkpoint(state) {
            warn!(target: "entitydb::wal", error = %e, "auto checkpoint failed");
        }
        state
            .shared
            .wal_bytes
            .store(state.file.wal_bytes(), Ordering::Relaxed);
    }

    outcome
}

fn persist_entity(state: &mut WriterState, entity: &Entity, op: WalOp) -> Result<u64> {
    let shared = Arc::clone(&state.shared);
    let (block, dict_delta) = {
        let mut dict = shared.dict.write();
        let baseline = dict.len() as u32;
        let block = encode_block(entity, &mut dict)?;
        let delta = (dict.len() as u32 > baseline)
            .then(|| dict.encode_entries_from(baseline + 1));
        (block, delta)
    };
    // Replay must be able to resolve freshly interned bodies, so their
    // delta precedes the block that references them.
    if let Some(delta) = dict_delta {
        state.file.append_record(WalOp::DictDelta, delta)?;
    }
    let info = state.file.append_record(op, block)?;
    {
        let dict = shared.dict.read();
        let mut index = shared.index.write();
        recovery::apply_put(
            &mut index,
            &shared.shards,
            entity,
            info.payload_offset,
            info.payload_len,
            &mut state.file,
            &dict,
        );
    }
    shared.cache.invalidate(&entity.id);
    Ok(info.lsn)
}

fn persist_delete(state: &mut WriterState, id: &EntityId, timestamp: i64) -> Result<u64> {
    let shared = Arc::clone(&state.shared);
    let payload = recovery::encode_delete_payload(timestamp, id);
    let info = state.file.append_record(WalOp::DeleteEntity, payload)?;
    {
        let dict = shared.dict.read();
        let mut index = shared.index.write();
        recovery::apply_delete(&mut index, &shared.shards, id, timestamp, &mut state.file, &dict);
    }
    shared.cache.invalidate(id);
    Ok(info.lsn)
}

fn apply_put_command(
    state: &mut WriterState,
    parent: Entity,
    chunks: Vec<Entity>,
    stale_chunks: Vec<EntityId>,
    expect_existing: bool,
) -> Result<WriteOutcome> {
    state.shared.guardian.check_write()?;

    // Re-validate against the authoritative index; the caller's check ran
    // outside the write order.
    {
        let index = state.shared.index.read();
        match index.get(&parent.id) {
            Some(entry) if !expect_existing && !entry.is_tombstoned() => {
                return Err(Error::duplicate_id(parent.id));
            }
            Some(entry) if expect_existing && entry.is_tombstoned() => {
                return Err(Error::Tombstoned {
                    id: parent.id.clone(),
                });
            }
            None if expect_existing => return Err(Error::not_found(parent.id)),
            _ => {}
        }
    }

    // Children first: a parent is never visible before its chunks.
    for chunk in &chunks {
        persist_entity(state, chunk, WalOp::PutChunk)?;
    }
    let lsn = persist_entity(state, &parent, WalOp::PutEntity)?;
    let timestamp = parent.updated_at().unwrap_or_else(now_nanos);
    for stale in &stale_chunks {
        persist_delete(state, stale, timestamp)?;
    }

    Ok(WriteOutcome::Put { lsn })
}

fn apply_delete_command(
    state: &mut WriterState,
    id: EntityId,
    timestamp: i64,
) -> Result<WriteOutcome> {
    state.shared.guardian.check_write()?;

    let (already, chunk_count) = {
        let index = state.shared.index.read();
        match index.get(&id) {
            None => return Err(Error::not_found(id)),
            Some(entry) if entry.is_tombstoned() => (true, 0),
            Some(entry) => {
                let dict = state.shared.dict.read();
                let count = state
                    .file
                    .read_at(entry.offset, entry.size as usize)
                    .ok()
                    .and_then(|bytes| decode_block(&bytes, &dict).ok())
                    .and_then(|e| chunking::chunk_meta(&e))
                    .map(|m| m.count)
                    .unwrap_or(0);
                (false, count)
            }
        }
    };
    if already {
        return Ok(WriteOutcome::Deleted { already: true });
    }

    persist_delete(state, &id, timestamp)?;
    // Referential closure: declared chunk children go with the parent.
    for i in 0..chunk_count {
        let child = id.chunk_child(i);
        let live = state
            .shared
            .index
            .read()
            .get(&child)
            .map(|e| !e.is_tombstoned())
            .unwrap_or(false);
        if live {
            persist_delete(state, &child, timestamp)?;
        }
    }

    Ok(WriteOutcome::Deleted { already: false })
}

fn apply_checkpoint(state: &mut WriterState) -> Result<CheckpointOutcome> {
    let shared = Arc::clone(&state.shared);
    let snapshot = shared.shards.snapshot_bytes(state.file.next_lsn());
    let outcome = {
        let dict = shared.dict.read();
        let mut index = shared.index.write();
        run_checkpoint(
            &mut state.file,
            &dict,
            &mut index,
            &snapshot,
            now_nanos().max(0) as u64,
        )?
    };
    EngineStats::bump(&shared.stats.checkpoints);
    Ok(outcome)
}

fn apply_compact(state: &mut WriterState) -> Result<CompactOutcome> {
    let shared = Arc::clone(&state.shared);
    let result = {
        let dict = shared.dict.read();
        let index = shared.index.read();
        compaction::compact(&mut state.file, &dict, &index, &shared.shards, now_nanos())?
    };

    state.file = result.file;
    *shared.dict.write() = result.dict;
    *shared.index.write() = result.index;
    shared.readers.bump_generation();
    shared.cache.clear();
    // The compacted file holds nothing but the live blocks already
    // registered in the shards, so the variants are complete again.
    shared.shards.mark_variants_authoritative();
    EngineStats::bump(&shared.stats.compactions);
    Ok(result.outcome)
}

fn apply_ingest(state: &mut WriterState, record: WalRecord) -> Result<WriteOutcome> {
    state.shared.guardian.check_write()?;
    let lsn = match record.op {
        WalOp::PutEntity | WalOp::PutChunk => {
            let entity = {
                let dict = state.shared.dict.read();
                decode_block(&record.payload, &dict)?
            };
            if entity.tags.is_empty() {
                return Err(Error::invalid_tag("ingested entity has no tags"));
            }
            persist_entity(state, &entity, record.op)?
        }
        WalOp::DeleteEntity => {
            let (timestamp, id) = recovery::decode_delete_payload(&record.payload)
                .ok_or_else(|| Error::CorruptBlock {
                    reason: "malformed delete payload".to_owned(),
                })?;
            persist_delete(state, &id, timestamp)?
        }
        _ => {
            return Err(Error::invalid_filter(
                "only mutation records can be ingested",
            ))
        }
    };
    Ok(WriteOutcome::Ingested { lsn })
}
