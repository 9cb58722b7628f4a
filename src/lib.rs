//! EntityDB — a temporal entity database
//!
//! Every fact is a tag on an entity, stored with a nanosecond timestamp;
//! the engine answers current-state, as-of, history, and diff queries
//! over a single crash-safe binary file with an embedded write-ahead log,
//! a 256-way sharded tag index, and transparent chunking for large
//! content.
//!
//! # Quick start
//!
//! ```no_run
//! use entitydb::{Engine, EngineConfig};
//!
//! # fn main() -> entitydb::Result<()> {
//! let engine = Engine::open(EngineConfig::at("/var/lib/entitydb"))?;
//!
//! engine.create("doc-1", &["type:doc", "status:draft"], b"hello".to_vec())?;
//! let ids = engine.list_by_tag("type:doc");
//! assert_eq!(ids.len(), 1);
//!
//! let doc = engine.get("doc-1")?;
//! assert_eq!(doc.content, b"hello");
//! engine.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! The crate is a thin facade; the implementation lives in the workspace
//! members:
//!
//! - `entitydb-core`: ids, temporal tags, entities, errors, config
//! - `entitydb-storage`: the unified file format, WAL, shards, caches
//! - `entitydb-concurrency`: locks, memory guardian, writer queue
//! - `entitydb-engine`: the [`Engine`] itself

#![warn(missing_docs)]

pub use entitydb_concurrency::PressureLevel;
pub use entitydb_core::{
    Change, ChangeKind, EngineConfig, Entity, EntityId, Error, ErrorCategory, Result, TagBody,
    TemporalTag, TraceSubsystem,
};
pub use entitydb_engine::{
    CompactOutcome, Engine, EntityChange, GetOptions, Query, SortOrder, StatsSnapshot,
    VerifyReport,
};

/// Storage-level types, exposed for tooling and tests
pub mod storage {
    pub use entitydb_storage::{
        CheckpointOutcome, EntityIndex, FileHeader, ShardedTagIndex, TagDict, UnifiedFile, WalOp,
        WalRecord, FORMAT_VERSION, MAGIC,
    };
}
