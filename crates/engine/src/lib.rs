//! The EntityDB engine
//!
//! [`Engine`] is the single entry point: it owns the unified file, the
//! in-memory dictionary and index, the sharded tag index, the entity
//! cache, the lock manager, the memory guardian, and the serialized
//! writer thread. There are no process-wide singletons; construct an
//! engine at startup and pass it by reference.
//!
//! Capability flags (cache on/off, memory-mapped reads) are plain
//! configuration; there is exactly one engine type.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunking;
pub mod compaction;
pub mod datasets;
pub mod engine;
pub mod observability;
pub mod query;
pub mod recovery;
pub mod stats;
pub mod temporal;

pub use chunking::{ChunkMeta, ContentStream};
pub use compaction::CompactOutcome;
pub use engine::{Engine, GetOptions, VerifyReport, WriteOutcome};
pub use observability::Telemetry;
pub use query::{Query, SortOrder};
pub use recovery::{Quarantine, RecoveryReport};
pub use stats::StatsSnapshot;
pub use temporal::{EntityChange, TimelineEvent};
