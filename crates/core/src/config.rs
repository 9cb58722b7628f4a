//! Engine configuration
//!
//! Every recognized option has a default; a config deserialized from an
//! empty JSON object behaves identically to [`EngineConfig::default`].
//! `validate` is called once at engine startup and rejects configurations
//! the storage layer cannot honor.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default auto-chunking threshold and piece size: 4 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;
/// Default WAL bytes before an automatic checkpoint: 64 MiB
pub const DEFAULT_WAL_CHECKPOINT_THRESHOLD: u64 = 64 * 1024 * 1024;
/// Default entity cache TTL in seconds
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 300;
/// The tag index shard count; fixed unless rebuilding
pub const TAG_INDEX_SHARDS: usize = 256;

/// A traceable subsystem, enabling targeted diagnostics at runtime
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TraceSubsystem {
    /// Write-ahead log appends, syncs, replay
    Wal,
    /// File codec, index, checkpoints
    Storage,
    /// Large-content split and reassembly
    Chunking,
    /// As-of, history, diff queries
    Temporal,
    /// Lock manager acquire/release
    Locks,
    /// Tag filters and intersection planning
    Query,
}

impl TraceSubsystem {
    /// The `tracing` target this subsystem logs under
    pub fn target(&self) -> &'static str {
        match self {
            TraceSubsystem::Wal => "entitydb::wal",
            TraceSubsystem::Storage => "entitydb::storage",
            TraceSubsystem::Chunking => "entitydb::chunking",
            TraceSubsystem::Temporal => "entitydb::temporal",
            TraceSubsystem::Locks => "entitydb::locks",
            TraceSubsystem::Query => "entitydb::query",
        }
    }

    /// All subsystems
    pub fn all() -> [TraceSubsystem; 6] {
        [
            TraceSubsystem::Wal,
            TraceSubsystem::Storage,
            TraceSubsystem::Chunking,
            TraceSubsystem::Temporal,
            TraceSubsystem::Locks,
            TraceSubsystem::Query,
        ]
    }
}

impl fmt::Display for TraceSubsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TraceSubsystem::Wal => "wal",
            TraceSubsystem::Storage => "storage",
            TraceSubsystem::Chunking => "chunking",
            TraceSubsystem::Temporal => "temporal",
            TraceSubsystem::Locks => "locks",
            TraceSubsystem::Query => "query",
        };
        f.write_str(name)
    }
}

impl FromStr for TraceSubsystem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "wal" => Ok(TraceSubsystem::Wal),
            "storage" => Ok(TraceSubsystem::Storage),
            "chunking" => Ok(TraceSubsystem::Chunking),
            "temporal" => Ok(TraceSubsystem::Temporal),
            "locks" => Ok(TraceSubsystem::Locks),
            "query" => Ok(TraceSubsystem::Query),
            other => Err(Error::invalid_config(format!(
                "unknown trace subsystem {:?}",
                other
            ))),
        }
    }
}

/// Recognized engine options; all have defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Directory containing the unified file
    pub data_path: PathBuf,
    /// Name of the unified file inside `data_path`
    pub database_filename: String,
    /// Threshold and piece size for auto-chunking, bytes
    pub chunk_size: usize,
    /// WAL bytes before an automatic checkpoint
    pub wal_checkpoint_threshold: u64,
    /// Memory guardian soft limit, bytes; pressure reactions start at 80 %
    pub memory_soft_limit: u64,
    /// Memory guardian hard limit, bytes
    pub memory_hard_limit: u64,
    /// Entity cache TTL in seconds
    pub cache_ttl_seconds: u64,
    /// Entity cache capacity in entries
    pub cache_capacity: usize,
    /// Tag index shard count; must be [`TAG_INDEX_SHARDS`]
    pub index_shard_count: usize,
    /// Enable memory-mapped reads
    pub high_performance_mode: bool,
    /// Subsystems traced at `TRACE` level
    pub trace_subsystems: BTreeSet<TraceSubsystem>,
    /// Bound of the writer FIFO
    pub writer_queue_depth: usize,
    /// Per-entity lock acquisition deadline, seconds
    pub lock_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            data_path: PathBuf::from("."),
            database_filename: "entities.edb".to_owned(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            wal_checkpoint_threshold: DEFAULT_WAL_CHECKPOINT_THRESHOLD,
            memory_soft_limit: 1024 * 1024 * 1024,
            memory_hard_limit: 2 * 1024 * 1024 * 1024,
            cache_ttl_seconds: DEFAULT_CACHE_TTL_SECONDS,
            cache_capacity: 4096,
            index_shard_count: TAG_INDEX_SHARDS,
            high_performance_mode: false,
            trace_subsystems: BTreeSet::new(),
            writer_queue_depth: 1024,
            lock_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// A config rooted at `data_path` with all defaults
    pub fn at(data_path: impl Into<PathBuf>) -> Self {
        EngineConfig {
            data_path: data_path.into(),
            ..Default::default()
        }
    }

    /// Small thresholds for tests: 64 KiB chunks, 1 MiB WAL checkpoint,
    /// tiny cache
    pub fn for_testing(data_path: impl Into<PathBuf>) -> Self {
        EngineConfig {
            data_path: data_path.into(),
            chunk_size: 64 * 1024,
            wal_checkpoint_threshold: 1024 * 1024,
            cache_ttl_seconds: 60,
            cache_capacity: 128,
            writer_queue_depth: 64,
            ..Default::default()
        }
    }

    /// Load a config from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config: EngineConfig = serde_json::from_slice(&bytes)
            .map_err(|e| Error::invalid_config(format!("config parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the storage layer cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.index_shard_count != TAG_INDEX_SHARDS {
            return Err(Error::invalid_config(format!(
                "index_shard_count must be {}, got {}",
                TAG_INDEX_SHARDS, self.index_shard_count
            )));
        }
        if self.chunk_size < 64 * 1024 {
            return Err(Error::invalid_config(format!(
                "chunk_size must be at least 64 KiB, got {}",
                self.chunk_size
            )));
        }
        if self.memory_soft_limit > self.memory_hard_limit {
            return Err(Error::invalid_config(
                "memory_soft_limit exceeds memory_hard_limit",
            ));
        }
        if self.writer_queue_depth == 0 {
            return Err(Error::invalid_config("writer_queue_depth must be positive"));
        }
        if self.database_filename.is_empty()
            || self.database_filename.contains(std::path::MAIN_SEPARATOR)
        {
            return Err(Error::invalid_config(format!(
                "database_filename {:?} must be a bare file name",
                self.database_filename
            )));
        }
        Ok(())
    }

    /// Full path of the unified file
    pub fn database_path(&self) -> PathBuf {
        self.data_path.join(&self.database_filename)
    }

    /// The lock acquisition deadline as a `Duration`
    pub fn lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.lock_timeout_secs)
    }

    /// The cache TTL as a `Duration`
    pub fn cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cache_ttl_seconds)
    }
}
