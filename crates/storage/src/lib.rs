//! Storage layer for EntityDB
//!
//! This crate implements the unified single-file binary format and the
//! in-memory structures loaded from it:
//!
//! - **Format**: header (dual slots, CRC fallback), tag dictionary, fixed
//!   32-byte entity index entries, entity data blocks
//! - **WAL**: embedded write-ahead log occupying the file tail past the
//!   checkpointed extent, with CRC32C records and torn-tail truncation
//! - **Checkpoint**: dictionary/index rewrite, header swap, WAL reset
//! - **Sharded tag index**: 256-way concurrent `tag → {entity-id}` map
//!   with snapshot persistence and rebuild
//! - **Cache & pools**: LRU entity cache with TTL, tiered buffer pools,
//!   bounded string interning
//! - **Reader pool**: reusable pread/mmap readers for concurrent reads
//!
//! # File layout
//!
//! ```text
//! ┌──────────────┬───────────────────────────────────┬──────────────┐
//! │ Header ×2    │ Data region                       │ WAL region   │
//! │ (64 B slots) │ (blocks, dictionary, index)       │ (file tail)  │
//! └──────────────┴───────────────────────────────────┴──────────────┘
//! 0            128                         header.file_size        EOF
//! ```
//!
//! The file is log-structured: `header.file_size` is the durable
//! checkpointed extent and the WAL region is exactly the bytes past it.
//! Entity blocks ride inside their WAL record's payload and are addressed
//! in place, so blocks never move; a checkpoint appends a fresh dictionary
//! and index, swaps the header over them, and starts an empty WAL region.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod checkpoint;
pub mod file;
pub mod format;
pub mod pools;
pub mod reader;
pub mod shards;
pub mod wal;

pub use cache::{EntityCache, InternTable};
pub use checkpoint::{checkpoint, parse_checkpoint_payload, CheckpointOutcome};
pub use file::{AppendInfo, UnifiedFile};
pub use format::block::{decode_block, encode_block, BlockError};
pub use format::dictionary::{DictionaryError, TagDict};
pub use format::header::{FileHeader, HeaderError};
pub use format::index::{flags, EntityIndex, IndexEntry, IndexError};
pub use format::{FORMAT_VERSION, HEADER_REGION_SIZE, HEADER_SLOT_SIZE, MAGIC};
pub use pools::BufferPools;
pub use reader::ReaderPool;
pub use shards::{ShardSnapshot, ShardedTagIndex, TAG_SHARD_COUNT};
pub use wal::record::{WalOp, WalRecord, WalRecordError, WAL_RECORD_OVERHEAD};
pub use wal::replay::{scan_wal, ScannedRecord, WalScan};
