//! Embedded write-ahead log
//!
//! The WAL occupies the file tail past `header.file_size`. Records are
//! self-delimiting, CRC32C-protected, and carry entity data blocks as
//! their payload so a replay is a re-index, never a data copy.
//!
//! - [`record`]: the record byte format
//! - [`replay`]: forward scan with torn-tail detection
//!
//! Durable appends live on [`crate::file::UnifiedFile`], which owns the
//! file handle; the append contract (write, sync, re-read, CRC verify) is
//! documented there.

pub mod record;
pub mod replay;

pub use record::{WalOp, WalRecord, WalRecordError, WAL_PAYLOAD_OFFSET, WAL_RECORD_OVERHEAD};
pub use replay::{scan_wal, ScannedRecord, WalScan};
