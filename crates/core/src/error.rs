//! Unified error taxonomy
//!
//! Every error surfaced by the engine carries a machine-readable kind.
//! Callers never downcast; they match on variants or use the category
//! predicates below.
//!
//! Categories:
//!
//! - **Input**: the caller sent something wrong; deterministic, never retriable
//! - **Integrity**: on-disk state failed a check; non-retriable at this level
//! - **Resource**: transient pressure; `Io`, `LockTimeout` and
//!   `MemoryPressure` are safe to retry
//! - **Internal**: `InvariantViolation` is always a bug and is logged with
//!   full context at the site that raises it

use crate::id::EntityId;
use std::io;
use thiserror::Error;

/// Result type alias for EntityDB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller-supplied input was invalid
    Input,
    /// Stored data failed an integrity check
    Integrity,
    /// Resource exhaustion or contention
    Resource,
    /// A broken internal invariant (a bug)
    Internal,
}

/// Error type for the EntityDB core
#[derive(Debug, Error)]
pub enum Error {
    /// Entity does not exist
    #[error("not found: {id}")]
    NotFound {
        /// The id that was looked up
        id: EntityId,
    },

    /// `create` was called with an id that already exists
    #[error("duplicate id: {id}")]
    DuplicateId {
        /// The conflicting id
        id: EntityId,
    },

    /// Tag body or entity id failed validation
    #[error("invalid tag: {reason}")]
    InvalidTag {
        /// What failed
        reason: String,
    },

    /// A temporal tag string could not be parsed
    #[error("bad temporal tag {raw:?}: {reason}")]
    BadTemporalTag {
        /// The raw string as received
        raw: String,
        /// Why it was rejected
        reason: String,
    },

    /// A query filter was malformed
    #[error("invalid filter: {reason}")]
    InvalidFilter {
        /// What failed
        reason: String,
    },

    /// A configuration option was rejected at startup
    #[error("invalid config: {reason}")]
    InvalidConfig {
        /// What failed
        reason: String,
    },

    /// `as_of` asked for a time before the entity existed
    #[error("{id} did not exist at {as_of}")]
    NotFoundAtTime {
        /// The entity
        id: EntityId,
        /// The requested timestamp (ns)
        as_of: i64,
    },

    /// Content or block checksum did not match
    #[error("checksum mismatch on {context}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// What was being verified (entity id, chunk id, header slot)
        context: String,
        /// Expected digest, hex
        expected: String,
        /// Observed digest, hex
        actual: String,
    },

    /// A declared chunk child of a chunked entity is absent
    #[error("chunk {index} of {parent} is missing")]
    ChunkMissing {
        /// Parent entity id
        parent: EntityId,
        /// Zero-based chunk index
        index: u32,
    },

    /// Both header slots failed their CRC
    #[error("corrupt header: {reason}")]
    CorruptHeader {
        /// What failed
        reason: String,
    },

    /// An entity data block failed to decode
    #[error("corrupt data block: {reason}")]
    CorruptBlock {
        /// What failed
        reason: String,
    },

    /// File does not start with the `EBDF` magic
    #[error("bad magic: {found:#010x}")]
    BadMagic {
        /// The four bytes that were found
        found: u32,
    },

    /// An offset or length points outside the file
    #[error("index out of range: offset {offset} + len {len} exceeds file size {file_size}")]
    IndexOutOfRange {
        /// Start offset
        offset: u64,
        /// Length requested
        len: u64,
        /// Actual file size
        file_size: u64,
    },

    /// The tag dictionary exhausted its 32-bit id space
    #[error("tag dictionary overflow at {count} entries")]
    DictOverflow {
        /// Entry count at overflow
        count: u64,
    },

    /// I/O failure (retriable)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Memory guardian rejected the operation (retriable)
    #[error("memory pressure: {used} of {limit} bytes in use")]
    MemoryPressure {
        /// Resident bytes at sample time
        used: u64,
        /// Configured limit that was exceeded
        limit: u64,
    },

    /// Lock acquisition exceeded its deadline (retriable)
    #[error("lock timeout on {id}")]
    LockTimeout {
        /// The contended entity
        id: EntityId,
    },

    /// Re-entrant write lock on the same id in one call stack
    #[error("deadlock: write lock on {id} already held by this operation")]
    Deadlock {
        /// The entity being locked twice
        id: EntityId,
    },

    /// The entity exists but is tombstoned
    #[error("tombstoned: {id}")]
    Tombstoned {
        /// The deleted entity
        id: EntityId,
    },

    /// A broken internal invariant; always a bug
    #[error("invariant violation: {message}")]
    InvariantViolation {
        /// Full context
        message: String,
    },
}

impl Error {
    /// Create a [`Error::NotFound`]
    pub fn not_found(id: EntityId) -> Self {
        Error::NotFound { id }
    }

    /// Create a [`Error::DuplicateId`]
    pub fn duplicate_id(id: EntityId) -> Self {
        Error::DuplicateId { id }
    }

    /// Create a [`Error::InvalidTag`]
    pub fn invalid_tag(reason: impl Into<String>) -> Self {
        Error::InvalidTag {
            reason: reason.into(),
        }
    }

    /// Create a [`Error::BadTemporalTag`]
    pub fn bad_temporal_tag(raw: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::BadTemporalTag {
            raw: raw.into(),
            reason: reason.into(),
        }
    }

    /// Create a [`Error::InvalidFilter`]
    pub fn invalid_filter(reason: impl Into<String>) -> Self {
        Error::InvalidFilter {
            reason: reason.into(),
        }
    }

    /// Create a [`Error::InvalidConfig`]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a [`Error::ChecksumMismatch`]
    pub fn checksum_mismatch(
        context: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Error::ChecksumMismatch {
            context: context.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a [`Error::InvariantViolation`]
    pub fn invariant(message: impl Into<String>) -> Self {
        Error::InvariantViolation {
            message: message.into(),
        }
    }

    /// Which coarse category this error belongs to
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::NotFound { .. }
            | Error::DuplicateId { .. }
            | Error::InvalidTag { .. }
            | Error::BadTemporalTag { .. }
            | Error::InvalidFilter { .. }
            | Error::InvalidConfig { .. }
            | Error::NotFoundAtTime { .. } => ErrorCategory::Input,

            Error::ChecksumMismatch { .. }
            | Error::ChunkMissing { .. }
            | Error::CorruptHeader { .. }
            | Error::CorruptBlock { .. }
            | Error::BadMagic { .. }
            | Error::IndexOutOfRange { .. }
            | Error::DictOverflow { .. } => ErrorCategory::Integrity,

            Error::Io(_)
            | Error::MemoryPressure { .. }
            | Error::LockTimeout { .. }
            | Error::Deadlock { .. }
            | Error::Tombstoned { .. } => ErrorCategory::Resource,

            Error::InvariantViolation { .. } => ErrorCategory::Internal,
        }
    }

    /// True if a caller may safely retry the operation
    ///
    /// Only `Io`, `LockTimeout` and `MemoryPressure` qualify; everything
    /// else is deterministic or indicates damaged state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::LockTimeout { .. } | Error::MemoryPressure { .. }
        )
    }

    /// True for integrity-class errors
    pub fn is_integrity(&self) -> bool {
        self.category() == ErrorCategory::Integrity
    }

    /// True for input-class errors
    pub fn is_input(&self) -> bool {
        self.category() == ErrorCategory::Input
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            Error::not_found(id("e1")).category(),
            ErrorCategory::Input
        );
        assert_eq!(
            Error::checksum_mismatch("e1", "aa", "bb").category(),
            ErrorCategory::Integrity
        );
        assert_eq!(
            Error::LockTimeout { id: id("e1") }.category(),
            ErrorCategory::Resource
        );
        assert_eq!(
            Error::invariant("impossible state").category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Io(io::Error::new(io::ErrorKind::Other, "disk")).is_retryable());
        assert!(Error::LockTimeout { id: id("e1") }.is_retryable());
        assert!(Error::MemoryPressure {
            used: 100,
            limit: 50
        }
        .is_retryable());

        assert!(!Error::not_found(id("e1")).is_retryable());
        assert!(!Error::Deadlock { id: id("e1") }.is_retryable());
        assert!(!Error::checksum_mismatch("e1", "aa", "bb").is_retryable());
        assert!(!Error::invariant("bug").is_retryable());
    }

    #[test]
    fn test_display_carries_context() {
        let e = Error::ChunkMissing {
            parent: id("big"),
            index: 2,
        };
        let msg = e.to_string();
        assert!(msg.contains("big"));
        assert!(msg.contains('2'));

        let e = Error::BadMagic { found: 0xdeadbeef };
        assert!(e.to_string().contains("0xdeadbeef"));

        let e = Error::IndexOutOfRange {
            offset: 100,
            len: 32,
            file_size: 64,
        };
        assert!(e.to_string().contains("100"));
    }

    #[test]
    fn test_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.is_retryable());
    }
}
