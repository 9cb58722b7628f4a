//! Concurrency control for EntityDB
//!
//! - [`LockManager`]: per-entity read/write locks with acquisition
//!   deadlines, re-entrant write detection, and a traced acquire/release
//!   history for deadlock diagnostics
//! - [`MemoryGuardian`]: resident-memory sampler driving staged pressure
//!   reactions (cache shrink, intern drop, write rejection)
//! - [`WriterQueue`]: the bounded FIFO plus single writer thread that
//!   serializes every mutation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod guardian;
pub mod locks;
pub mod writer;

pub use guardian::{MemoryGuardian, PressureLevel};
pub use locks::{LockEvent, LockKind, LockManager, ReadGuard, WriteGuard};
pub use writer::{CancelToken, WriterQueue};
