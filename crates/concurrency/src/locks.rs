//! Per-entity lock manager
//!
//! Read operations take a read lock on the target id for the duration of
//! the read; writes take the write lock. Acquisitions carry a deadline
//! (default 30 s) and expire with `LockTimeout`. A thread that already
//! holds the write lock on an id and asks for it again fails fast with
//! `Deadlock` instead of hanging on itself.
//!
//! Locks are `parking_lot` raw rwlocks held behind `Arc`, so guards own
//! their lock and stay valid however long the caller keeps them. Every
//! acquire and release lands in a bounded trace ring for post-mortem
//! diagnostics and is emitted under the `entitydb::locks` target.

use dashmap::DashMap;
use entitydb_core::{EntityId, Error, Result};
use parking_lot::lock_api::{RawRwLock as RawRwLockApi, RawRwLockTimed};
use parking_lot::{Mutex, RawRwLock};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::trace;

const TRACE_CAPACITY: usize = 256;

struct EntityLock {
    raw: RawRwLock,
}

impl EntityLock {
    fn new() -> Self {
        EntityLock {
            raw: RawRwLockApi::INIT,
        }
    }
}

/// Which lock an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Shared read lock
    Read,
    /// Exclusive write lock
    Write,
}

/// One acquire or release, as recorded in the trace ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEvent {
    /// The locked entity
    pub id: EntityId,
    /// Read or write
    pub kind: LockKind,
    /// True for acquire, false for release
    pub acquired: bool,
    /// The thread involved
    pub thread: ThreadId,
}

#[derive(Default)]
struct LockTrace {
    events: Mutex<VecDeque<LockEvent>>,
}

impl LockTrace {
    fn record(&self, id: &EntityId, kind: LockKind, acquired: bool) {
        trace!(
            target: "entitydb::locks",
            %id,
            ?kind,
            acquired,
            "lock event"
        );
        let mut events = self.events.lock();
        if events.len() == TRACE_CAPACITY {
            events.pop_front();
        }
        events.push_back(LockEvent {
            id: id.clone(),
            kind,
            acquired,
            thread: thread::current().id(),
        });
    }
}

/// Hands out per-entity read/write locks keyed by id
pub struct LockManager {
    locks: DashMap<EntityId, Arc<EntityLock>>,
    held_writes: DashMap<ThreadId, FxHashSet<EntityId>>,
    timeout: Duration,
    trace: LockTrace,
}

impl LockManager {
    /// Create a manager with the given acquisition deadline
    pub fn new(timeout: Duration) -> Self {
        LockManager {
            locks: DashMap::new(),
            held_writes: DashMap::new(),
            timeout,
            trace: LockTrace::default(),
        }
    }

    fn lock_for(&self, id: &EntityId) -> Arc<EntityLock> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(EntityLock::new()))
            .clone()
    }

    /// Acquire the read lock on `id`
    pub fn read(&self, id: &EntityId) -> Result<ReadGuard<'_>> {
        let lock = self.lock_for(id);
        if !lock.raw.try_lock_shared_for(self.timeout) {
            return Err(Error::LockTimeout { id: id.clone() });
        }
        self.trace.record(id, LockKind::Read, true);
        Ok(ReadGuard {
            manager: self,
            id: id.clone(),
            lock,
        })
    }

    /// Acquire the write lock on `id`
    ///
    /// Fails fast with `Deadlock` if this thread already holds the write
    /// lock on the same id.
    pub fn write(&self, id: &EntityId) -> Result<WriteGuard<'_>> {
        let thread = thread::current().id();
        if let Some(held) = self.held_writes.get(&thread) {
            if held.contains(id) {
                return Err(Error::Deadlock { id: id.clone() });
            }
        }

        let lock = self.lock_for(id);
        if !lock.raw.try_lock_exclusive_for(self.timeout) {
            return Err(Error::LockTimeout { id: id.clone() });
        }

        self.held_writes.entry(thread).or_default().insert(id.clone());
        self.trace.record(id, LockKind::Write, true);
        Ok(WriteGuard {
            manager: self,
            id: id.clone(),
            thread,
            lock,
        })
    }

    /// Recent lock events, oldest first
    pub fn recent_events(&self) -> Vec<LockEvent> {
        self.trace.events.lock().iter().cloned().collect()
    }

    /// Number of ids with a lock allocated
    pub fn tracked(&self) -> usize {
        self.locks.len()
    }
}

/// RAII read guard from [`LockManager::read`]
pub struct ReadGuard<'a> {
    manager: &'a LockManager,
    id: EntityId,
    lock: Arc<EntityLock>,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        // Safety: this guard's constructor acquired the shared lock and
        // release happens exactly once, here.
        unsafe { self.lock.raw.unlock_shared() };
        self.manager.trace.record(&self.id, LockKind::Read, false);
    }
}

/// RAII write guard from [`LockManager::write`]
pub struct WriteGuard<'a> {
    manager: &'a LockManager,
    id: EntityId,
    thread: ThreadId,
    lock: Arc<EntityLock>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        // Safety: this guard's constructor acquired the exclusive lock and
        // release happens exactly once, here.
        unsafe { self.lock.raw.unlock_exclusive() };
        if let Some(mut held) = self.manager.held_writes.get_mut(&self.thread) {
            held.remove(&self.id);
        }
        self.manager.trace.record(&self.id, LockKind::Write, false);
    }
}
