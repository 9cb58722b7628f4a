//! Memory guardian
//!
//! Samples this process's resident memory on a fixed tick and drives
//! staged reactions:
//!
//! - at ≥ 80 % of the soft limit: the engine halves the entity cache,
//!   drops interning tables, and stops parallel chunk work
//! - at ≥ 95 % of the soft limit (or past the hard limit): writes are
//!   additionally rejected with `MemoryPressure`
//!
//! Reactions fire on level *transitions*, not on every tick, so a steady
//! pressure state does not repeatedly shrink the cache. This bounds
//! recovery storms and cache growth after crashes.

use entitydb_core::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use sysinfo::System;
use tracing::{debug, warn};

/// Pressure states, in increasing severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    /// Below every threshold
    Normal = 0,
    /// At or above 80 % of the soft limit
    Elevated = 1,
    /// At or above 95 % of the soft limit, or past the hard limit
    Critical = 2,
}

impl PressureLevel {
    fn from_u8(v: u8) -> PressureLevel {
        match v {
            0 => PressureLevel::Normal,
            1 => PressureLevel::Elevated,
            _ => PressureLevel::Critical,
        }
    }
}

struct GuardianInner {
    soft_limit: u64,
    hard_limit: u64,
    level: AtomicU8,
    last_rss: AtomicU64,
    shutdown: AtomicBool,
}

impl GuardianInner {
    fn evaluate(&self, rss: u64) -> PressureLevel {
        if rss >= self.hard_limit || rss * 100 >= self.soft_limit * 95 {
            PressureLevel::Critical
        } else if rss * 100 >= self.soft_limit * 80 {
            PressureLevel::Elevated
        } else {
            PressureLevel::Normal
        }
    }

    fn apply_sample(&self, rss: u64, on_transition: &dyn Fn(PressureLevel)) {
        self.last_rss.store(rss, Ordering::Relaxed);
        let level = self.evaluate(rss);
        let previous = PressureLevel::from_u8(self.level.swap(level as u8, Ordering::SeqCst));
        if level != previous {
            if level > previous {
                warn!(
                    target: "entitydb::storage",
                    rss,
                    soft_limit = self.soft_limit,
                    ?level,
                    "memory pressure rising"
                );
            } else {
                debug!(target: "entitydb::storage", rss, ?level, "memory pressure easing");
            }
            on_transition(level);
        }
    }
}

/// Resident-memory sampler with staged pressure reactions
pub struct MemoryGuardian {
    inner: Arc<GuardianInner>,
    handle: Option<JoinHandle<()>>,
}

impl MemoryGuardian {
    /// The sampling tick
    pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

    /// Start the sampler thread
    ///
    /// `on_transition` runs on the sampler thread whenever the pressure
    /// level changes.
    pub fn spawn(
        soft_limit: u64,
        hard_limit: u64,
        on_transition: impl Fn(PressureLevel) + Send + 'static,
    ) -> Self {
        let inner = Arc::new(GuardianInner {
            soft_limit,
            hard_limit,
            level: AtomicU8::new(PressureLevel::Normal as u8),
            last_rss: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let thread_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("entitydb-memguard".to_owned())
            .spawn(move || {
                let mut system = System::new();
                let pid = match sysinfo::get_current_pid() {
                    Ok(pid) => pid,
                    Err(e) => {
                        warn!(target: "entitydb::storage", error = e, "memory guardian disabled");
                        return;
                    }
                };
                let nap = Duration::from_millis(50);
                'sampling: while !thread_inner.shutdown.load(Ordering::SeqCst) {
                    system.refresh_process(pid);
                    if let Some(process) = system.process(pid) {
                        thread_inner.apply_sample(process.memory(), &on_transition);
                    }
                    // Sleep the tick in short naps so shutdown is prompt.
                    let mut slept = Duration::ZERO;
                    while slept < Self::SAMPLE_INTERVAL {
                        if thread_inner.shutdown.load(Ordering::SeqCst) {
                            break 'sampling;
                        }
                        thread::sleep(nap);
                        slept += nap;
                    }
                }
            })
            .expect("spawn memory guardian");

        MemoryGuardian {
            inner,
            handle: Some(handle),
        }
    }

    /// A guardian that never samples, for tests and tools
    pub fn disabled(soft_limit: u64, hard_limit: u64) -> Self {
        MemoryGuardian {
            inner: Arc::new(GuardianInner {
                soft_limit,
                hard_limit,
                level: AtomicU8::new(PressureLevel::Normal as u8),
                last_rss: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
            handle: None,
        }
    }

    /// Current pressure level
    pub fn level(&self) -> PressureLevel {
        PressureLevel::from_u8(self.inner.level.load(Ordering::SeqCst))
    }

    /// Most recent resident-memory sample, bytes
    pub fn resident_bytes(&self) -> u64 {
        self.inner.last_rss.load(Ordering::Relaxed)
    }

    /// Gate for the write path
    pub fn check_write(&self) -> Result<()> {
        if self.level() == PressureLevel::Critical {
            return Err(Error::MemoryPressure {
                used: self.resident_bytes(),
                limit: self.inner.soft_limit,
            });
        }
        Ok(())
    }

    /// True if parallel chunk work should be declined
    pub fn restrict_parallelism(&self) -> bool {
        self.level() >= PressureLevel::Elevated
    }

    /// Feed one sample directly, bypassing the thread; for tests
    pub fn inject_sample(&self, rss: u64, on_transition: impl Fn(PressureLevel)) {
        self.inner.apply_sample(rss, &on_transition);
    }
}

impl Drop for MemoryGuardian {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
