//! Runtime-adjustable diagnostics
//!
//! The engine logs through `tracing` under per-subsystem targets
//! (`entitydb::wal`, `entitydb::storage`, ...). [`Telemetry`] owns a
//! reloadable filter so operators can change the base level or the set
//! of trace-enabled subsystems without a restart.
//!
//! Installing a global subscriber is optional; when the host application
//! already has one (tests, embedding servers), `Telemetry::detached`
//! keeps the runtime knobs as no-ops.

use entitydb_core::{Error, Result, TraceSubsystem};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Reloadable logging state
pub struct Telemetry {
    handle: Option<FilterHandle>,
    base_level: Mutex<String>,
    subsystems: Mutex<BTreeSet<TraceSubsystem>>,
}

impl Telemetry {
    /// Install a global subscriber with a reloadable filter
    ///
    /// If a subscriber is already installed this degrades to
    /// [`Telemetry::detached`].
    pub fn install(base_level: &str, subsystems: &BTreeSet<TraceSubsystem>) -> Telemetry {
        let filter = match build_filter(base_level, subsystems) {
            Ok(filter) => filter,
            Err(_) => EnvFilter::new("info"),
        };
        let (layer, handle) = reload::Layer::new(filter);
        let installed = tracing_subscriber::registry()
            .with(layer)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .is_ok();

        Telemetry {
            handle: installed.then_some(handle),
            base_level: Mutex::new(base_level.to_owned()),
            subsystems: Mutex::new(subsystems.clone()),
        }
    }

    /// Telemetry that tracks state but controls no subscriber
    pub fn detached(base_level: &str, subsystems: &BTreeSet<TraceSubsystem>) -> Telemetry {
        Telemetry {
            handle: None,
            base_level: Mutex::new(base_level.to_owned()),
            subsystems: Mutex::new(subsystems.clone()),
        }
    }

    /// Change the base log level (`error`..`trace`) at runtime
    pub fn change_log_level(&self, level: &str) -> Result<()> {
        // Validate regardless of whether a subscriber is attached.
        let subsystems = self.subsystems.lock().clone();
        let filter = build_filter(level, &subsystems)?;
        if let Some(handle) = &self.handle {
            handle
                .reload(filter)
                .map_err(|e| Error::invariant(format!("filter reload failed: {}", e)))?;
        }
        *self.base_level.lock() = level.to_owned();
        info!(target: "entitydb::storage", level, "log level changed");
        Ok(())
    }

    /// Replace the set of subsystems traced at `TRACE` level
    pub fn set_trace_subsystems(&self, subsystems: BTreeSet<TraceSubsystem>) -> Result<()> {
        let level = self.base_level.lock().clone();
        let filter = build_filter(&level, &subsystems)?;
        if let Some(handle) = &self.handle {
            handle
                .reload(filter)
                .map_err(|e| Error::invariant(format!("filter reload failed: {}", e)))?;
        }
        *self.subsystems.lock() = subsystems;
        Ok(())
    }

    /// The current base level
    pub fn base_level(&self) -> String {
        self.base_level.lock().clone()
    }

    /// The current traced subsystems
    pub fn trace_subsystems(&self) -> BTreeSet<TraceSubsystem> {
        self.subsystems.lock().clone()
    }
}

fn build_filter(base_level: &str, subsystems: &BTreeSet<TraceSubsystem>) -> Result<EnvFilter> {
    // A bare word would otherwise parse as a target directive; require a
    // real level for the base.
    base_level
        .parse::<tracing::Level>()
        .map_err(|_| Error::invalid_config(format!("unknown log level {:?}", base_level)))?;

    let mut directives = base_level.to_owned();
    for subsystem in subsystems {
        directives.push_str(&format!(",{}=trace", subsystem.target()));
    }
    EnvFilter::try_new(&directives)
        .map_err(|e| Error::invalid_config(format!("bad log level {:?}: {}", base_level, e)))
}
