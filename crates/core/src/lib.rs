//! Core types for the EntityDB temporal database
//!
//! This crate defines the foundational vocabulary shared by every layer:
//!
//! - [`EntityId`]: validated entity identifier with canonical 16-byte index form
//! - [`TagBody`] / [`TemporalTag`]: the `namespace:...:value` tag grammar and
//!   the `(timestamp_ns, body)` pair every fact is stored as
//! - [`Entity`]: an id, a temporal tag timeline, and optional binary content
//! - [`Error`]: the unified, kind-tagged error taxonomy
//! - [`EngineConfig`]: recognized configuration options with defaults
//!
//! No I/O happens here. Parsing and formatting of the on-disk temporal tag
//! encoding (`"<RFC3339Nano>|<body>"`) lives in [`tag`] so the storage codec
//! is the only other place that touches raw tag strings.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod entity;
pub mod error;
pub mod id;
pub mod tag;
pub mod time;

pub use config::{EngineConfig, TraceSubsystem};
pub use entity::{Change, ChangeKind, Entity};
pub use error::{Error, ErrorCategory, Result};
pub use id::{EntityId, IndexKey, MAX_ID_BYTES};
pub use tag::{TagBody, TemporalTag, MAX_TIMESTAMP_NANOS};
pub use time::{format_rfc3339_nanos, now_nanos, parse_rfc3339_nanos};
