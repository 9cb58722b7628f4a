//! Temporal tags
//!
//! Every fact in EntityDB is a tag on an entity, stored with a nanosecond
//! timestamp. On disk and on the wire a tag is a single string:
//!
//! ```text
//! 2024-06-16T18:40:00.000000000Z|type:doc
//! 1718563200000000000|type:doc
//! ```
//!
//! i.e. an RFC 3339 timestamp with nanosecond precision (or a raw
//! nanosecond integer) joined to the tag body with `|`. Internally a tag is
//! the pair `(timestamp_ns, body)`; parsing and formatting of the string
//! encoding is confined to this module and the storage codec.
//!
//! A historical encoding delimited with `.` after the `Z` suffix is still
//! accepted on read and silently re-encoded with `|` the next time the
//! owning entity is rewritten.
//!
//! # Body grammar
//!
//! `namespace[:subspace...]:value`, case-preserving, matched by exact
//! string equality. The top-level namespaces `type`, `status`, `id`,
//! `rbac`, `conf`, `meta`, `content` and `dataset` are reserved for the
//! engine and its upstream layers.

use crate::error::{Error, Result};
use crate::time::{format_rfc3339_nanos, parse_rfc3339_nanos};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeSet;
use std::fmt;

/// Largest representable tag timestamp (ns); the year-2262 boundary
pub const MAX_TIMESTAMP_NANOS: i64 = i64::MAX;

/// Reserved top-level namespaces
static RESERVED_NAMESPACES: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    ["type", "status", "id", "rbac", "conf", "meta", "content", "dataset"]
        .into_iter()
        .collect()
});

/// A validated tag body: `namespace[:subspace...]:value`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagBody(String);

impl TagBody {
    /// Validate and wrap a tag body
    pub fn new(body: impl Into<String>) -> Result<Self> {
        let body = body.into();
        if body.is_empty() {
            return Err(Error::invalid_tag("tag body must not be empty"));
        }
        if !body.contains(':') {
            return Err(Error::invalid_tag(format!(
                "tag body {:?} has no namespace separator",
                body
            )));
        }
        if body.starts_with(':') || body.ends_with(':') {
            return Err(Error::invalid_tag(format!(
                "tag body {:?} has an empty namespace or value",
                body
            )));
        }
        if body.chars().any(|c| c.is_control() || c == '|') {
            return Err(Error::invalid_tag(format!(
                "tag body {:?} contains a control character or '|'",
                body
            )));
        }
        Ok(TagBody(body))
    }

    /// The body as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The top-level namespace (everything before the first `:`)
    pub fn namespace(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    /// The `:`-separated segments of the body
    pub fn segments(&self) -> SmallVec<[&str; 4]> {
        self.0.split(':').collect()
    }

    /// True if the top-level namespace is reserved for the engine
    pub fn is_reserved(&self) -> bool {
        RESERVED_NAMESPACES.contains(self.namespace())
    }

    /// True if the body starts with `prefix` followed by the rest of a
    /// segment path, e.g. `has_prefix("content:")`
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    /// The value after a known prefix, e.g.
    /// `value_after("content:chunks:")` on `content:chunks:3` yields `"3"`
    pub fn value_after(&self, prefix: &str) -> Option<&str> {
        self.0.strip_prefix(prefix)
    }
}

impl fmt::Display for TagBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TagBody {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A `(timestamp, body)` pair attached to an entity
///
/// Ordering is by timestamp first, then body, matching the timeline order
/// readers observe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TemporalTag {
    /// Nanoseconds since the Unix epoch
    pub timestamp: i64,
    /// The tag body
    pub body: TagBody,
}

impl TemporalTag {
    /// Construct a tag at an explicit timestamp
    pub fn at(timestamp: i64, body: TagBody) -> Result<Self> {
        if timestamp < 0 {
            return Err(Error::bad_temporal_tag(
                format!("{}|{}", timestamp, body),
                "timestamp is negative",
            ));
        }
        Ok(TemporalTag { timestamp, body })
    }

    /// Parse the string encoding
    ///
    /// Accepts `"<RFC3339Nano>|<body>"`, `"<raw ns integer>|<body>"`, and
    /// the legacy `"<RFC3339>Z.<body>"` form. Anything else is a
    /// [`Error::BadTemporalTag`].
    pub fn parse(raw: &str) -> Result<Self> {
        let (ts_str, body_str) = match raw.split_once('|') {
            Some(parts) => parts,
            None => match raw.find("Z.") {
                // Legacy delimiter: split right after the zone suffix.
                Some(pos) => (&raw[..pos + 1], &raw[pos + 2..]),
                None => {
                    return Err(Error::bad_temporal_tag(raw, "no timestamp delimiter"));
                }
            },
        };

        let timestamp = Self::parse_timestamp(ts_str)
            .map_err(|reason| Error::bad_temporal_tag(raw, reason))?;
        let body = TagBody::new(body_str)?;
        Ok(TemporalTag { timestamp, body })
    }

    fn parse_timestamp(ts_str: &str) -> std::result::Result<i64, String> {
        if ts_str.is_empty() {
            return Err("empty timestamp".to_owned());
        }
        if ts_str.bytes().all(|b| b.is_ascii_digit()) {
            // Raw nanosecond integer; i64 parse overflow catches the
            // year-2262 boundary.
            return ts_str
                .parse::<i64>()
                .map_err(|_| "timestamp overflows i64 nanoseconds".to_owned());
        }
        parse_rfc3339_nanos(ts_str)
            .ok_or_else(|| "not RFC 3339 or outside the nanosecond range".to_owned())
    }

    /// The canonical string encoding, always `|`-delimited
    pub fn encode(&self) -> String {
        format!("{}|{}", format_rfc3339_nanos(self.timestamp), self.body)
    }
}

impl fmt::Display for TemporalTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
