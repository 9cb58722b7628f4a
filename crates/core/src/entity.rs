//! The entity model
//!
//! An entity is an id, an ordered timeline of temporal tags, and optional
//! binary content. `created_at` / `updated_at` are never stored; they are
//! always the minimum / maximum tag timestamp.

use crate::id::EntityId;
use crate::tag::{TagBody, TemporalTag};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The unit of storage: an id, a temporal tag timeline, and content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique identifier
    pub id: EntityId,
    /// Tags in write order; timestamps are non-decreasing
    pub tags: Vec<TemporalTag>,
    /// Inline binary content; empty for chunked entities
    pub content: Vec<u8>,
}

impl Entity {
    /// Assemble an entity
    pub fn new(id: EntityId, tags: Vec<TemporalTag>, content: Vec<u8>) -> Self {
        Entity { id, tags, content }
    }

    /// Minimum tag timestamp, if any tags exist
    pub fn created_at(&self) -> Option<i64> {
        self.tags.iter().map(|t| t.timestamp).min()
    }

    /// Maximum tag timestamp, if any tags exist
    pub fn updated_at(&self) -> Option<i64> {
        self.tags.iter().map(|t| t.timestamp).max()
    }

    /// The distinct tag bodies this entity currently carries
    pub fn bodies(&self) -> BTreeSet<&TagBody> {
        self.tags.iter().map(|t| &t.body).collect()
    }

    /// True if any tag has exactly this body
    pub fn has_body(&self, body: &str) -> bool {
        self.tags.iter().any(|t| t.body.as_str() == body)
    }

    /// The value of the first tag whose body starts with `prefix`
    ///
    /// Used for metadata lookups such as `content:chunks:`.
    pub fn value_after(&self, prefix: &str) -> Option<&str> {
        self.tags.iter().find_map(|t| t.body.value_after(prefix))
    }

    /// True if tag timestamps are non-decreasing in write order
    pub fn is_monotone(&self) -> bool {
        self.tags.windows(2).all(|w| w[0].timestamp <= w[1].timestamp)
    }

    /// Stable-sort the timeline by timestamp, preserving write order among
    /// equal timestamps
    pub fn normalize(&mut self) {
        self.tags.sort_by_key(|t| t.timestamp);
    }

    /// Encode every tag in its canonical string form
    pub fn tag_strings(&self) -> Vec<String> {
        self.tags.iter().map(TemporalTag::encode).collect()
    }
}

/// What changed at one point of an entity's timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// A tag body appeared
    TagAdded,
    /// A tag body was no longer present in the following version
    TagRemoved,
    /// The content bytes changed
    ContentChanged,
}

/// One entry of a per-entity change timeline or a changes-since feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// When the change happened (ns)
    pub timestamp: i64,
    /// What kind of change
    pub kind: ChangeKind,
    /// The affected tag body, for tag changes
    pub tag_body: Option<TagBody>,
    /// Previous value, where meaningful (content digests)
    pub old: Option<String>,
    /// New value, where meaningful
    pub new: Option<String>,
}

impl Change {
    /// A tag-added change
    pub fn tag_added(timestamp: i64, body: TagBody) -> Self {
        Change {
            timestamp,
            kind: ChangeKind::TagAdded,
            tag_body: Some(body),
            old: None,
            new: None,
        }
    }

    /// A tag-removed change
    pub fn tag_removed(timestamp: i64, body: TagBody) -> Self {
        Change {
            timestamp,
            kind: ChangeKind::TagRemoved,
            tag_body: Some(body),
            old: None,
            new: None,
        }
    }

    /// A content change, with optional digests for the two sides
    pub fn content_changed(timestamp: i64, old: Option<String>, new: Option<String>) -> Self {
        Change {
            timestamp,
            kind: ChangeKind::ContentChanged,
            tag_body: None,
            old,
            new,
        }
    }
}
