//! Temporal reconstruction
//!
//! Tag timestamps give every entity a natural timeline. This module
//! derives the three temporal views from an entity's version sequence
//! (the append-only blocks for that id, in write order):
//!
//! - **as-of**: the tag set filtered to `timestamp ≤ T`
//! - **history**: per-entity changes, newest first
//! - **changes-since**: changes across entities after a cutoff
//!
//! Equal timestamps are broken by write order; `history` output is
//! monotone non-increasing in timestamp.

use entitydb_core::{Change, Entity, EntityId, Error, Result};
use sha2::{Digest, Sha256};
use std::cmp::Reverse;
use std::collections::BTreeSet;

/// One event of an entity's stored timeline
#[derive(Debug, Clone)]
pub enum TimelineEvent {
    /// A full version was written
    Put(Entity),
    /// The entity was tombstoned at this wall time
    Delete {
        /// Deletion wall time, ns
        timestamp: i64,
    },
}

/// Filter `latest` down to its state at time `t`
///
/// The tag set keeps exactly the tags with `timestamp ≤ t`; derived
/// `created_at`/`updated_at` follow from the filtered set. An empty
/// filtered set means the entity did not exist yet.
pub fn as_of_snapshot(latest: &Entity, t: i64) -> Result<Entity> {
    let tags: Vec<_> = latest
        .tags
        .iter()
        .filter(|tag| tag.timestamp <= t)
        .cloned()
        .collect();
    if tags.is_empty() {
        return Err(Error::NotFoundAtTime {
            id: latest.id.clone(),
            as_of: t,
        });
    }
    Ok(Entity::new(latest.id.clone(), tags, latest.content.clone()))
}

/// The version that was current at time `t`
///
/// A version becomes current at its write time (its maximum tag
/// timestamp) and stays current until superseded or deleted. Before the
/// first version's write time the first version itself is the candidate;
/// [`as_of_snapshot`] then decides, from the tag filter, whether the
/// entity existed at all.
pub fn version_at(events: &[TimelineEvent], t: i64) -> Option<&Entity> {
    let mut current: Option<&Entity> = None;
    let mut first: Option<&Entity> = None;
    for event in events {
        match event {
            TimelineEvent::Put(version) => {
                if first.is_none() {
                    first = Some(version);
                }
                if version.updated_at().unwrap_or(i64::MAX) <= t {
                    current = Some(version);
                }
            }
            TimelineEvent::Delete { timestamp } if *timestamp <= t => {
                current = None;
                first = None;
            }
            TimelineEvent::Delete { .. } => {}
        }
    }
    current.or(first)
}

fn content_digest(content: &[u8]) -> Option<String> {
    if content.is_empty() {
        None
    } else {
        Some(hex::encode(Sha256::digest(content)))
    }
}

/// Derive the change sequence from a version timeline, oldest first
pub fn derive_changes(events: &[TimelineEvent]) -> Vec<Change> {
    let mut changes = Vec::new();
    let mut prev: Option<&Entity> = None;

    for event in events {
        match event {
            TimelineEvent::Put(version) => {
                let write_time = version.updated_at().unwrap_or(0);
                match prev {
                    None => {
                        for tag in &version.tags {
                            changes.push(Change::tag_added(tag.timestamp, tag.body.clone()));
                        }
                        if !version.content.is_empty() {
                            changes.push(Change::content_changed(
                                write_time,
                                None,
                                content_digest(&version.content),
                            ));
                        }
                    }
                    Some(previous) => {
                        let prev_pairs: BTreeSet<(i64, &str)> = previous
                            .tags
                            .iter()
                            .map(|t| (t.timestamp, t.body.as_str()))
                            .collect();
                        for tag in &version.tags {
                            if !prev_pairs.contains(&(tag.timestamp, tag.body.as_str())) {
                                changes.push(Change::tag_added(tag.timestamp, tag.body.clone()));
                            }
                        }
                        for body in previous.bodies() {
                            if !version.tags.iter().any(|t| &t.body == body) {
                                changes.push(Change::tag_removed(write_time, (*body).clone()));
                            }
                        }
                        if previous.content != version.content {
                            changes.push(Change::content_changed(
                                write_time,
                                content_digest(&previous.content),
                                content_digest(&version.content),
                            ));
                        }
                    }
                }
                prev = Some(version);
            }
            TimelineEvent::Delete { timestamp } => {
                if let Some(previous) = prev {
                    for body in previous.bodies() {
                        changes.push(Change::tag_removed(*timestamp, (*body).clone()));
                    }
                    if !previous.content.is_empty() {
                        changes.push(Change::content_changed(
                            *timestamp,
                            content_digest(&previous.content),
                            None,
                        ));
                    }
                }
                prev = None;
            }
        }
    }
    changes
}

/// Per-entity change timeline, newest first
///
/// Stable-sorted descending by timestamp, so equal-timestamp changes keep
/// their derivation (write) order.
pub fn history(events: &[TimelineEvent], limit: usize) -> Vec<Change> {
    let mut changes = derive_changes(events);
    changes.sort_by_key(|c| Reverse(c.timestamp));
    changes.truncate(limit);
    changes
}

/// A change attributed to its entity, for changes-since feeds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityChange {
    /// The changed entity
    pub id: EntityId,
    /// What changed
    pub change: Change,
}

/// Changes across all entities strictly after `t`, in time order
pub fn changes_since(
    timelines: impl IntoIterator<Item = (EntityId, Vec<TimelineEvent>)>,
    t: i64,
    limit: usize,
) -> Vec<EntityChange> {
    let mut out: Vec<EntityChange> = Vec::new();
    for (id, events) in timelines {
        for change in derive_changes(&events) {
            if change.timestamp > t {
                out.push(EntityChange {
                    id: id.clone(),
                    change,
                });
            }
        }
    }
    out.sort_by_key(|c| c.change.timestamp);
    out.truncate(limit);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitydb_core::{ChangeKind, TagBody, TemporalTag};

    fn tag(ts: i64, body: &str) -> TemporalTag {
        TemporalTag::at(ts, TagBody::new(body).unwrap()).unwrap()
    }

    fn entity(id: &str, tags: Vec<TemporalTag>, content: &[u8]) -> Entity {
        Entity::new(EntityId::new(id).unwrap(), tags, content.to_vec())
    }

    #[test]
    fn test_as_of_filters_tags() {
        let latest = entity(
            "u1",
            vec![
                tag(100, "type:user"),
                tag(100, "role:reader"),
                tag(200, "role:admin"),
            ],
            b"",
        );

        let at_100 = as_of_snapshot(&latest, 100).unwrap();
        assert_eq!(at_100.tags.len(), 2);
        assert!(at_100.has_body("role:reader"));
        assert!(!at_100.has_body("role:admin"));
        assert_eq!(at_100.created_at(), Some(100));
        assert_eq!(at_100.updated_at(), Some(100));

        let at_200 = as_of_snapshot(&latest, 200).unwrap();
        assert_eq!(at_200.tags.len(), 3);
        assert_eq!(at_200.updated_at(), Some(200));
    }

    #[test]
    fn test_as_of_before_creation() {
        let latest = entity("u1", vec![tag(100, "type:user")], b"");
        assert!(matches!(
            as_of_snapshot(&latest, 99),
            Err(Error::NotFoundAtTime { as_of: 99, .. })
        ));
    }

    #[test]
    fn test_version_at_picks_current_version() {
        // v1 written at 10, v2 at 20.
        let v1 = entity("u", vec![tag(10, "type:user"), tag(10, "role:reader")], b"");
        let v2 = entity("u", vec![tag(10, "type:user"), tag(20, "role:admin")], b"");
        let events = [TimelineEvent::Put(v1), TimelineEvent::Put(v2)];

        // Between the writes the first version is current, so the removed
        // role is still visible.
        let at_10 = version_at(&events, 10).unwrap();
        assert!(at_10.has_body("role:reader"));
        assert!(!at_10.has_body("role:admin"));

        let at_20 = version_at(&events, 20).unwrap();
        assert!(at_20.has_body("role:admin"));
        assert!(!at_20.has_body("role:reader"));

        // Before creation the first version is offered; the tag filter
        // downstream decides existence.
        let early = version_at(&events, 5).unwrap();
        assert!(as_of_snapshot(early, 5).is_err());
    }

    #[test]
    fn test_version_at_respects_delete() {
        let v1 = entity("u", vec![tag(10, "type:user")], b"");
        let events = [
            TimelineEvent::Put(v1),
            TimelineEvent::Delete { timestamp: 50 },
        ];
        assert!(version_at(&events, 49).is_some());
        assert!(version_at(&events, 50).is_none());
    }

    #[test]
    fn test_first_version_changes() {
        let v1 = entity("e", vec![tag(10, "type:doc"), tag(10, "status:draft")], b"x");
        let changes = derive_changes(&[TimelineEvent::Put(v1)]);
        assert_eq!(changes.len(), 3);
        assert!(changes
            .iter()
            .filter(|c| c.kind == ChangeKind::TagAdded)
            .count()
            == 2);
        assert!(changes.iter().any(|c| c.kind == ChangeKind::ContentChanged));
    }

    #[test]
    fn test_update_diff() {
        // v1: reader at 10; v2 keeps type:user (same pair), adds admin at
        // 20, drops reader.
        let v1 = entity("u", vec![tag(10, "type:user"), tag(10, "role:reader")], b"");
        let v2 = entity("u", vec![tag(10, "type:user"), tag(20, "role:admin")], b"");
        let changes = derive_changes(&[TimelineEvent::Put(v1), TimelineEvent::Put(v2)]);

        let added: Vec<_> = changes
            .iter()
            .filter(|c| c.kind == ChangeKind::TagAdded)
            .collect();
        let removed: Vec<_> = changes
            .iter()
            .filter(|c| c.kind == ChangeKind::TagRemoved)
            .collect();

        // v1 contributes two additions, v2 exactly one (the kept pair is
        // not re-added).
        assert_eq!(added.len(), 3);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].tag_body.as_ref().unwrap().as_str(), "role:reader");
        assert_eq!(removed[0].timestamp, 20);
    }

    #[test]
    fn test_history_newest_first() {
        let v1 = entity("u", vec![tag(10, "type:user"), tag(10, "role:reader")], b"");
        let v2 = entity("u", vec![tag(10, "type:user"), tag(20, "role:admin")], b"");
        let events = [TimelineEvent::Put(v1), TimelineEvent::Put(v2)];

        let changes = history(&events, 10);
        assert!(changes.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

        // The role:admin addition leads, the role:reader addition follows.
        let admin_pos = changes
            .iter()
            .position(|c| {
                c.kind == ChangeKind::TagAdded
                    && c.tag_body.as_ref().unwrap().as_str() == "role:admin"
            })
            .unwrap();
        let reader_pos = changes
            .iter()
            .position(|c| {
                c.kind == ChangeKind::TagAdded
                    && c.tag_body.as_ref().unwrap().as_str() == "role:reader"
            })
            .unwrap();
        assert!(admin_pos < reader_pos);
    }

    #[test]
    fn test_history_limit() {
        let v1 = entity("u", vec![tag(10, "a:1"), tag(11, "b:2"), tag(12, "c:3")], b"");
        let changes = history(&[TimelineEvent::Put(v1)], 2);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].timestamp, 12);
    }

    #[test]
    fn test_delete_emits_removals() {
        let v1 = entity("u", vec![tag(10, "type:user")], b"payload");
        let events = [TimelineEvent::Put(v1), TimelineEvent::Delete { timestamp: 50 }];
        let changes = derive_changes(&events);

        assert!(changes
            .iter()
            .any(|c| c.kind == ChangeKind::TagRemoved && c.timestamp == 50));
        assert!(changes
            .iter()
            .any(|c| c.kind == ChangeKind::ContentChanged && c.new.is_none()));
    }

    #[test]
    fn test_changes_since_cutoff_and_order() {
        let a = entity("a", vec![tag(10, "type:doc"), tag(30, "status:done")], b"");
        let b = entity("b", vec![tag(20, "type:doc")], b"");

        let changes = changes_since(
            vec![
                (EntityId::new("a").unwrap(), vec![TimelineEvent::Put(a)]),
                (EntityId::new("b").unwrap(), vec![TimelineEvent::Put(b)]),
            ],
            15,
            10,
        );

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].id.as_str(), "b");
        assert_eq!(changes[0].change.timestamp, 20);
        assert_eq!(changes[1].change.timestamp, 30);
    }
}
