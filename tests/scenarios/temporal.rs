//! Scenario 2: temporal snapshots, history, diff, changes-since

use crate::common::test_engine;
use entitydb::{ChangeKind, Error};

/// Create at T0=1000 with reader role, update at T1=2000 to admin.
fn seed_user(engine: &entitydb::Engine) {
    engine
        .create("u1", &["1000|type:user", "1000|role:reader"], Vec::new())
        .unwrap();
    engine
        .update("u1", &["1000|type:user", "2000|role:admin"], Vec::new())
        .unwrap();
}

#[test]
fn scenario_temporal_snapshot() {
    let (engine, _dir) = test_engine();
    seed_user(&engine);

    let at_t0 = engine.as_of("u1", 1000).unwrap();
    assert!(at_t0.has_body("type:user"));
    assert!(at_t0.has_body("role:reader"));
    assert!(!at_t0.has_body("role:admin"));

    let at_t1 = engine.as_of("u1", 2000).unwrap();
    assert!(at_t1.has_body("type:user"));
    assert!(at_t1.has_body("role:admin"));
    assert!(!at_t1.has_body("role:reader"));
}

#[test]
fn scenario_history_order() {
    let (engine, _dir) = test_engine();
    seed_user(&engine);

    let history = engine.history("u1", 10).unwrap();
    assert!(!history.is_empty());

    // Newest first, monotone non-increasing timestamps.
    assert!(history
        .windows(2)
        .all(|w| w[0].timestamp >= w[1].timestamp));

    // The role:admin addition leads, the role:reader addition follows.
    let pos = |body: &str| {
        history
            .iter()
            .position(|c| {
                c.kind == ChangeKind::TagAdded
                    && c.tag_body.as_ref().map(|b| b.as_str()) == Some(body)
            })
            .unwrap()
    };
    assert!(pos("role:admin") < pos("role:reader"));
}

#[test]
fn history_limit_applies() {
    let (engine, _dir) = test_engine();
    seed_user(&engine);
    assert_eq!(engine.history("u1", 1).unwrap().len(), 1);
}

#[test]
fn as_of_before_creation() {
    let (engine, _dir) = test_engine();
    seed_user(&engine);
    assert!(matches!(
        engine.as_of("u1", 999),
        Err(Error::NotFoundAtTime { as_of: 999, .. })
    ));
}

#[test]
fn as_of_unknown_id() {
    let (engine, _dir) = test_engine();
    assert!(matches!(
        engine.as_of("ghost", 1000),
        Err(Error::NotFound { .. })
    ));
}

#[test]
fn diff_returns_both_snapshots() {
    let (engine, _dir) = test_engine();
    seed_user(&engine);

    let (before, after) = engine.diff("u1", 1000, 2000).unwrap();
    assert!(before.has_body("role:reader"));
    assert!(after.has_body("role:admin"));
}

#[test]
fn changes_since_cutoff() {
    let (engine, _dir) = test_engine();
    seed_user(&engine);

    let changes = engine.changes_since(1500, 100).unwrap();
    assert!(!changes.is_empty());
    assert!(changes.iter().all(|c| c.change.timestamp > 1500));
    assert!(changes.iter().all(|c| c.id.as_str() == "u1"));

    // Ascending time order.
    assert!(changes
        .windows(2)
        .all(|w| w[0].change.timestamp <= w[1].change.timestamp));
}

#[test]
fn changes_since_future_cutoff_is_empty() {
    let (engine, _dir) = test_engine();
    seed_user(&engine);
    // Nothing changed after this point; the shard variants answer the
    // poll without a file scan.
    assert!(engine.changes_since(i64::MAX - 1, 10).unwrap().is_empty());
}

#[test]
fn year_2262_timestamp_rejected() {
    let (engine, _dir) = test_engine();
    assert!(matches!(
        engine.create("over", &["9223372036854775808|type:doc"], Vec::new()),
        Err(Error::BadTemporalTag { .. })
    ));
    assert!(matches!(
        engine.create("over", &["2262-04-12T00:00:00Z|type:doc"], Vec::new()),
        Err(Error::BadTemporalTag { .. })
    ));
}

#[test]
fn as_of_still_answers_for_tombstoned_ids() {
    let (engine, _dir) = test_engine();
    engine
        .create("gone", &["1000|type:doc"], Vec::new())
        .unwrap();
    engine.delete("gone").unwrap();

    // The current read refuses, the temporal read does not.
    assert!(matches!(engine.get("gone"), Err(Error::Tombstoned { .. })));
    let snapshot = engine.as_of("gone", 1500).unwrap();
    assert!(snapshot.has_body("type:doc"));
}

#[test]
fn legacy_dot_delimited_tags_accepted() {
    let (engine, _dir) = test_engine();
    engine
        .create("old", &["2024-06-16T18:40:00Z.type:doc"], Vec::new())
        .unwrap();
    assert_eq!(engine.list_by_tag("type:doc").len(), 1);
}
