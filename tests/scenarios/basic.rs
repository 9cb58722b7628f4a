//! Scenario 1: create, tag, list — plus the repository contracts around it

use crate::common::test_engine;
use entitydb::{EngineConfig, Engine, Error};

#[test]
fn scenario_create_tag_list() {
    let (engine, _dir) = test_engine();

    engine
        .create("e1", &["type:doc", "status:draft"], b"hello".to_vec())
        .unwrap();

    let docs = engine.list_by_tag("type:doc");
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].as_str(), "e1");

    assert!(engine.list_by_tag("status:published").is_empty());

    let e1 = engine.get("e1").unwrap();
    assert_eq!(e1.content, b"hello");
    assert!(e1.has_body("type:doc"));
    assert!(e1.has_body("status:draft"));
    assert!(e1.created_at().is_some());
}

#[test]
fn duplicate_id_rejected() {
    let (engine, _dir) = test_engine();
    engine.create("dup", &["type:doc"], Vec::new()).unwrap();
    assert!(matches!(
        engine.create("dup", &["type:doc"], Vec::new()),
        Err(Error::DuplicateId { .. })
    ));
}

#[test]
fn id_length_boundary() {
    let (engine, _dir) = test_engine();
    let ok = "a".repeat(64);
    let too_long = "a".repeat(65);

    engine.create(&ok, &["type:doc"], Vec::new()).unwrap();
    assert!(matches!(
        engine.create(&too_long, &["type:doc"], Vec::new()),
        Err(Error::InvalidTag { .. })
    ));
}

#[test]
fn tagless_entity_rejected() {
    let (engine, _dir) = test_engine();
    let no_tags: [&str; 0] = [];
    assert!(matches!(
        engine.create("bare", &no_tags, b"x".to_vec()),
        Err(Error::InvalidTag { .. })
    ));
    // Stripped engine-owned metadata does not count as a tag either.
    assert!(matches!(
        engine.create("meta-only", &["content:size:3"], b"x".to_vec()),
        Err(Error::InvalidTag { .. })
    ));
}

#[test]
fn get_missing_is_not_found() {
    let (engine, _dir) = test_engine();
    assert!(matches!(engine.get("ghost"), Err(Error::NotFound { .. })));
}

#[test]
fn delete_tombstones_and_is_idempotent() {
    let (engine, _dir) = test_engine();
    engine.create("victim", &["type:doc"], Vec::new()).unwrap();

    engine.delete("victim").unwrap();
    assert!(matches!(engine.get("victim"), Err(Error::Tombstoned { .. })));
    assert!(engine.list_by_tag("type:doc").is_empty());

    // Deleting an already-tombstoned id is a no-op, not an error.
    engine.delete("victim").unwrap();

    // Deleting something that never existed is.
    assert!(matches!(engine.delete("ghost"), Err(Error::NotFound { .. })));
}

#[test]
fn update_is_full_replace_with_kept_timestamps() {
    let (engine, _dir) = test_engine();
    engine
        .create("doc", &["1000|type:doc", "1000|status:draft"], Vec::new())
        .unwrap();

    let updated = engine
        .update("doc", &["type:doc", "status:published"], Vec::new())
        .unwrap();

    // Resubmitted body keeps its original timestamp; the new one is
    // stamped with wall time.
    assert_eq!(updated.created_at(), Some(1000));
    assert!(updated.updated_at().unwrap() > 1000);

    assert!(engine.list_by_tag("status:draft").is_empty());
    assert_eq!(engine.list_by_tag("status:published").len(), 1);
    assert_eq!(engine.list_by_tag("type:doc").len(), 1);
}

#[test]
fn update_missing_is_not_found() {
    let (engine, _dir) = test_engine();
    assert!(matches!(
        engine.update("ghost", &["type:doc"], Vec::new()),
        Err(Error::NotFound { .. })
    ));
}

#[test]
fn content_replaced_on_update() {
    let (engine, _dir) = test_engine();
    engine.create("doc", &["type:doc"], b"one".to_vec()).unwrap();
    engine.update("doc", &["type:doc"], b"two".to_vec()).unwrap();
    assert_eq!(engine.get("doc").unwrap().content, b"two");
}

#[test]
fn persistence_across_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = EngineConfig::for_testing(dir.path());

    let engine = Engine::open(config.clone()).unwrap();
    engine
        .create("keep", &["type:doc", "status:final"], b"payload".to_vec())
        .unwrap();
    engine.close().unwrap();

    let reopened = Engine::open(config).unwrap();
    let keep = reopened.get("keep").unwrap();
    assert_eq!(keep.content, b"payload");
    assert_eq!(reopened.list_by_tag("status:final").len(), 1);
    reopened.close().unwrap();
}

#[test]
fn datasets_round_trip() {
    let (engine, _dir) = test_engine();

    engine.create_dataset("main").unwrap();
    engine.create_dataset("archive").unwrap();
    let mut names = engine.list_datasets();
    names.sort();
    assert_eq!(names, vec!["archive", "main"]);

    // Members are scoped by convention: the dataset tag on the entity.
    engine
        .create("m1", &["type:doc", "dataset:main"], Vec::new())
        .unwrap();
    assert_eq!(engine.list_by_tag("dataset:main").len(), 2); // registry + member

    engine.delete_dataset("archive").unwrap();
    assert_eq!(engine.list_datasets(), vec!["main"]);

    assert!(engine.create_dataset("bad:name").is_err());
}

#[test]
fn get_options_raw_and_no_content() {
    let (engine, _dir) = test_engine();
    engine.create("doc", &["type:doc"], b"body".to_vec()).unwrap();

    let no_content = engine
        .get_with(
            "doc",
            entitydb::GetOptions {
                include_content: false,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(no_content.content.is_empty());
    assert!(no_content.has_body("type:doc"));
}
