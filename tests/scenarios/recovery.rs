//! Scenario 6: bounded integrity recovery and the quarantine

use crate::common::corrupt_first_occurrence;
use entitydb::{Engine, EngineConfig, Error};
use tempfile::TempDir;

/// Create an entity, checkpoint, close, then corrupt its block's id
/// bytes on disk so the block decodes to a different id than the index
/// entry claims.
fn corrupted_db(id: &str) -> (EngineConfig, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing(dir.path());

    let engine = Engine::open(config.clone()).unwrap();
    engine
        .create(id, &["type:doc"], b"important".to_vec())
        .unwrap();
    engine.close().unwrap();

    // The first occurrence of the id bytes in the file is inside the
    // entity's data block.
    corrupt_first_occurrence(&config.database_path(), id.as_bytes());
    (config, dir)
}

#[test]
fn scenario_recovery_bounded() {
    let (config, _dir) = corrupted_db("victim-doc");
    let engine = Engine::open(config).unwrap();

    // First read detects the damage, tombstones, and quarantines.
    let first = engine.get("victim-doc");
    assert!(matches!(first, Err(Error::CorruptBlock { .. })));
    let quarantined = engine.quarantined();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].as_str(), "victim-doc");
    assert_eq!(engine.stats().quarantined, 1);

    // Subsequent reads hit the tombstone; recovery is never re-attempted.
    for _ in 0..5 {
        assert!(matches!(
            engine.get("victim-doc"),
            Err(Error::Tombstoned { .. })
        ));
    }
    assert_eq!(engine.quarantined().len(), 1);
}

#[test]
fn metric_entities_excluded_from_recovery() {
    let (config, _dir) = corrupted_db("metric_cpu_load");
    let engine = Engine::open(config).unwrap();

    // Damage is reported but the metric id is neither tombstoned nor
    // quarantined; metrics are regenerable.
    for _ in 0..3 {
        assert!(matches!(
            engine.get("metric_cpu_load"),
            Err(Error::CorruptBlock { .. })
        ));
    }
    assert!(engine.quarantined().is_empty());
    assert_eq!(engine.stats().quarantined, 0);
}

#[test]
fn healthy_entities_unaffected_by_quarantine() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing(dir.path());

    let engine = Engine::open(config.clone()).unwrap();
    engine
        .create("victim-doc", &["type:doc"], b"x".to_vec())
        .unwrap();
    engine
        .create("healthy-doc", &["type:doc"], b"fine".to_vec())
        .unwrap();
    engine.close().unwrap();

    corrupt_first_occurrence(&config.database_path(), b"victim-doc");

    let engine = Engine::open(config).unwrap();
    assert!(engine.get("victim-doc").is_err());
    assert_eq!(engine.get("healthy-doc").unwrap().content, b"fine");
    assert_eq!(engine.quarantined().len(), 1);
}

#[test]
fn verify_reports_structural_damage() {
    let (config, _dir) = corrupted_db("victim-doc");
    let engine = Engine::open(config).unwrap();

    let report = engine.verify().unwrap();
    assert!(!report.is_clean());
    assert!(report.problems.iter().any(|p| p.contains("victim-doc")));
}

#[test]
fn verify_clean_on_healthy_database() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(EngineConfig::for_testing(dir.path())).unwrap();
    engine.create("a", &["type:doc"], b"1".to_vec()).unwrap();
    engine.create("b", &["type:doc"], b"2".to_vec()).unwrap();

    let report = engine.verify().unwrap();
    assert!(report.is_clean());
    assert_eq!(report.entities_checked, 2);
}
