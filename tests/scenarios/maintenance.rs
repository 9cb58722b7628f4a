//! Checkpoints, compaction, stats, ingestion, runtime observability

use crate::common::test_engine;
use entitydb::{Engine, EngineConfig, Error, TraceSubsystem};
use std::collections::BTreeSet;
use tempfile::TempDir;

#[test]
fn explicit_checkpoint_resets_wal_pressure() {
    let (engine, _dir) = test_engine();
    for i in 0..10 {
        engine
            .create(&format!("e{}", i), &["type:doc"], vec![0u8; 256])
            .unwrap();
    }
    assert!(engine.stats().wal_bytes > 0);

    let outcome = engine.checkpoint().unwrap();
    assert_eq!(outcome.index_entries, 10);
    assert_eq!(engine.stats().wal_bytes, 0);
    assert_eq!(engine.stats().checkpoints, 1);
}

#[test]
fn wal_threshold_triggers_auto_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        wal_checkpoint_threshold: 16 * 1024,
        ..EngineConfig::for_testing(dir.path())
    };
    let engine = Engine::open(config).unwrap();

    for i in 0..40 {
        engine
            .create(&format!("bulk{}", i), &["type:bulk"], vec![7u8; 1024])
            .unwrap();
    }
    assert!(engine.stats().checkpoints >= 1);
    assert!(engine.stats().wal_bytes < 16 * 1024);
}

#[test]
fn compaction_keeps_only_live_entities() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing(dir.path());
    let engine = Engine::open(config.clone()).unwrap();

    for i in 0..20 {
        engine
            .create(&format!("c{:02}", i), &["type:doc"], vec![1u8; 512])
            .unwrap();
    }
    // Superseded versions and tombstones to reclaim.
    for i in 0..20 {
        engine
            .update(&format!("c{:02}", i), &["type:doc", "status:v2"], vec![2u8; 512])
            .unwrap();
    }
    for i in 0..5 {
        engine.delete(&format!("c{:02}", i)).unwrap();
    }

    let before = std::fs::metadata(config.database_path()).unwrap().len();
    let outcome = engine.compact().unwrap();
    let after = std::fs::metadata(config.database_path()).unwrap().len();

    assert_eq!(outcome.live_entities, 15);
    assert!(after < before);
    assert!(outcome.reclaimed_bytes > 0);

    // Deleted ids are gone outright; the rest read back intact.
    assert!(matches!(engine.get("c00"), Err(Error::NotFound { .. })));
    for i in 5..20 {
        let entity = engine.get(&format!("c{:02}", i)).unwrap();
        assert_eq!(entity.content, vec![2u8; 512]);
        assert!(entity.has_body("status:v2"));
    }
    assert_eq!(engine.list_by_tag("type:doc").len(), 15);

    // And the compacted file survives a reopen.
    engine.close().unwrap();
    let reopened = Engine::open(config).unwrap();
    assert_eq!(reopened.stats().entities_live, 15);
    assert_eq!(reopened.get("c10").unwrap().content, vec![2u8; 512]);
}

#[test]
fn stats_count_operations() {
    let (engine, _dir) = test_engine();

    engine.create("s1", &["type:doc"], Vec::new()).unwrap();
    engine.create("s2", &["type:doc"], Vec::new()).unwrap();
    engine.update("s1", &["type:doc", "a:b"], Vec::new()).unwrap();
    engine.delete("s2").unwrap();
    engine.get("s1").unwrap();

    let stats = engine.stats();
    assert_eq!(stats.creates, 2);
    assert_eq!(stats.updates, 1);
    assert_eq!(stats.deletes, 1);
    assert!(stats.reads >= 1);
    assert_eq!(stats.entities_total, 2);
    assert_eq!(stats.entities_live, 1);
    assert!(stats.tag_bodies >= 2);
}

#[test]
fn cache_serves_repeat_reads() {
    let (engine, _dir) = test_engine();
    engine.create("hot", &["type:doc"], b"data".to_vec()).unwrap();

    engine.get("hot").unwrap();
    let misses = engine.stats().cache_misses;
    engine.get("hot").unwrap();
    engine.get("hot").unwrap();

    let stats = engine.stats();
    assert!(stats.cache_hits >= 2);
    assert_eq!(stats.cache_misses, misses);
}

#[test]
fn ingest_wal_record_applies_mutation() {
    let (engine, _dir) = test_engine();
    engine.create("target", &["type:doc"], Vec::new()).unwrap();

    // A DeleteEntity record: {lsn, op=2, payload = ts:u64 + id bytes}.
    let mut payload = 5000u64.to_le_bytes().to_vec();
    payload.extend_from_slice(b"target");
    let record = entitydb::storage::WalRecord::new(
        1,
        entitydb::storage::WalOp::DeleteEntity,
        payload,
    );

    engine.ingest_wal_record(&record.encode()).unwrap();
    assert!(matches!(engine.get("target"), Err(Error::Tombstoned { .. })));
}

#[test]
fn ingest_rejects_non_mutations() {
    let (engine, _dir) = test_engine();
    let record =
        entitydb::storage::WalRecord::new(1, entitydb::storage::WalOp::Checkpoint, Vec::new());
    assert!(matches!(
        engine.ingest_wal_record(&record.encode()),
        Err(Error::InvalidFilter { .. })
    ));
    assert!(engine.ingest_wal_record(&[1, 2, 3]).is_err());
}

#[test]
fn runtime_observability_knobs() {
    let (engine, _dir) = test_engine();

    engine.change_log_level("debug").unwrap();
    assert!(engine.change_log_level("extremely-loud").is_err());

    let mut subsystems = BTreeSet::new();
    subsystems.insert(TraceSubsystem::Wal);
    subsystems.insert(TraceSubsystem::Query);
    engine.set_trace_subsystems(subsystems).unwrap();
}

#[test]
fn close_performs_final_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing(dir.path());

    let engine = Engine::open(config.clone()).unwrap();
    engine.create("last", &["type:doc"], Vec::new()).unwrap();
    engine.close().unwrap();

    // After a clean close the WAL region holds only the checkpoint
    // marker, so reopen takes the snapshot fast path with zero replay.
    let reopened = Engine::open(config).unwrap();
    assert_eq!(reopened.stats().recovered_records, 0);
    reopened.get("last").unwrap();
}
