//! Scenario 3: chunked content — split, reassembly, checksum failure

use crate::common::{chunky_engine, corrupt_first_occurrence, random_bytes};
use entitydb::{Engine, Error, GetOptions};

const CHUNK: usize = 64 * 1024;
// 2.5 chunks, so the split always has a short tail chunk.
const CONTENT: usize = 160 * 1024;

#[test]
fn scenario_chunked_content() {
    let (engine, _config, _dir) = chunky_engine(CHUNK);
    let content = random_bytes(CONTENT, 7);

    engine.create("big", &["type:blob"], content.clone()).unwrap();

    let big = engine.get("big").unwrap();
    assert!(big.has_body("content:chunks:3"));
    assert!(big.has_body(&format!("content:size:{}", CONTENT)));
    assert!(big
        .tags
        .iter()
        .any(|t| t.body.as_str().starts_with("content:checksum:sha256:")));
    assert_eq!(big.content, content);

    // Chunk children exist and are tagged as such.
    assert_eq!(engine.list_by_tag("type:chunk").len(), 3);
    assert_eq!(engine.list_by_tag("parent:big").len(), 3);

    // Streaming yields the exact bytes.
    let mut streamed = Vec::new();
    for piece in engine.stream("big").unwrap() {
        streamed.extend_from_slice(&piece.unwrap());
    }
    assert_eq!(streamed, content);
}

#[test]
fn raw_get_skips_reassembly() {
    let (engine, _config, _dir) = chunky_engine(CHUNK);
    engine
        .create("big", &["type:blob"], random_bytes(CONTENT, 8))
        .unwrap();

    let raw = engine
        .get_with(
            "big",
            GetOptions {
                raw: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(raw.content.is_empty());
    assert!(raw.has_body("content:chunks:3"));
}

#[test]
fn chunk_threshold_boundary() {
    let (engine, _config, _dir) = chunky_engine(CHUNK);

    // Exactly chunk_size stays inline.
    engine
        .create("inline", &["type:blob"], random_bytes(CHUNK, 9))
        .unwrap();
    let inline = engine.get("inline").unwrap();
    assert!(inline.value_after("content:chunks:").is_none());
    assert_eq!(inline.content.len(), CHUNK);

    // One byte past it is chunked.
    engine
        .create("split", &["type:blob"], random_bytes(CHUNK + 1, 10))
        .unwrap();
    let split = engine.get("split").unwrap();
    assert!(split.has_body("content:chunks:2"));
    assert_eq!(split.content.len(), CHUNK + 1);
}

#[test]
fn scenario_corrupted_chunk_fails_checksum() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = entitydb::EngineConfig {
        chunk_size: CHUNK,
        ..entitydb::EngineConfig::for_testing(dir.path())
    };
    let content = random_bytes(CONTENT, 11);

    let engine = Engine::open(config.clone()).unwrap();
    engine.create("big", &["type:blob"], content.clone()).unwrap();
    engine.close().unwrap();

    // Flip one byte inside chunk 1's payload, on disk.
    let needle = &content[CHUNK + 100..CHUNK + 132];
    corrupt_first_occurrence(&config.database_path(), needle);

    let reopened = Engine::open(config).unwrap();
    let result: Result<Vec<u8>, Error> = reopened
        .stream("big")
        .unwrap()
        .collect::<Result<Vec<Vec<u8>>, _>>()
        .map(|pieces| pieces.concat());
    assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));

    // get() with reassembly refuses as well; no partial data.
    assert!(matches!(
        reopened.get("big"),
        Err(Error::ChecksumMismatch { .. })
    ));
}

#[test]
fn delete_cascades_to_chunks() {
    let (engine, _config, _dir) = chunky_engine(CHUNK);
    engine
        .create("big", &["type:blob"], random_bytes(CONTENT, 12))
        .unwrap();
    assert_eq!(engine.list_by_tag("type:chunk").len(), 3);

    engine.delete("big").unwrap();
    assert!(engine.list_by_tag("type:chunk").is_empty());
    assert!(matches!(
        engine.get("big-chunk-0"),
        Err(Error::Tombstoned { .. })
    ));
}

#[test]
fn update_to_small_content_drops_stale_chunks() {
    let (engine, _config, _dir) = chunky_engine(CHUNK);
    engine
        .create("shrink", &["type:blob"], random_bytes(CONTENT, 13))
        .unwrap();
    assert_eq!(engine.list_by_tag("type:chunk").len(), 3);

    engine
        .update("shrink", &["type:blob"], b"now tiny".to_vec())
        .unwrap();

    let small = engine.get("shrink").unwrap();
    assert_eq!(small.content, b"now tiny");
    assert!(small.value_after("content:chunks:").is_none());
    assert!(engine.list_by_tag("type:chunk").is_empty());
}

#[test]
fn missing_chunk_reported() {
    let (engine, _config, _dir) = chunky_engine(CHUNK);
    engine
        .create("big", &["type:blob"], random_bytes(CONTENT, 14))
        .unwrap();

    // Tombstone one child out from under the parent.
    engine.delete("big-chunk-1").unwrap();

    let outcome: Result<Vec<Vec<u8>>, Error> =
        engine.stream("big").unwrap().collect();
    assert!(matches!(
        outcome,
        Err(Error::ChunkMissing { index: 1, .. })
    ));
}
