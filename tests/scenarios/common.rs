//! Shared helpers for the scenario suite

use entitydb::{Engine, EngineConfig};
use tempfile::TempDir;

/// An engine over a fresh temp directory, with test-sized thresholds
pub fn test_engine() -> (Engine, TempDir) {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(EngineConfig::for_testing(dir.path())).unwrap();
    (engine, dir)
}

/// Same, but with a small chunk threshold so chunking tests stay fast
pub fn chunky_engine(chunk_size: usize) -> (Engine, EngineConfig, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        chunk_size,
        ..EngineConfig::for_testing(dir.path())
    };
    let engine = Engine::open(config.clone()).unwrap();
    (engine, config, dir)
}

/// Deterministic pseudo-random bytes
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

/// Flip one byte at the first occurrence of `needle` in the file
///
/// Panics if the pattern is absent. Used to inject block corruption at a
/// known location.
pub fn corrupt_first_occurrence(path: &std::path::Path, needle: &[u8]) {
    let mut bytes = std::fs::read(path).unwrap();
    let pos = bytes
        .windows(needle.len())
        .position(|w| w == needle)
        .expect("corruption target not found in file");
    bytes[pos] ^= 0xFF;
    std::fs::write(path, &bytes).unwrap();
}
