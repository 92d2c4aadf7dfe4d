//! Integration tests for the history tree backend.

use strata::{
    HistoryTreeBackend, HistoryTreeConfig, InMemoryBackend, StateBackend, StateError,
    StateInterval, StateValue,
};
use tempfile::TempDir;

/// Small pages so modest interval counts already split nodes and grow the
/// tree.
fn small_config(cache_size: usize) -> HistoryTreeConfig {
    HistoryTreeConfig {
        block_size: 512,
        max_children: 4,
        cache_size,
    }
}

/// Helper generating a deterministic interval workload: `quarks` attributes
/// flipping between values every `step` time units.
fn generate_intervals(quarks: usize, per_quark: usize, step: i64) -> Vec<StateInterval> {
    let mut intervals = Vec::with_capacity(quarks * per_quark);
    for i in 0..per_quark {
        let start = i as i64 * step;
        for q in 0..quarks {
            let value = match (i + q) % 4 {
                0 => StateValue::Int((i * 7 + q) as i32),
                1 => StateValue::Long(i as i64 * 1_000_003),
                2 => StateValue::Str(format!("state-{}-{}", q, i)),
                _ => StateValue::Null,
            };
            intervals.push(StateInterval::new(start, start + step - 1, q, value));
        }
    }
    // Non-decreasing start order, as a single producer would emit them.
    intervals.sort_by_key(|iv| iv.start);
    intervals
}

#[test]
fn disk_matches_in_memory() {
    let temp_dir = TempDir::new().unwrap();
    let file_path = temp_dir.path().join("parity.strata");

    let intervals = generate_intervals(5, 200, 10);
    let disk = HistoryTreeBackend::new(&file_path, small_config(64), 0).unwrap();
    let memory = InMemoryBackend::new(0);
    for iv in &intervals {
        disk.insert_past_state(iv.clone()).unwrap();
        memory.insert_past_state(iv.clone()).unwrap();
    }
    disk.finished_building(2000).unwrap();
    memory.finished_building(2000).unwrap();

    for t in (0..1999).step_by(97) {
        for q in 0..5 {
            assert_eq!(
                disk.query_single(t, q).unwrap(),
                memory.query_single(t, q).unwrap(),
                "divergence at t={}, quark={}",
                t,
                q
            );
        }
        let mut disk_slots = vec![None; 5];
        let mut mem_slots = vec![None; 5];
        disk.query_full(&mut disk_slots, t).unwrap();
        memory.query_full(&mut mem_slots, t).unwrap();
        assert_eq!(disk_slots, mem_slots, "full state divergence at t={}", t);
    }

    assert_eq!(
        disk.query_range(2, 333, 777).unwrap(),
        memory.query_range(2, 333, 777).unwrap()
    );
}

#[test]
fn reopen_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let file_path = temp_dir.path().join("roundtrip.strata");

    let intervals = generate_intervals(3, 300, 10);
    let mut before = Vec::new();
    {
        let backend = HistoryTreeBackend::new(&file_path, small_config(64), 0).unwrap();
        for iv in &intervals {
            backend.insert_past_state(iv.clone()).unwrap();
        }
        backend.finished_building(3000).unwrap();
        backend.check_integrity().unwrap();
        for t in (0..2999).step_by(113) {
            before.push(backend.query_single(t, 1).unwrap());
        }
    }

    let reopened = HistoryTreeBackend::open(&file_path, 64).unwrap();
    assert_eq!(reopened.start_time(), 0);
    assert_eq!(reopened.end_time(), 3000);
    reopened.check_integrity().unwrap();

    let after: Vec<_> = (0..2999)
        .step_by(113)
        .map(|t| reopened.query_single(t, 1).unwrap())
        .collect();
    assert_eq!(before, after);

    // Reopened backends are read-only.
    assert!(matches!(
        reopened.insert_past_state(StateInterval::new(3001, 3010, 0, StateValue::Null)),
        Err(StateError::Closed)
    ));
}

#[test]
fn queries_idempotent_under_cache_eviction() {
    let temp_dir = TempDir::new().unwrap();
    let file_path = temp_dir.path().join("evict.strata");

    let intervals = generate_intervals(4, 400, 10);
    {
        let backend = HistoryTreeBackend::new(&file_path, small_config(64), 0).unwrap();
        for iv in &intervals {
            backend.insert_past_state(iv.clone()).unwrap();
        }
        backend.finished_building(4000).unwrap();
    }

    // Cache of 2 nodes: almost every query faults pages back in.
    let starved = HistoryTreeBackend::open(&file_path, 2).unwrap();
    let roomy = HistoryTreeBackend::open(&file_path, 1024).unwrap();

    for round in 0..3 {
        for t in (0..3999).step_by(211) {
            for q in 0..4 {
                assert_eq!(
                    starved.query_single(t, q).unwrap(),
                    roomy.query_single(t, q).unwrap(),
                    "round {} t={} quark={}",
                    round,
                    t,
                    q
                );
            }
        }
    }
}

#[test]
fn tree_grows_with_volume() {
    let temp_dir = TempDir::new().unwrap();
    let file_path = temp_dir.path().join("grow.strata");

    let backend = HistoryTreeBackend::new(&file_path, small_config(64), 0).unwrap();
    // Each 512-byte leaf holds roughly a dozen int intervals; a few thousand
    // must overflow max_children=4 several times over.
    for i in 0..3000i64 {
        backend
            .insert_past_state(StateInterval::new(
                i * 10,
                i * 10 + 9,
                (i % 2) as usize,
                StateValue::Int(i as i32),
            ))
            .unwrap();
    }
    backend.finished_building(30_000).unwrap();

    assert!(
        backend.node_count() > 50,
        "expected many nodes, got {}",
        backend.node_count()
    );
    backend.check_integrity().unwrap();

    // Spot-check queries all over the range.
    for i in (0..3000i64).step_by(173) {
        let found = backend
            .query_single(i * 10 + 5, (i % 2) as usize)
            .unwrap()
            .unwrap();
        assert_eq!(found.start, i * 10);
        assert_eq!(found.value, StateValue::Int(i as i32));
    }
}

#[test]
fn corrupted_file_rejected_on_open() {
    let temp_dir = TempDir::new().unwrap();
    let file_path = temp_dir.path().join("corrupt.strata");

    {
        let backend = HistoryTreeBackend::new(&file_path, small_config(8), 0).unwrap();
        for i in 0..200i64 {
            backend
                .insert_past_state(StateInterval::new(i * 10, i * 10 + 9, 0, StateValue::Int(1)))
                .unwrap();
        }
        backend.finished_building(2000).unwrap();
    }

    // Flip bytes in the middle of the node section.
    let mut bytes = std::fs::read(&file_path).unwrap();
    let target = 4096 + 512 + 100;
    bytes[target] ^= 0xFF;
    bytes[target + 1] ^= 0xFF;
    std::fs::write(&file_path, &bytes).unwrap();

    let reopened = HistoryTreeBackend::open(&file_path, 8).unwrap();
    // Some query descending through the damaged page must surface the
    // checksum failure rather than bad data.
    let mut saw_checksum_error = false;
    for t in (0..2000).step_by(10) {
        match reopened.query_single(t, 0) {
            Ok(_) => {}
            Err(StateError::ChecksumMismatch { .. }) => {
                saw_checksum_error = true;
                break;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert!(saw_checksum_error);
}

#[test]
fn oversized_values_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let file_path = temp_dir.path().join("oversized.strata");

    // Larger than 64 KiB so a wrapped length prefix would corrupt it.
    let blob: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
    {
        let backend = HistoryTreeBackend::new(&file_path, small_config(8), 0).unwrap();
        backend
            .insert_past_state(StateInterval::new(0, 99, 0, StateValue::Int(1)))
            .unwrap();
        backend
            .insert_past_state(StateInterval::new(100, 199, 0, StateValue::Bytes(blob.clone())))
            .unwrap();
        backend
            .insert_past_state(StateInterval::new(200, 299, 0, StateValue::Int(2)))
            .unwrap();
        backend.finished_building(300).unwrap();
    }

    let reopened = HistoryTreeBackend::open(&file_path, 8).unwrap();
    reopened.check_integrity().unwrap();
    let found = reopened.query_single(150, 0).unwrap().unwrap();
    assert_eq!(found.value, StateValue::Bytes(blob));
    assert_eq!(reopened.query_single(250, 0).unwrap().unwrap().start, 200);
}
