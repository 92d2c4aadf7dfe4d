//! Build-while-query tests: one producer thread, several consumers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata::{HistoryTreeConfig, StateSystem, StateValue};
use tempfile::TempDir;

#[test]
fn queries_during_build_see_consistent_intervals() {
    let temp_dir = TempDir::new().unwrap();
    let file_path = temp_dir.path().join("concurrent.strata");

    let config = HistoryTreeConfig {
        block_size: 512,
        max_children: 4,
        cache_size: 32,
    };
    let ss = Arc::new(StateSystem::to_file(&file_path, config, 0).unwrap());
    let quark = ss.get_quark_and_create("CPUs/0/Current_thread");
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let ss = Arc::clone(&ss);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut observed = 0usize;
                while !stop.load(Ordering::Acquire) {
                    let now = ss.current_end_time();
                    // A query at "now" during the build must return either
                    // a closed interval or the open one, never garbage.
                    let interval = ss.query_single_state(now, quark).unwrap();
                    assert!(interval.start <= now && now <= interval.end);
                    if let StateValue::Int(v) = interval.value {
                        assert!(v >= 0);
                    }
                    observed += 1;
                }
                observed
            })
        })
        .collect();

    for t in 1..5000i64 {
        ss.modify_attribute(t, quark, StateValue::Int((t % 100) as i32))
            .unwrap();
    }
    ss.close_history(5000).unwrap();
    stop.store(true, Ordering::Release);

    for reader in readers {
        let observed = reader.join().unwrap();
        assert!(observed > 0);
    }

    // The finished history is still coherent end to end.
    for t in (0..4999).step_by(331) {
        let interval = ss.query_single_state(t, quark).unwrap();
        assert!(interval.start <= t && t <= interval.end);
    }
}

#[test]
fn blocking_queries_wait_for_the_builder() {
    use strata::{InMemoryBackend, QueryMode};

    let ss = Arc::new(StateSystem::with_backend(
        Box::new(InMemoryBackend::new(0)),
        QueryMode::Block,
    ));
    let quark = ss.get_quark_and_create("A");
    ss.modify_attribute(10, quark, StateValue::Int(1)).unwrap();

    let reader = {
        let ss = Arc::clone(&ss);
        std::thread::spawn(move || ss.query_single_state(100, quark).unwrap())
    };

    // Give the reader time to block on a timestamp the history has not
    // reached, then drive the build past it.
    std::thread::sleep(Duration::from_millis(50));
    ss.modify_attribute(120, quark, StateValue::Int(2)).unwrap();

    let interval = reader.join().unwrap();
    assert!(interval.start <= 100 && 100 <= interval.end);
    assert_eq!(interval.value, StateValue::Int(1));

    ss.close_history(200).unwrap();
}

#[test]
fn wait_until_built_releases_on_close() {
    let ss = Arc::new(StateSystem::in_memory(0));
    let quark = ss.get_quark_and_create("A");

    let waiter = {
        let ss = Arc::clone(&ss);
        std::thread::spawn(move || {
            ss.wait_until_built();
            // After the latch opens the history must be complete.
            ss.query_single_state(50, quark).unwrap()
        })
    };

    assert!(!ss.wait_until_built_timeout(Duration::from_millis(50)));

    ss.modify_attribute(10, quark, StateValue::Int(42)).unwrap();
    ss.close_history(100).unwrap();

    let interval = waiter.join().unwrap();
    assert_eq!(interval.value, StateValue::Int(42));
    assert!(ss.wait_until_built_timeout(Duration::from_millis(50)));
}
