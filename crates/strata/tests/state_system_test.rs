//! Integration tests for the state system façade.

use proptest::prelude::*;
use strata::{
    HistoryTreeBackend, HistoryTreeConfig, StateError, StateSystem, StateValue,
};
use tempfile::TempDir;

#[test]
fn cpu_scenario_on_disk() {
    let temp_dir = TempDir::new().unwrap();
    let file_path = temp_dir.path().join("cpu.strata");

    let ss = StateSystem::to_file(&file_path, HistoryTreeConfig::default(), 0).unwrap();
    let cpu = ss.get_quark_and_create("A/CPU0");
    ss.modify_attribute(10, cpu, StateValue::Int(0)).unwrap();
    ss.modify_attribute(20, cpu, StateValue::Int(1)).unwrap();
    ss.close_history(30).unwrap();

    let at_15 = ss.query_single_state(15, cpu).unwrap();
    assert_eq!((at_15.start, at_15.end), (10, 19));
    assert_eq!(at_15.value, StateValue::Int(0));

    let at_25 = ss.query_single_state(25, cpu).unwrap();
    assert_eq!((at_25.start, at_25.end), (20, 29));
    assert_eq!(at_25.value, StateValue::Int(1));
}

#[test]
fn monotonicity_violations_rejected_without_corruption() {
    let ss = StateSystem::in_memory(0);
    let a = ss.get_quark_and_create("A");
    ss.modify_attribute(50, a, StateValue::Int(1)).unwrap();

    // A change before the open value's start is refused.
    assert!(matches!(
        ss.modify_attribute(40, a, StateValue::Int(2)),
        Err(StateError::TimeRange { .. })
    ));
    // Prior data is untouched and the system keeps working.
    ss.modify_attribute(60, a, StateValue::Int(3)).unwrap();
    ss.close_history(70).unwrap();
    assert_eq!(ss.query_single_state(55, a).unwrap().value, StateValue::Int(1));
}

#[test]
fn boundary_timestamps() {
    let ss = StateSystem::in_memory(100);
    let a = ss.get_quark_and_create("A");
    ss.modify_attribute(150, a, StateValue::Int(1)).unwrap();
    ss.close_history(200).unwrap();

    // Both range endpoints are queryable.
    let at_start = ss.query_single_state(100, a).unwrap();
    assert_eq!(at_start.start, 100);
    assert_eq!(at_start.value, StateValue::Null);
    let at_end = ss.query_single_state(199, a).unwrap();
    assert_eq!(at_end.end, 199);
    assert_eq!(at_end.value, StateValue::Int(1));

    // One step outside either endpoint is not.
    assert!(matches!(
        ss.query_single_state(99, a),
        Err(StateError::TimeRange { .. })
    ));
    assert!(matches!(
        ss.query_single_state(200, a),
        Err(StateError::TimeRange { .. })
    ));
}

#[test]
fn full_history_written_then_reopened() {
    let temp_dir = TempDir::new().unwrap();
    let file_path = temp_dir.path().join("reopen.strata");

    let config = HistoryTreeConfig {
        block_size: 512,
        max_children: 4,
        cache_size: 32,
    };
    let mut expected = Vec::new();
    {
        let ss = StateSystem::to_file(&file_path, config, 0).unwrap();
        let quarks: Vec<_> = (0..4)
            .map(|i| ss.get_quark_and_create(&format!("Threads/{}/Status", i)))
            .collect();
        for t in 1..500i64 {
            let q = quarks[(t % 4) as usize];
            ss.modify_attribute(t, q, StateValue::Int((t % 7) as i32)).unwrap();
        }
        ss.close_history(500).unwrap();
        for t in (0..500).step_by(41) {
            expected.push(ss.query_single_state(t, quarks[1]).unwrap());
        }
    }

    // Reopen the file; attribute paths are not persisted, so the consumer
    // re-registers them in the same order to get the same quarks back.
    let backend = HistoryTreeBackend::open(&file_path, 32).unwrap();
    let ss = StateSystem::from_existing_backend(Box::new(backend));
    let quarks: Vec<_> = (0..4)
        .map(|i| ss.get_quark_and_create(&format!("Threads/{}/Status", i)))
        .collect();
    let reread: Vec<_> = (0..500)
        .step_by(41)
        .map(|t| ss.query_single_state(t, quarks[1]).unwrap())
        .collect();
    assert_eq!(expected, reread);
}

#[test]
fn string_and_bytes_values_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let file_path = temp_dir.path().join("values.strata");

    let ss = StateSystem::to_file(&file_path, HistoryTreeConfig::default(), 0).unwrap();
    let name = ss.get_quark_and_create("Proc/Exec_name");
    let blob = ss.get_quark_and_create("Proc/Cmdline");
    ss.modify_attribute(10, name, StateValue::Str("bash".into())).unwrap();
    ss.modify_attribute(10, blob, StateValue::Bytes(b"/bin/bash\0-l".to_vec())).unwrap();
    ss.modify_attribute(30, name, StateValue::Str("vim".into())).unwrap();
    ss.close_history(50).unwrap();

    assert_eq!(
        ss.query_single_state(20, name).unwrap().value,
        StateValue::Str("bash".into())
    );
    assert_eq!(
        ss.query_single_state(40, name).unwrap().value,
        StateValue::Str("vim".into())
    );
    assert_eq!(
        ss.query_single_state(40, blob).unwrap().value,
        StateValue::Bytes(b"/bin/bash\0-l".to_vec())
    );
}

#[test]
fn type_constraint_spans_whole_history() {
    let ss = StateSystem::in_memory(0);
    let a = ss.get_quark_and_create("A");
    ss.modify_attribute(10, a, StateValue::Long(1)).unwrap();
    assert!(matches!(
        ss.modify_attribute(20, a, StateValue::Double(1.5)),
        Err(StateError::ValueType { quark, .. }) if quark == a
    ));
}

proptest! {
    /// Any sequence of forward state changes on one attribute yields a
    /// history where every query is answered by the most recent change at
    /// or before the query time, with an interval actually covering it.
    #[test]
    fn queries_match_last_change(
        deltas in prop::collection::vec((1i64..50, 0u8..5), 1..40),
        query_offsets in prop::collection::vec(0i64..2000, 10),
    ) {
        let ss = StateSystem::in_memory(0);
        let a = ss.get_quark_and_create("A");

        // Reference model: (time, value) change log.
        let mut t = 0i64;
        let mut changes: Vec<(i64, StateValue)> = vec![(0, StateValue::Null)];
        for (delta, v) in deltas {
            t += delta;
            let value = match v {
                0 => StateValue::Null,
                _ => StateValue::Int(v as i32),
            };
            ss.modify_attribute(t, a, value.clone()).unwrap();
            changes.push((t, value));
        }
        let end = t + 10;
        ss.close_history(end).unwrap();

        for offset in query_offsets {
            let at = offset % (end - 1).max(1);
            let interval = ss.query_single_state(at, a).unwrap();
            prop_assert!(interval.start <= at && at <= interval.end);

            let expected = changes
                .iter()
                .rev()
                .find(|(time, _)| *time <= at)
                .map(|(_, v)| v.clone())
                .unwrap();
            prop_assert_eq!(interval.value, expected);
        }
    }
}
