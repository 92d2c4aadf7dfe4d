//! Benchmarks for Strata state history components.
//!
//! Run with: cargo bench --package strata
//!
//! ## Benchmark Categories
//!
//! - **Build**: state-change ingestion throughput
//! - **Point Queries**: single-attribute and full-state lookups
//! - **Range Queries**: interval iteration over a time window

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use strata::{HistoryTreeConfig, StateSystem, StateValue};
use tempfile::TempDir;

const ATTRIBUTES: usize = 16;

/// Builds a finished on-disk history: `changes` state changes spread over
/// `ATTRIBUTES` attributes, one change per time unit.
fn build_history(dir: &TempDir, changes: i64) -> StateSystem {
    let ss = StateSystem::to_file(
        &dir.path().join("bench.strata"),
        HistoryTreeConfig::default(),
        0,
    )
    .unwrap();
    let quarks: Vec<_> = (0..ATTRIBUTES)
        .map(|i| ss.get_quark_and_create(&format!("CPUs/{}/Current_thread", i)))
        .collect();
    for t in 1..=changes {
        let q = quarks[(t as usize) % ATTRIBUTES];
        ss.modify_attribute(t, q, StateValue::Int((t % 512) as i32))
            .unwrap();
    }
    ss.close_history(changes + 1).unwrap();
    ss
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");

    for size in [1_000, 10_000, 100_000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter_batched(
                TempDir::new,
                |dir| {
                    let ss = build_history(&dir.unwrap(), size as i64);
                    black_box(ss)
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_query_single(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let ss = build_history(&dir, 100_000);
    let quark = ss.get_quark("CPUs/7/Current_thread").unwrap();

    c.bench_function("query_single_100k", |b| {
        let mut t = 1i64;
        b.iter(|| {
            // Stride through the history so the node cache is exercised.
            t = (t * 7919) % 100_000;
            black_box(ss.query_single_state(black_box(t), quark).unwrap())
        })
    });
}

fn bench_query_full(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let ss = build_history(&dir, 100_000);

    c.bench_function("query_full_100k", |b| {
        let mut t = 1i64;
        b.iter(|| {
            t = (t * 6151) % 100_000;
            black_box(ss.query_full_state(black_box(t)).unwrap())
        })
    });
}

fn bench_query_range(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let ss = build_history(&dir, 100_000);
    let quark = ss.get_quark("CPUs/3/Current_thread").unwrap();

    let mut group = c.benchmark_group("query_range");

    // Full history for one attribute.
    group.bench_function("full_window", |b| {
        b.iter(|| {
            let intervals: Vec<_> = ss
                .query_history_range(quark, 0, 100_000)
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap();
            black_box(intervals)
        })
    });

    // A 1% slice from the middle.
    group.bench_function("narrow_window", |b| {
        b.iter(|| {
            let intervals: Vec<_> = ss
                .query_history_range(quark, 49_500, 50_500)
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap();
            black_box(intervals)
        })
    });

    group.finish();
}

fn bench_in_memory_build(c: &mut Criterion) {
    c.bench_function("in_memory_build_10k", |b| {
        b.iter(|| {
            let ss = StateSystem::in_memory(0);
            let quark = ss.get_quark_and_create("A");
            for t in 1..=10_000i64 {
                ss.modify_attribute(t, quark, StateValue::Int((t % 512) as i32))
                    .unwrap();
            }
            ss.close_history(10_001).unwrap();
            black_box(ss)
        })
    });
}

criterion_group!(
    benches,
    // Build
    bench_build,
    bench_in_memory_build,
    // Point queries
    bench_query_single,
    bench_query_full,
    // Range queries
    bench_query_range,
);
criterion_main!(benches);
