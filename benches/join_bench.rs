//! JOIN benchmark: HashMap baseline vs PartitionedHashJoinExec
//!
//! Simulates a database equi-join workload:
//!   SELECT * FROM probe_side JOIN build_side ON probe_side.key = build_side.key
//!
//! Measures end-to-end join throughput (probe rows/sec) across concurrency,
//! partition count, selectivity and multiplicity.
//!
//! Workload parameters:
//!   - Build size: number of rows on the build side
//!   - Probe size: number of rows on the probe side
//!   - Selectivity: fraction of probe keys that have a match (0.0 = no matches, 1.0 = all match)
//!   - Multiplicity: number of build-side duplicates per key (1 = unique, N = 1:N join)

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::hint::black_box;
use std::time::Duration;

use parjoin::{
    Chunk, Datum, FieldType, JoinConfig, JoinType, MemorySource, PartitionedHashJoinExec, Row,
    RowSource,
};

// How long to record measurements for.
const MEASURE_DURATION_SECS: u64 = 20;

struct JoinWorkload {
    /// (key, payload) rows for the build side
    build_rows: Vec<Row>,
    /// (key, payload) rows for the probe side, a mix of matching and non-matching keys
    probe_rows: Vec<Row>,
}

impl JoinWorkload {
    /// Generate a join workload.
    ///
    /// - `build_keys`: number of distinct keys on the build side
    /// - `multiplicity`: duplicates per key (total build rows = build_keys * multiplicity)
    /// - `probe_count`: number of probe rows
    /// - `selectivity`: fraction of probe keys that exist in the build side
    fn generate(
        build_keys: usize,
        multiplicity: usize,
        probe_count: usize,
        selectivity: f64,
        seed: u64,
    ) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let mut build_rows = Vec::with_capacity(build_keys * multiplicity);
        for key in 0..build_keys as i64 {
            for dup in 0..multiplicity as i64 {
                build_rows.push(vec![Datum::Int(key), Datum::Int(key * 1000 + dup)]);
            }
        }
        // Shuffle to simulate unordered input
        build_rows.shuffle(&mut rng);

        let matching_probes = (probe_count as f64 * selectivity) as usize;
        let mut probe_rows = Vec::with_capacity(probe_count);
        for i in 0..probe_count {
            let key = rng.random_range(0..build_keys as i64);
            // Misses land beyond the build key range
            let key = if i < matching_probes { key } else { key + build_keys as i64 };
            probe_rows.push(vec![Datum::Int(key), Datum::Int(i as i64)]);
        }
        probe_rows.shuffle(&mut rng);

        Self {
            build_rows,
            probe_rows,
        }
    }
}

fn int_pair() -> Vec<FieldType> {
    vec![FieldType::int(), FieldType::int()]
}

/// Single-threaded baseline. Returns the number of joined rows.
fn hash_map_join(workload: &JoinWorkload) -> usize {
    let mut map: HashMap<i64, Vec<&Row>> = HashMap::with_capacity(workload.build_rows.len());
    for row in &workload.build_rows {
        if let Datum::Int(k) = row[0] {
            map.entry(k).or_default().push(row);
        }
    }
    let mut joined = 0;
    for row in &workload.probe_rows {
        if let Datum::Int(k) = row[0] {
            if let Some(matches) = map.get(&k) {
                for build in matches {
                    black_box((row, build));
                    joined += 1;
                }
            }
        }
    }
    joined
}

fn partitioned_join(workload: &JoinWorkload, concurrency: usize, partitions: usize) -> usize {
    let cfg = JoinConfig::new(JoinType::Inner, vec![0], vec![0])
        .with_concurrency(concurrency)
        .with_partitions(partitions);
    let probe = Box::new(MemorySource::new(int_pair(), workload.probe_rows.clone()));
    let build = Box::new(MemorySource::new(int_pair(), workload.build_rows.clone()));
    let mut exec = PartitionedHashJoinExec::new(cfg, probe, build).unwrap();
    exec.open().unwrap();
    let mut chk = Chunk::new(1024);
    let mut joined = 0;
    loop {
        exec.next(&mut chk).unwrap();
        if chk.is_empty() {
            break;
        }
        joined += chk.num_rows();
    }
    exec.close().unwrap();
    joined
}

fn bench_concurrency(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrency");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let probe_count = 200_000;
    let workload = JoinWorkload::generate(50_000, 1, probe_count, 0.5, 42);
    group.throughput(Throughput::Elements(probe_count as u64));

    group.bench_function("HashMap", |b| b.iter(|| hash_map_join(black_box(&workload))));

    for &concurrency in &[1, 2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("Partitioned", concurrency),
            &concurrency,
            |b, &concurrency| b.iter(|| partitioned_join(black_box(&workload), concurrency, 16)),
        );
    }

    group.finish();
}

fn bench_partitions(c: &mut Criterion) {
    let mut group = c.benchmark_group("partitions");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let probe_count = 200_000;
    let workload = JoinWorkload::generate(50_000, 1, probe_count, 0.5, 42);
    group.throughput(Throughput::Elements(probe_count as u64));

    // concurrency == partitions takes the one-task-per-partition build path
    for &partitions in &[1, 4, 16, 64] {
        group.bench_with_input(
            BenchmarkId::new("Partitioned", partitions),
            &partitions,
            |b, &partitions| b.iter(|| partitioned_join(black_box(&workload), 4, partitions)),
        );
    }

    group.finish();
}

fn bench_selectivity(c: &mut Criterion) {
    let mut group = c.benchmark_group("selectivity");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let probe_count = 200_000;

    // Varying selectivity: 0% (all misses), 10%, 50%, 100% (all hits)
    for &selectivity in &[0.0, 0.1, 0.5, 1.0] {
        let workload = JoinWorkload::generate(50_000, 1, probe_count, selectivity, 42);
        let sel_label = format!("{:.0}pct", selectivity * 100.0);
        group.throughput(Throughput::Elements(probe_count as u64));

        group.bench_with_input(BenchmarkId::new("HashMap", &sel_label), &workload, |b, w| {
            b.iter(|| hash_map_join(black_box(w)))
        });

        group.bench_with_input(BenchmarkId::new("Partitioned", &sel_label), &workload, |b, w| {
            b.iter(|| partitioned_join(black_box(w), 4, 16))
        });
    }

    group.finish();
}

fn bench_multiplicity(c: &mut Criterion) {
    let mut group = c.benchmark_group("multiplicity");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let probe_count = 100_000;

    // Varying multiplicity: 1 (unique), 2, 5, 10
    for &multiplicity in &[1, 2, 5, 10] {
        let workload = JoinWorkload::generate(20_000, multiplicity, probe_count, 1.0, 42);
        group.throughput(Throughput::Elements(probe_count as u64));

        group.bench_with_input(BenchmarkId::new("HashMap", multiplicity), &workload, |b, w| {
            b.iter(|| hash_map_join(black_box(w)))
        });

        group.bench_with_input(BenchmarkId::new("Partitioned", multiplicity), &workload, |b, w| {
            b.iter(|| partitioned_join(black_box(w), 4, 16))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_concurrency,
    bench_partitions,
    bench_selectivity,
    bench_multiplicity,
);
criterion_main!(benches);
