//! Persistent map benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pmse_bench::{fill_map, memory_collection, random_data};
use pmse_core::RecordId;
use rand::Rng;

const POOL: u64 = 64 * 1024 * 1024;

/// Benchmark single record inserts with generated ids.
fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_insert");

    for size in [64, 256, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let handle = memory_collection(POOL, 1024);
            let data = random_data(size);

            b.iter(|| {
                let id = handle.map().insert_auto(black_box(&data)).unwrap();
                handle.map().remove(id).unwrap();
            });
        });
    }
    group.finish();
}

/// Benchmark point reads from a populated map.
fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_get");

    for count in [100, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let handle = memory_collection(POOL, 1024);
            let ids = fill_map(&handle, count, 128);
            let mut rng = rand::thread_rng();

            b.iter(|| {
                let id = ids[rng.gen_range(0..ids.len())];
                black_box(handle.map().get(id).unwrap());
            });
        });
    }
    group.finish();
}

/// Benchmark in-place updates.
fn bench_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_update");

    let handle = memory_collection(POOL, 1024);
    let ids = fill_map(&handle, 1_000, 256);
    let data = random_data(256);
    let mut next = 0usize;

    group.bench_function("256_bytes", |b| {
        b.iter(|| {
            let id: RecordId = ids[next % ids.len()];
            next += 1;
            handle.map().update(id, black_box(&data)).unwrap();
        });
    });
    group.finish();
}

/// Benchmark full iteration.
fn bench_iterate(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_iterate");

    for count in [1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let handle = memory_collection(POOL, 1024);
            fill_map(&handle, count, 64);

            b.iter(|| {
                let n = handle.map().iter().filter(|r| r.is_ok()).count();
                black_box(n);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_insert, bench_get, bench_update, bench_iterate);
criterion_main!(benches);
