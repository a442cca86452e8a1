//! Engine benchmarks on real pool files.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pmse_bench::random_data;
use pmse_core::{CollectionOptions, Config, Engine, IndexDescriptor, WriteUnit, MIN_POOL_SIZE};
use tempfile::TempDir;

const NS: &str = "bench.records";

fn config() -> Config {
    Config::new()
        .identlist_pool_size(MIN_POOL_SIZE)
        .collection_pool_size(64 * 1024 * 1024)
        .map_buckets(1024)
}

fn prepared_engine(dir: &TempDir) -> Engine {
    let engine = Engine::open_with_config(dir.path(), config()).unwrap();
    engine
        .create_collection(NS, "records", &CollectionOptions::default())
        .unwrap();
    engine.create_index("records-by-key", &IndexDescriptor::new(NS)).unwrap();
    engine
}

/// Benchmark a record write plus its index entry as one write unit.
fn bench_write_unit(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_unit");
    group.sample_size(20);

    for size in [64, 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let engine = prepared_engine(&dir);
            let store = engine
                .get_collection(NS, "records", &CollectionOptions::default())
                .unwrap();
            let index = engine
                .get_index("records-by-key", &IndexDescriptor::new(NS))
                .unwrap();
            let data = random_data(size);

            b.iter(|| {
                let mut unit = WriteUnit::new();
                let id = unit.insert(store.map(), black_box(&data)).unwrap();
                unit.index_insert(index.tree(), &data[..8], id).unwrap();
                unit.commit().unwrap();
            });
            engine.close().unwrap();
        });
    }
    group.finish();
}

/// Benchmark opening a data directory after a clean and an unclean shutdown.
fn bench_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_open");
    group.sample_size(10);

    for clean in [true, false] {
        let name = if clean { "clean" } else { "after_crash" };
        group.bench_function(name, |b| {
            let dir = TempDir::new().unwrap();
            let engine = prepared_engine(&dir);
            let store = engine
                .get_collection(NS, "records", &CollectionOptions::default())
                .unwrap();
            for _ in 0..1_000 {
                store.insert_record(&random_data(128)).unwrap();
            }
            drop(store);
            engine.close().unwrap();
            drop(engine);

            b.iter(|| {
                let engine = Engine::open_with_config(dir.path(), config()).unwrap();
                if clean {
                    engine.close().unwrap();
                }
                black_box(engine);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_write_unit, bench_open);
criterion_main!(benches);
