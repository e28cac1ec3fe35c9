//! Storage backend benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tabdb_bench::utils::generate_inserts;
use tabdb_storage::{BackendFactory, BackendParams, FileStore, InMemoryStore, StorageBackend};
use tempfile::TempDir;

fn params() -> BackendParams {
    BackendParams::new("bench", "docs", "id")
}

/// Benchmark in-memory bulk inserts.
fn bench_inmemory_bulk_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("inmemory_bulk_write");

    for batch_size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                let store = InMemoryStore::new();
                let backend = store.open(&params()).unwrap();

                b.iter_batched(
                    || generate_inserts(batch_size, 256),
                    |rows| black_box(backend.bulk_write(&rows).unwrap()),
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }
    group.finish();
}

/// Benchmark file-backed bulk inserts.
fn bench_file_bulk_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_bulk_write");

    // snapshots are rewritten on every write
    group.sample_size(20);

    for batch_size in [10, 100].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                let temp_dir = TempDir::new().unwrap();
                let store = FileStore::new(temp_dir.path());
                let backend = store.open(&params()).unwrap();

                b.iter_batched(
                    || generate_inserts(batch_size, 256),
                    |rows| black_box(backend.bulk_write(&rows).unwrap()),
                    criterion::BatchSize::SmallInput,
                );
                backend.close().unwrap();
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_inmemory_bulk_write, bench_file_bulk_write);
criterion_main!(benches);
