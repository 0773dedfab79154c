//! Table-file benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use shelfdb_bench::{fill_records, random_data, runtime};
use shelfdb_core::TableFiles;
use shelfdb_storage::{FileDriver, InMemoryDriver};
use std::sync::Arc;
use tempfile::TempDir;

const PATH: &str = "bench/t.db";

/// Benchmark appending one fragment to an in-memory store.
fn bench_memory_append(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("memory_append");

    for size in [64, 256, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let tables = TableFiles::new(Arc::new(InMemoryDriver::new()));
            let data = random_data(size);

            b.iter(|| {
                let record = rt
                    .block_on(tables.append_table_file(PATH, black_box(data.clone())))
                    .unwrap();
                black_box(record);
            });
        });
    }

    group.finish();
}

/// Benchmark merged reads over a growing number of pending records.
fn bench_memory_merged_read(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("memory_merged_read");

    for records in [1, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*records as u64));
        group.bench_with_input(BenchmarkId::from_parameter(records), records, |b, &records| {
            let tables = TableFiles::new(Arc::new(InMemoryDriver::new()));
            rt.block_on(fill_records(&tables, PATH, records, 256));

            b.iter(|| {
                let data = rt.block_on(tables.read_table_file(black_box(PATH))).unwrap();
                black_box(data);
            });
        });
    }

    group.finish();
}

/// Benchmark compaction of a file with pending records.
fn bench_memory_compact(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("memory_compact");

    for records in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(records), records, |b, &records| {
            b.iter_batched(
                || {
                    let tables = TableFiles::new(Arc::new(InMemoryDriver::new()));
                    rt.block_on(fill_records(&tables, PATH, records, 256));
                    let snapshot = rt.block_on(tables.read_table_file(PATH)).unwrap();
                    (tables, snapshot)
                },
                |(tables, snapshot)| {
                    let report = rt
                        .block_on(tables.crash_safe_write_table_file(PATH, snapshot))
                        .unwrap();
                    black_box(report);
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Benchmark appending one fragment on the local filesystem.
fn bench_file_append(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("file_append");

    // Every append syncs a new file.
    group.sample_size(20);

    for size in [256, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let temp_dir = TempDir::new().unwrap();
            let tables = TableFiles::new(Arc::new(FileDriver::open(temp_dir.path()).unwrap()));
            let data = random_data(size);

            b.iter(|| {
                let record = rt
                    .block_on(tables.append_table_file(PATH, black_box(data.clone())))
                    .unwrap();
                black_box(record);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_memory_append,
    bench_memory_merged_read,
    bench_memory_compact,
    bench_file_append,
);

criterion_main!(benches);
