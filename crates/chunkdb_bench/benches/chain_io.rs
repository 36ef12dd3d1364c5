//! Chain cursor benchmarks.

use chunkdb_bench::random_data;
use chunkdb_core::{AllocateTicket, Cluster, Config};
use chunkdb_storage::FileBackend;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

/// Benchmark writing a fresh chain that has to grow while written.
fn bench_write_growing(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_write_growing");

    for size in [256usize, 4096, 65536].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let cluster = Cluster::in_memory().unwrap();
            let data = random_data(size);
            b.iter(|| {
                let head = cluster.alloc(&AllocateTicket::bytes(16)).unwrap();
                let mut io = cluster.io(head.ptr()).unwrap();
                io.write_all(black_box(&data)).unwrap();
                io.close().unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark reading a chain of many small links.
fn bench_read_linked(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_read_linked");

    for size in [4096usize, 65536].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let cluster = Cluster::in_memory().unwrap();
            // keeps the head's next field wide enough for distant links
            cluster.alloc(&AllocateTicket::bytes(256)).unwrap();
            let head = cluster.alloc(&AllocateTicket::bytes(64)).unwrap();
            // every append lands behind another chunk, so the chain keeps linking
            let data = random_data(256);
            let mut written = 0;
            while written < size {
                let mut io = cluster.io(head.ptr()).unwrap();
                io.read_all().unwrap();
                io.write_all(&data).unwrap();
                io.close().unwrap();
                cluster.alloc(&AllocateTicket::bytes(1)).unwrap();
                written += data.len();
            }

            b.iter(|| {
                let bytes = cluster.io(black_box(head.ptr())).unwrap().read_all().unwrap();
                black_box(bytes);
            });
        });
    }

    group.finish();
}

/// Benchmark chain writes against a file-backed store.
fn bench_file_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_write_file");

    // Use larger sample size for file operations
    group.sample_size(50);

    for size in [256usize, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let temp_dir = TempDir::new().unwrap();
            let store = FileBackend::open(&temp_dir.path().join("bench.chunkdb")).unwrap();
            let cluster = Cluster::create(store, Config::default()).unwrap();
            let data = random_data(size);

            b.iter(|| {
                let head = cluster
                    .alloc(&AllocateTicket::bytes(size as u64))
                    .unwrap();
                let mut io = cluster.io(head.ptr()).unwrap();
                io.write_all(black_box(&data)).unwrap();
                io.close().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_write_growing,
    bench_read_linked,
    bench_file_write,
);

criterion_main!(benches);
