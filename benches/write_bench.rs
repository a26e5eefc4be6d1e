// Table build benchmarks for blocktable

use blocktable::config::{CompressionType, IndexType, TableOptions};
use blocktable::file::MemFile;
use blocktable::filter::BloomFilterPolicy;
use blocktable::TableBuilder;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use tempfile::TempDir;

fn build(options: &TableOptions, size: usize) -> MemFile {
    let file = MemFile::new();
    let mut builder = TableBuilder::new(options.clone(), file.clone()).unwrap();
    for i in 0..size {
        let key = format!("key{:08}", i);
        let value = format!("value{:08}", i);
        builder.add(key.as_bytes(), value.as_bytes()).unwrap();
    }
    builder.finish().unwrap();
    file
}

fn benchmark_sequential_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_build");
    let options = TableOptions::default();

    for size in [1000, 10000, 100000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| black_box(build(&options, size)));
        });
    }

    group.finish();
}

fn benchmark_build_to_disk(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_to_disk");
    let size = 10000;
    group.throughput(Throughput::Elements(size as u64));

    group.bench_function("10000", |b| {
        b.iter(|| {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("bench.sst");
            let mut builder = TableBuilder::create(&path, TableOptions::default()).unwrap();
            for i in 0..size {
                let key = format!("key{:08}", i);
                builder.add(key.as_bytes(), &[b'v'; 100]).unwrap();
            }
            black_box(builder.finish().unwrap());
        });
    });

    group.finish();
}

fn benchmark_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_compression");
    let size = 10000;
    group.throughput(Throughput::Elements(size as u64));

    let mut codecs = vec![CompressionType::None];
    if cfg!(feature = "snappy") {
        codecs.push(CompressionType::Snappy);
    }
    if cfg!(feature = "lz4-compression") {
        codecs.push(CompressionType::Lz4);
    }
    if cfg!(feature = "zstd-compression") {
        codecs.push(CompressionType::Zstd);
    }

    for codec in codecs {
        let options = TableOptions::default().compression(codec);
        group.bench_with_input(BenchmarkId::from_parameter(codec.name()), &options, |b, options| {
            b.iter(|| black_box(build(options, size)));
        });
    }

    group.finish();
}

fn benchmark_filters_and_indexes(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_filters_and_indexes");
    let size = 10000;
    group.throughput(Throughput::Elements(size as u64));

    let bloom = TableOptions::default().filter_policy(Arc::new(BloomFilterPolicy::new(10)));
    let cases = vec![
        ("no_filter", TableOptions::default()),
        ("full_filter", bloom.clone()),
        (
            "block_based_filter",
            TableOptions::default().filter_policy(Arc::new(BloomFilterPolicy::block_based(10))),
        ),
        (
            "partitioned",
            bloom.index_type(IndexType::TwoLevelIndexSearch).partition_filters(true),
        ),
    ];

    for (name, options) in cases {
        group.bench_with_input(BenchmarkId::from_parameter(name), &options, |b, options| {
            b.iter(|| black_box(build(options, size)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_sequential_build,
    benchmark_build_to_disk,
    benchmark_compression,
    benchmark_filters_and_indexes
);
criterion_main!(benches);
