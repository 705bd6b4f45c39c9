//! Path Encoding Benchmarks
//!
//! Measures the host side of the pipeline:
//! - Streaming segments into the block ring
//! - End-to-end encode, copy and reclaim on the CPU device
//! - Temporary suballocator churn

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use pathring::prelude::*;

fn ring(config: RuntimeConfig) -> PathRing {
    PathRing::builder()
        .backend(Backend::Cpu)
        .config(config)
        .build()
        .expect("Failed to create context")
}

/// Encode paths of `lines` segments each, releasing them as they finish.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("path/encode");

    for lines in [4usize, 32, 128] {
        group.throughput(Throughput::Elements(lines as u64));
        group.bench_with_input(BenchmarkId::new("lines", lines), &lines, |b, &lines| {
            let ring = ring(RuntimeConfig::default());
            let mut pb = ring.path_builder().expect("path builder");
            b.iter(|| {
                pb.begin().unwrap();
                for i in 0..lines {
                    let x = i as f32 + 1.0;
                    pb.line(black_box([x, 1.0, x + 1.0, 2.0])).unwrap();
                }
                let path = pb.end().unwrap();
                ring.path_release(&[path]).unwrap();
            });
            ring.wait_idle().unwrap();
        });
    }

    group.bench_function("cubics/64", |b| {
        let ring = ring(RuntimeConfig::default());
        let mut pb = ring.path_builder().expect("path builder");
        b.iter(|| {
            pb.begin().unwrap();
            for i in 0..64 {
                let x = i as f32 + 1.0;
                pb.cubic(black_box([x, 1.0, x + 0.3, 2.0, x + 0.6, 2.0, x + 1.0, 1.0]))
                    .unwrap();
            }
            let path = pb.end().unwrap();
            ring.path_release(&[path]).unwrap();
        });
        ring.wait_idle().unwrap();
    });

    group.finish();
}

/// Encode a batch of paths and wait for the device to copy them.
fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("path/round_trip");
    group.sample_size(20);

    for paths in [16usize, 256] {
        group.throughput(Throughput::Elements(paths as u64));
        group.bench_with_input(BenchmarkId::new("paths", paths), &paths, |b, &paths| {
            let ring = ring(RuntimeConfig::default());
            let mut pb = ring.path_builder().expect("path builder");
            b.iter(|| {
                let mut batch = Vec::with_capacity(paths);
                for i in 0..paths {
                    let x = i as f32 + 1.0;
                    pb.begin().unwrap();
                    pb.quad([x, 1.0, x + 0.5, 3.0, x + 1.0, 1.0]).unwrap();
                    batch.push(pb.end().unwrap());
                }
                ring.path_flush(&batch).unwrap();
                ring.path_release(&batch).unwrap();
                ring.wait_idle().unwrap();
            });
        });
    }

    group.finish();
}

/// Acquire and release spans of the temporary ring.
fn bench_suballocator(c: &mut Criterion) {
    let mut group = c.benchmark_group("suballocator");

    group.bench_function("acquire_release", |b| {
        let mut alloc = Suballocator::new(1024, 256).expect("suballocator");
        b.iter(|| {
            let span = alloc.try_acquire(black_box(300)).unwrap().unwrap();
            alloc.release(span.id).unwrap();
        });
    });

    group.bench_function("fifo_window", |b| {
        let mut alloc = Suballocator::new(1024, 256).expect("suballocator");
        let mut live = std::collections::VecDeque::new();
        b.iter(|| {
            if live.len() == 8 {
                let id = live.pop_front().unwrap();
                alloc.release(id).unwrap();
            }
            let span = alloc.try_acquire(black_box(1000)).unwrap().unwrap();
            live.push_back(span.id);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_round_trip, bench_suballocator);
criterion_main!(benches);
