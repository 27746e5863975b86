// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Allocator throughput: allocate/deallocate cycles in a managed segment,
// for both fit strategies and a spread of sizes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use libfmq::{AllocationAlgorithm, ManagedSegment};

fn unique_name(tag: &str) -> String {
    format!("bench_alloc_{tag}_{}", std::process::id())
}

fn bench_alloc_dealloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_alloc");

    for (tag, algorithm) in [
        ("rbtree_best_fit", AllocationAlgorithm::RbtreeBestFit),
        ("simple_seq_fit", AllocationAlgorithm::SimpleSeqFit),
    ] {
        let name = unique_name(tag);
        libfmq::monitor::remove_object(&name);
        let (segment, _) =
            ManagedSegment::open_or_create(&name, 64 << 20, algorithm).expect("segment");

        for size in [64usize, 1024, 65536, 1 << 20] {
            group.bench_with_input(
                BenchmarkId::new(tag, size),
                &size,
                |b, &size| {
                    b.iter(|| {
                        let handle = segment.allocate(size).expect("allocate");
                        segment.deallocate(handle);
                    })
                },
            );
        }

        drop(segment);
        libfmq::monitor::remove_object(&name);
    }

    group.finish();
}

fn bench_fragmented_alloc(c: &mut Criterion) {
    let name = unique_name("frag");
    libfmq::monitor::remove_object(&name);
    let (segment, _) =
        ManagedSegment::open_or_create(&name, 64 << 20, AllocationAlgorithm::RbtreeBestFit)
            .expect("segment");

    // Build a fragmented free list: many holes of varying sizes.
    let handles: Vec<u64> = (0..512)
        .map(|i| segment.allocate(256 + (i % 7) * 1024).expect("prefill"))
        .collect();
    for handle in handles.iter().step_by(2) {
        segment.deallocate(*handle);
    }

    c.bench_function("segment_alloc_fragmented", |b| {
        b.iter(|| {
            let handle = segment.allocate(512).expect("allocate");
            segment.deallocate(handle);
        })
    });

    for handle in handles.iter().skip(1).step_by(2) {
        segment.deallocate(*handle);
    }
    drop(segment);
    libfmq::monitor::remove_object(&name);
}

criterion_group!(benches, bench_alloc_dealloc, bench_fragmented_alloc);
criterion_main!(benches);
