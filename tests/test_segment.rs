// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Managed segment and allocator tests: handle round-trips, free-memory
// accounting, both fit strategies, shrinking, and allocator safety under
// contention.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use libfmq::{AllocationAlgorithm, ManagedSegment};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_seg_{}_{n}", std::process::id())
}

fn cleanup(name: &str) {
    libfmq::monitor::remove_object(name);
}

#[test]
fn create_and_reopen() {
    let name = unique_name("create");
    cleanup(&name);

    let (seg, created) =
        ManagedSegment::open_or_create(&name, 1 << 20, AllocationAlgorithm::RbtreeBestFit)
            .expect("create segment");
    assert!(created);
    assert_eq!(seg.size(), 1 << 20);
    assert!(seg.free_memory() > 0);

    let (seg2, created2) =
        ManagedSegment::open_or_create(&name, 1 << 20, AllocationAlgorithm::RbtreeBestFit)
            .expect("open segment");
    assert!(!created2);
    assert_eq!(seg2.free_memory(), seg.free_memory());

    cleanup(&name);
}

#[test]
fn algorithm_mismatch_honors_existing() {
    let name = unique_name("mismatch");
    cleanup(&name);

    let (_seg, created) =
        ManagedSegment::open_or_create(&name, 1 << 20, AllocationAlgorithm::SimpleSeqFit)
            .expect("create segment");
    assert!(created);

    let (seg2, _) =
        ManagedSegment::open_or_create(&name, 1 << 20, AllocationAlgorithm::RbtreeBestFit)
            .expect("open segment");
    assert_eq!(seg2.algorithm(), AllocationAlgorithm::SimpleSeqFit);

    cleanup(&name);
}

#[test]
fn allocate_deallocate_restores_free_memory() {
    let name = unique_name("freemem");
    cleanup(&name);

    let (seg, _) =
        ManagedSegment::open_or_create(&name, 1 << 20, AllocationAlgorithm::RbtreeBestFit)
            .expect("create segment");
    let before = seg.free_memory();

    let a = seg.allocate(1000).expect("allocate a");
    let b = seg.allocate(5000).expect("allocate b");
    assert!(seg.free_memory() < before);

    seg.deallocate(a);
    seg.deallocate(b);
    assert_eq!(seg.free_memory(), before);

    cleanup(&name);
}

#[test]
fn handles_resolve_to_written_bytes() {
    let name = unique_name("handles");
    cleanup(&name);

    let (seg, _) =
        ManagedSegment::open_or_create(&name, 1 << 20, AllocationAlgorithm::RbtreeBestFit)
            .expect("create segment");

    let handle = seg.allocate(256).expect("allocate");
    let ptr = seg.ptr_from_handle(handle);
    unsafe {
        for i in 0..256usize {
            *ptr.add(i) = i as u8;
        }
    }
    assert_eq!(seg.handle_from_ptr(ptr), handle);

    // A second mapping of the same segment sees the same logical buffer.
    let seg2 = ManagedSegment::open_existing(&name).expect("open segment");
    let ptr2 = seg2.ptr_from_handle(handle);
    for i in 0..256usize {
        assert_eq!(unsafe { *ptr2.add(i) }, i as u8);
    }

    seg.deallocate(handle);
    cleanup(&name);
}

#[test]
fn best_fit_prefers_smallest_sufficient_block() {
    let name = unique_name("bestfit");
    cleanup(&name);

    let (seg, _) =
        ManagedSegment::open_or_create(&name, 1 << 20, AllocationAlgorithm::RbtreeBestFit)
            .expect("create segment");

    // Carve out a small and a large hole, in address order small first.
    let small = seg.allocate(1024).expect("small");
    let fence1 = seg.allocate(64).expect("fence1");
    let large = seg.allocate(65536).expect("large");
    let fence2 = seg.allocate(64).expect("fence2");

    seg.deallocate(small);
    seg.deallocate(large);

    // Best fit lands the request in the freed small hole, not the large
    // one: the returned offset matches the small hole's.
    let again = seg.allocate(1024).expect("refill");
    assert_eq!(again, small);

    seg.deallocate(again);
    seg.deallocate(fence1);
    seg.deallocate(fence2);
    cleanup(&name);
}

#[test]
fn seq_fit_takes_first_sufficient_block() {
    let name = unique_name("seqfit");
    cleanup(&name);

    let (seg, _) =
        ManagedSegment::open_or_create(&name, 1 << 20, AllocationAlgorithm::SimpleSeqFit)
            .expect("create segment");

    let first = seg.allocate(65536).expect("first");
    let fence = seg.allocate(64).expect("fence");
    seg.deallocate(first);

    // Sequential fit reuses the first hole even for a small request.
    let small = seg.allocate(128).expect("small");
    assert_eq!(small, first);

    seg.deallocate(small);
    seg.deallocate(fence);
    cleanup(&name);
}

#[test]
fn shrink_in_place_returns_tail() {
    let name = unique_name("shrink");
    cleanup(&name);

    let (seg, _) =
        ManagedSegment::open_or_create(&name, 1 << 20, AllocationAlgorithm::RbtreeBestFit)
            .expect("create segment");
    let before = seg.free_memory();

    let handle = seg.allocate(100_000).expect("allocate");
    let after_alloc = seg.free_memory();

    assert!(seg.shrink_in_place(handle, 1000));
    assert!(seg.free_memory() > after_alloc);

    // Too-small tails are refused.
    assert!(!seg.shrink_in_place(handle, 1000));

    seg.deallocate(handle);
    assert_eq!(seg.free_memory(), before);
    cleanup(&name);
}

#[test]
fn allocation_larger_than_segment_fails() {
    let name = unique_name("toolarge");
    cleanup(&name);

    let (seg, _) =
        ManagedSegment::open_or_create(&name, 1 << 16, AllocationAlgorithm::RbtreeBestFit)
            .expect("create segment");
    assert!(seg.allocate(1 << 20).is_none());

    cleanup(&name);
}

// With N threads running allocate/fill/deallocate loops, no two live
// allocations overlap and the free memory returns to its initial value.
#[test]
fn allocator_is_safe_under_contention() {
    let name = unique_name("contend");
    cleanup(&name);

    let (seg, _) =
        ManagedSegment::open_or_create(&name, 8 << 20, AllocationAlgorithm::RbtreeBestFit)
            .expect("create segment");
    let seg = Arc::new(seg);
    let before = seg.free_memory();

    let threads: Vec<_> = (0..4)
        .map(|t| {
            let seg = Arc::clone(&seg);
            thread::spawn(move || {
                for round in 0..200 {
                    let size = 128 + (t * 997 + round * 131) % 4096;
                    let handle = loop {
                        if let Some(h) = seg.allocate(size) {
                            break h;
                        }
                        thread::yield_now();
                    };
                    let fill = (t * 31 + round) as u8;
                    let ptr = seg.ptr_from_handle(handle);
                    unsafe {
                        std::ptr::write_bytes(ptr, fill, size);
                    }
                    // The fill must still be intact: overlapping
                    // allocations would have scribbled over it.
                    for i in (0..size).step_by(97) {
                        assert_eq!(unsafe { *ptr.add(i) }, fill);
                    }
                    seg.deallocate(handle);
                }
            })
        })
        .collect();

    for t in threads {
        t.join().expect("allocator thread");
    }

    assert_eq!(seg.free_memory(), before);
    cleanup(&name);
}
