// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Message lifecycle tests: refcount soundness, zero-copy copies, used-size
// shrinking, rebuild, and the bad-alloc retry policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use libfmq::{Error, ShmOptions, TransportFactory};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_session(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_msg_{}_{n}", std::process::id())
}

fn small_options(session: &str) -> ShmOptions {
    let mut options = ShmOptions::with_session(session);
    options.segment_size = 16 << 20;
    options
}

#[test]
fn empty_message() {
    let session = unique_session("empty");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");

    let msg = factory.create_message();
    assert_eq!(msg.size(), 0);
    assert!(msg.data().is_null());
    assert_eq!(msg.ref_count(), 1);
}

#[test]
fn managed_message_owns_written_bytes() {
    let session = unique_session("owns");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");

    let mut msg = factory.create_message_with_size(1000).expect("message");
    assert_eq!(msg.size(), 1000);
    assert_eq!(msg.ref_count(), 1);
    for (i, byte) in msg.as_bytes_mut().iter_mut().enumerate() {
        *byte = i as u8;
    }
    for (i, byte) in msg.as_bytes().iter().enumerate() {
        assert_eq!(*byte, i as u8);
    }
}

#[test]
fn free_memory_returns_after_drop() {
    let session = unique_session("freemem");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");
    let manager = factory.manager();

    let before = manager.free_memory();
    let msg = factory.create_message_with_size(100_000).expect("message");
    assert!(manager.free_memory() < before);
    drop(msg);
    assert_eq!(manager.free_memory(), before);
}

#[test]
fn from_bytes_copies_content() {
    let session = unique_session("frombytes");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");

    let msg = factory.create_message_from_bytes(b"Hello").expect("message");
    assert_eq!(msg.size(), 5);
    assert_eq!(msg.as_bytes(), b"Hello");
}

#[test]
fn copy_shares_buffer_without_duplicating() {
    let session = unique_session("copy");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");
    let manager = factory.manager();

    let before = manager.free_memory();
    let original = factory.create_message_from_bytes(b"payload").expect("message");
    let after_one = manager.free_memory();

    let mut copy = factory.create_message();
    copy.copy_from(&original).expect("copy");

    // Same bytes, same buffer, no second allocation.
    assert_eq!(manager.free_memory(), after_one);
    assert_eq!(copy.as_bytes(), b"payload");
    assert_eq!(copy.data(), original.data());
    assert_eq!(original.ref_count(), 2);
    assert_eq!(copy.ref_count(), 2);

    drop(original);
    assert_eq!(copy.ref_count(), 1);
    assert_eq!(manager.free_memory(), after_one);

    drop(copy);
    assert_eq!(manager.free_memory(), before);
}

#[test]
fn copy_of_empty_closes_target() {
    let session = unique_session("copyempty");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");

    let empty = factory.create_message();
    let mut target = factory.create_message_with_size(128).expect("message");
    target.copy_from(&empty).expect("copy");
    assert_eq!(target.size(), 0);
    assert!(target.data().is_null());
}

#[test]
fn set_used_size_never_widens() {
    let session = unique_session("usedsize");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");

    let mut msg = factory.create_message_with_size(1000).expect("message");
    assert!(!msg.set_used_size(2000));
    assert_eq!(msg.size(), 1000);

    assert!(msg.set_used_size(1000));
    assert_eq!(msg.size(), 1000);

    assert!(msg.set_used_size(100));
    assert_eq!(msg.size(), 100);

    assert!(msg.set_used_size(0));
    assert_eq!(msg.size(), 0);
}

#[test]
fn set_used_size_preserves_content() {
    let session = unique_session("usedcontent");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");
    let manager = factory.manager();

    let before = manager.free_memory();
    let mut msg = factory.create_message_with_size(2_000_000).expect("message");
    msg.as_bytes_mut()[..16].copy_from_slice(b"sixteen byte tag");

    assert!(msg.set_used_size(16));
    assert_eq!(msg.size(), 16);
    assert_eq!(msg.as_bytes(), b"sixteen byte tag");
    // The tail went back to the allocator one way or another.
    assert!(manager.free_memory() > before - 2_100_000);

    drop(msg);
    assert_eq!(manager.free_memory(), before);
}

#[test]
fn rebuild_resets_and_reallocates() {
    let session = unique_session("rebuild");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");
    let manager = factory.manager();

    let before = manager.free_memory();
    let mut msg = factory.create_message_with_size(1024).expect("message");
    msg.rebuild();
    assert_eq!(msg.size(), 0);
    assert_eq!(manager.free_memory(), before);

    msg.rebuild_with_size(4096).expect("rebuild with size");
    assert_eq!(msg.size(), 4096);
    drop(msg);
    assert_eq!(manager.free_memory(), before);
}

#[test]
fn reset_fails_with_live_messages() {
    let session = unique_session("reset");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");

    let msg = factory.create_message_with_size(64).expect("message");
    assert!(matches!(factory.reset(), Err(Error::Message(_))));
    drop(msg);
    assert!(factory.reset().is_ok());
}

// Scenario: a 1 MiB segment holds one 900 kB message; a second allocation
// of the same size exhausts its retries in ~max_attempts * interval, then
// succeeds once the first buffer is gone.
#[test]
fn bad_alloc_retries_then_succeeds() {
    let session = unique_session("badalloc");
    let mut options = ShmOptions::with_session(&session);
    options.segment_size = 1_048_576;
    options.bad_alloc_max_attempts = 3;
    options.bad_alloc_attempt_interval_ms = 10;
    let factory = TransportFactory::new("dev", &options).expect("factory");

    let holder = factory.create_message_with_size(900_000).expect("first");

    let start = Instant::now();
    let denied = factory.create_message_with_size(900_000);
    let elapsed = start.elapsed();
    assert!(matches!(denied, Err(Error::BadAlloc(_))));
    assert!(elapsed.as_millis() >= 20, "retries were too fast: {elapsed:?}");

    drop(holder);
    let granted = factory.create_message_with_size(900_000);
    assert!(granted.is_ok());
}

#[test]
fn oversized_allocation_fails_immediately() {
    let session = unique_session("oversize");
    let mut options = ShmOptions::with_session(&session);
    options.segment_size = 1_048_576;
    options.bad_alloc_max_attempts = -1;
    options.throw_bad_alloc = true;
    let factory = TransportFactory::new("dev", &options).expect("factory");

    let start = Instant::now();
    let denied = factory.create_message_with_size(2_000_000);
    assert!(matches!(denied, Err(Error::BadAlloc(_))));
    assert!(start.elapsed().as_millis() < 1000);
}
