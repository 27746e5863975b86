// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Factory lifecycle tests: session identity, heartbeats, device counting,
// and cleanup liveness when the last factory leaves.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use libfmq::shm_id::{build_shm_id_from_session_and_uid, effective_uid};
use libfmq::{ShmOptions, TransportFactory};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_session(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_fac_{}_{n}", std::process::id())
}

fn small_options(session: &str) -> ShmOptions {
    let mut options = ShmOptions::with_session(session);
    options.segment_size = 16 << 20;
    options
}

fn shm_object_exists(name: &str) -> bool {
    Path::new(&format!("/dev/shm/{name}")).exists()
}

#[test]
fn shm_id_matches_session_derivation() {
    let session = unique_session("ident");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");

    let expected = build_shm_id_from_session_and_uid(&session, effective_uid());
    assert_eq!(factory.shm_id(), expected);
}

#[test]
fn heartbeat_advances_while_factory_lives() {
    let session = unique_session("beat");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");

    let first = factory.manager().heartbeat();
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if factory.manager().heartbeat() > first {
            break;
        }
        assert!(Instant::now() < deadline, "heartbeat never advanced");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn device_counter_tracks_factories() {
    let session = unique_session("devcount");

    let a = TransportFactory::new("a", &small_options(&session)).expect("factory a");
    assert_eq!(a.manager().device_count(), 1);

    let b = TransportFactory::new("b", &small_options(&session)).expect("factory b");
    assert_eq!(a.manager().device_count(), 2);

    drop(b);
    assert_eq!(a.manager().device_count(), 1);
}

// When every factory of a session destructs normally, no fmq_<S>_* object
// remains.
#[test]
fn last_factory_cleans_up_session_objects() {
    let session = unique_session("cleanup");

    let a = TransportFactory::new("a", &small_options(&session)).expect("factory a");
    let b = TransportFactory::new("b", &small_options(&session)).expect("factory b");
    let shm_id = a.shm_id().to_string();

    let mng = format!("fmq_{shm_id}_mng");
    let segment = format!("fmq_{shm_id}_m_0");
    let mutex = format!("fmq_{shm_id}_mtx");
    assert!(shm_object_exists(&mng));
    assert!(shm_object_exists(&segment));
    assert!(shm_object_exists(&mutex));

    drop(a);
    // One factory left: everything stays.
    assert!(shm_object_exists(&mng));
    assert!(shm_object_exists(&segment));

    drop(b);
    assert!(!shm_object_exists(&mng));
    assert!(!shm_object_exists(&segment));
    assert!(!shm_object_exists(&mutex));
}

#[test]
fn no_cleanup_option_leaves_objects() {
    let session = unique_session("nocleanup");
    let mut options = small_options(&session);
    options.no_cleanup = true;

    let factory = TransportFactory::new("dev", &options).expect("factory");
    let shm_id = factory.shm_id().to_string();
    drop(factory);

    let mng = format!("fmq_{shm_id}_mng");
    assert!(shm_object_exists(&mng));

    // The library sweep removes what the factory left behind.
    libfmq::monitor::cleanup_full(&shm_id, false);
    assert!(!shm_object_exists(&mng));
}

#[test]
fn reopened_session_sees_existing_segment() {
    let session = unique_session("reopen");

    let a = TransportFactory::new("a", &small_options(&session)).expect("factory a");
    let msg = a.create_message_with_size(1024).expect("message");
    let used = a.manager().free_memory();

    // Second factory maps the same segment and sees the same allocator
    // state.
    let b = TransportFactory::new("b", &small_options(&session)).expect("factory b");
    assert_eq!(b.manager().free_memory(), used);

    drop(msg);
    assert_eq!(b.manager().free_memory(), a.manager().free_memory());
}
