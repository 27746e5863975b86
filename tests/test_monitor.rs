// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Monitor tests: presence advertisement, immediate sweeps, and
// heartbeat-stasis reclamation of an abandoned session.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use libfmq::monitor::{cleanup_full, Monitor, MonitorConfig};
use libfmq::{ShmOptions, TransportFactory};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_session(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_mon_{}_{n}", std::process::id())
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
fn presence_mutex_is_exclusive() {
    let session = unique_session("presence");
    let shm_id = libfmq::shm_id::build_shm_id(&session);

    let first = Monitor::new(&shm_id, MonitorConfig::default()).expect("first monitor");
    assert!(Monitor::new(&shm_id, MonitorConfig::default()).is_err());
    drop(first);

    cleanup_full(&shm_id, false);
}

#[test]
fn cleanup_sweeps_abandoned_objects() {
    let session = unique_session("sweep");
    let mut options = small_options(&session);
    options.no_cleanup = true;

    let factory = TransportFactory::new("dev", &options).expect("factory");
    let shm_id = factory.shm_id().to_string();
    drop(factory);

    assert!(shm_object_exists(&format!("fmq_{shm_id}_mng")));
    assert!(shm_object_exists(&format!("fmq_{shm_id}_m_0")));

    let results = cleanup_full(&shm_id, false);
    assert!(results.iter().any(|(name, removed)| name.contains("_mng") && *removed));
    assert!(!shm_object_exists(&format!("fmq_{shm_id}_mng")));
    assert!(!shm_object_exists(&format!("fmq_{shm_id}_m_0")));
    assert!(!shm_object_exists(&format!("fmq_{shm_id}_mtx")));
}

// A session whose devices stopped heartbeating (here: left behind with
// no_cleanup) is reclaimed by the monitor within ~2x the timeout, after
// which the monitor self-destructs.
#[test]
fn monitor_reclaims_dead_session() {
    let session = unique_session("stasis");
    let mut options = small_options(&session);
    options.no_cleanup = true;

    let factory = TransportFactory::new("dev", &options).expect("factory");
    let shm_id = factory.shm_id().to_string();
    drop(factory);

    let mng = format!("fmq_{shm_id}_mng");
    assert!(shm_object_exists(&mng));

    let config = MonitorConfig {
        self_destruct: true,
        timeout_ms: 300,
        interval_ms: 50,
        ..MonitorConfig::default()
    };
    let mut monitor = Monitor::new(&shm_id, config).expect("monitor");
    let runner = thread::spawn(move || monitor.run());

    let deadline = Instant::now() + Duration::from_millis(2 * 300 + 2000);
    while shm_object_exists(&mng) {
        assert!(Instant::now() < deadline, "monitor did not reclaim the session");
        thread::sleep(Duration::from_millis(50));
    }

    runner.join().expect("monitor run loop");
    assert!(!shm_object_exists(&format!("fmq_{shm_id}_ms")));
    assert!(!shm_object_exists(&format!("fmq_{shm_id}_cq")));
}

// A live session is left alone: the heartbeat keeps advancing, so the
// monitor never reaches the stasis window.
#[test]
fn monitor_spares_live_session() {
    let session = unique_session("alive");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");
    let shm_id = factory.shm_id().to_string();

    let config = MonitorConfig {
        self_destruct: false,
        timeout_ms: 300,
        interval_ms: 50,
        ..MonitorConfig::default()
    };
    let mut monitor = Monitor::new(&shm_id, config).expect("monitor");
    let terminate = monitor.terminate_flag();
    let runner = thread::spawn(move || monitor.run());

    thread::sleep(Duration::from_millis(1200));
    assert!(shm_object_exists(&format!("fmq_{shm_id}_mng")));
    assert!(shm_object_exists(&format!("fmq_{shm_id}_m_0")));

    terminate.store(true, Ordering::Release);
    runner.join().expect("monitor run loop");

    drop(factory);
    cleanup_full(&shm_id, false);
}
