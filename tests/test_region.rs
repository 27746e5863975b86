// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Unmanaged region tests: user-owned buffers, release acknowledgment
// (exactly once, also under Copy), cross-factory viewers, and region
// events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use libfmq::{RegionConfig, RegionEvent, ShmOptions, TransportFactory};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_session(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_rgn_{}_{n}", std::process::id())
}

fn unique_endpoint(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("ipc:///tmp/fmq_test_{prefix}_{}_{n}", std::process::id())
}

fn small_options(session: &str) -> ShmOptions {
    let mut options = ShmOptions::with_session(session);
    options.segment_size = 16 << 20;
    options
}

fn wait_until(deadline_ms: u64, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    pred()
}

#[test]
fn region_creation_and_bounds() {
    let session = unique_session("bounds");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");

    let region = factory
        .create_unmanaged_region(1 << 20, None, None, RegionConfig::default())
        .expect("region");
    assert!(region.id() >= 1024);
    assert_eq!(region.size(), 1 << 20);
    assert!(!region.data().is_null());

    // Data inside the region is accepted.
    let inside = unsafe { region.data().add(1000) };
    let msg = factory.create_message_in_region(&region, inside, 256, 0);
    assert!(msg.is_ok());

    // Data outside is rejected.
    let outside = unsafe { region.data().add((1 << 20) + 4096) };
    assert!(factory
        .create_message_in_region(&region, outside, 256, 0)
        .is_err());
}

// Every released block is acknowledged exactly once, with matching
// (size, hint), also when the message has been copied.
#[test]
fn acks_fire_exactly_once() {
    let session = unique_session("acks");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");

    let acks: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let acks_cb = Arc::clone(&acks);
    let region = factory
        .create_unmanaged_region(
            1 << 20,
            None,
            Some(Box::new(move |blocks| {
                let mut acks = acks_cb.lock().unwrap();
                for block in blocks {
                    acks.push((block.size, block.hint));
                }
            })),
            RegionConfig::default(),
        )
        .expect("region");

    // Plain message: one ack.
    let data = region.data();
    let msg = factory
        .create_message_in_region(&region, data, 1000, 7)
        .expect("region message");
    drop(msg);

    assert!(wait_until(3000, || acks.lock().unwrap().len() == 1));
    assert_eq!(acks.lock().unwrap()[0], (1000, 7));

    // Copied message: still exactly one ack, after the last owner.
    let data2 = unsafe { region.data().add(4096) };
    let original = factory
        .create_message_in_region(&region, data2, 2000, 9)
        .expect("region message");
    let mut copy = factory.create_message();
    copy.copy_from(&original).expect("copy");
    assert_eq!(original.ref_count(), 2);

    drop(original);
    std::thread::sleep(Duration::from_millis(700));
    assert_eq!(acks.lock().unwrap().len(), 1, "ack fired before last owner");

    drop(copy);
    assert!(wait_until(3000, || acks.lock().unwrap().len() == 2));
    assert_eq!(acks.lock().unwrap()[1], (2000, 9));
}

// Scenario: five 2 MB blocks at fixed offsets travel to a sink factory;
// the sampler's bulk callback sees all five (handle, size, hint) triples.
#[test]
fn region_transfer_with_acks() {
    let session = unique_session("transfer");
    let endpoint = unique_endpoint("rgn_transfer");

    let sampler = TransportFactory::new("sampler", &small_options(&session)).expect("sampler");
    let sink = TransportFactory::new("sink", &small_options(&session)).expect("sink");

    let acks: Arc<Mutex<Vec<(i64, u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let acks_cb = Arc::clone(&acks);
    let region = sampler
        .create_unmanaged_region(
            10_000_000,
            None,
            Some(Box::new(move |blocks| {
                let mut acks = acks_cb.lock().unwrap();
                for block in blocks {
                    acks.push((0, block.size, block.hint));
                }
            })),
            RegionConfig::default(),
        )
        .expect("region");

    let mut push = sampler.create_socket("push", "data").expect("push");
    assert!(push.bind(&endpoint));
    let mut pull = sink.create_socket("pull", "data").expect("pull");
    assert!(pull.connect(&endpoint));

    const BLOCK: usize = 2_000_000;
    for i in 0..5usize {
        let data = unsafe { region.data().add(i * BLOCK) };
        unsafe { std::ptr::write_bytes(data, i as u8 + 1, BLOCK) };
        let mut msg = sampler
            .create_message_in_region(&region, data, BLOCK, i as u64)
            .expect("region message");
        push.send(&mut msg, 1000).expect("send");
    }

    for i in 0..5usize {
        let mut msg = sink.create_message();
        let size = pull.receive(&mut msg, 2000).expect("receive");
        assert_eq!(size, BLOCK as u64);
        assert_eq!(msg.as_bytes()[0], i as u8 + 1);
        assert_eq!(msg.as_bytes()[BLOCK - 1], i as u8 + 1);
        // Dropping enqueues the viewer-side ack.
    }

    assert!(wait_until(5000, || acks.lock().unwrap().len() == 5));
    let acks = acks.lock().unwrap();
    for (i, (_, size, hint)) in acks.iter().enumerate() {
        assert_eq!(*size, BLOCK as u64);
        assert_eq!(*hint, i as u64);
    }
}

// Region events: every subscriber that is live when a region is created
// observes 'created' before 'destroyed'.
#[test]
fn region_events_fire_in_order() {
    let session = unique_session("events");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");

    let events: Arc<Mutex<Vec<(u16, bool, RegionEvent)>>> = Arc::new(Mutex::new(Vec::new()));
    let events_cb = Arc::clone(&events);
    factory.subscribe_to_region_events(Box::new(move |info| {
        events_cb
            .lock()
            .unwrap()
            .push((info.id, info.managed, info.event));
    }));
    assert!(factory.subscribed_to_region_events());

    // The managed segment itself is reported as created.
    assert!(wait_until(2000, || events
        .lock()
        .unwrap()
        .iter()
        .any(|(_, managed, e)| *managed && *e == RegionEvent::Created)));

    let region = factory
        .create_unmanaged_region(1 << 20, None, None, RegionConfig::default())
        .expect("region");
    let region_id = region.id();

    assert!(wait_until(2000, || events
        .lock()
        .unwrap()
        .iter()
        .any(|(id, managed, e)| *id == region_id && !managed && *e == RegionEvent::Created)));

    drop(region);

    assert!(wait_until(2000, || events
        .lock()
        .unwrap()
        .iter()
        .any(|(id, managed, e)| *id == region_id && !managed && *e == RegionEvent::Destroyed)));

    let events = events.lock().unwrap();
    let created_at = events
        .iter()
        .position(|(id, _, e)| *id == region_id && *e == RegionEvent::Created)
        .unwrap();
    let destroyed_at = events
        .iter()
        .position(|(id, _, e)| *id == region_id && *e == RegionEvent::Destroyed)
        .unwrap();
    assert!(created_at < destroyed_at);

    factory.unsubscribe_from_region_events();
    assert!(!factory.subscribed_to_region_events());
}

#[test]
fn region_info_lists_segments_and_regions() {
    let session = unique_session("info");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");

    let region = factory
        .create_unmanaged_region(1 << 20, None, None, RegionConfig::default())
        .expect("region");

    let infos = factory.get_region_info();
    assert!(infos.iter().any(|i| i.managed && i.id == 0));
    let entry = infos
        .iter()
        .find(|i| !i.managed && i.id == region.id())
        .expect("region entry");
    assert_eq!(entry.event, RegionEvent::Created);
    assert_eq!(entry.size, 1 << 20);
}
