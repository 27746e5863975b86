// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Poller tests: input/output readiness across channels, by-name lookup,
// and rejection of invalid channel keys.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use libfmq::{Channel, Poller, ShmOptions, TransportFactory};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_session(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_poll_{}_{n}", std::process::id())
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

#[test]
fn poll_reports_input_after_send() {
    let session = unique_session("input");
    let endpoint = unique_endpoint("poll_input");

    let sampler = TransportFactory::new("sampler", &small_options(&session)).expect("sampler");
    let sink = TransportFactory::new("sink", &small_options(&session)).expect("sink");

    let mut push = sampler.create_socket("push", "data").expect("push");
    assert!(push.bind(&endpoint));
    let mut pull = sink.create_socket("pull", "data").expect("pull");
    assert!(pull.connect(&endpoint));

    let channel = Channel::with_sockets("data", vec![pull]);
    let mut poller = sink.create_poller(&[&channel]).expect("poller");

    // Nothing pending yet.
    poller.poll(50).expect("poll");
    assert!(!poller.check_input(0));

    let mut msg = sampler.create_message_from_bytes(b"ping").expect("message");
    push.send(&mut msg, 1000).expect("send");

    // The metadata frame lands and input readiness shows up.
    let mut ready = false;
    for _ in 0..50 {
        poller.poll(100).expect("poll");
        if poller.check_input(0) {
            ready = true;
            break;
        }
    }
    assert!(ready, "input readiness never reported");
    assert!(poller.check_input_by_name("data", 0).expect("by name"));
}

#[test]
fn push_socket_polls_output() {
    let session = unique_session("output");
    let endpoint = unique_endpoint("poll_output");

    let sampler = TransportFactory::new("sampler", &small_options(&session)).expect("sampler");
    let sink = TransportFactory::new("sink", &small_options(&session)).expect("sink");

    let mut push = sampler.create_socket("push", "data").expect("push");
    assert!(push.bind(&endpoint));
    let mut pull = sink.create_socket("pull", "data").expect("pull");
    assert!(pull.connect(&endpoint));

    // Let the push socket accept the connection.
    push.get_number_of_connected_peers();

    let channel = Channel::with_sockets("data", vec![push]);
    let mut poller = sampler.create_poller(&[&channel]).expect("poller");

    let mut writable = false;
    for _ in 0..50 {
        poller.poll(100).expect("poll");
        if poller.check_output(0) {
            writable = true;
            break;
        }
    }
    assert!(writable, "output readiness never reported");
    assert!(poller.check_output_by_name("data", 0).expect("by name"));

    drop(pull);
}

#[test]
fn invalid_channel_key_is_an_error() {
    let session = unique_session("badkey");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");

    let pull = factory.create_socket("pull", "data").expect("pull");
    let channel = Channel::with_sockets("data", vec![pull]);

    let mut channels = HashMap::new();
    channels.insert("data".to_string(), channel);

    assert!(Poller::from_map(&channels, &["data"]).is_ok());
    assert!(Poller::from_map(&channels, &["nope"]).is_err());

    let poller = Poller::from_map(&channels, &["data"]).expect("poller");
    assert!(poller.check_input_by_name("nope", 0).is_err());
}
