// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Socket transfer tests: push/pull and req/rep over the host-local stream
// layer, handle portability across factories, multi-part frames, timeout
// and interrupt behavior, and pattern-state errors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use libfmq::{Error, Message, ShmOptions, TransferError, TransportFactory};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_session(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_sock_{}_{n}", std::process::id())
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
fn pub_sub_is_rejected() {
    let session = unique_session("pubsub");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");

    assert!(matches!(
        factory.create_socket("pub", "data"),
        Err(Error::Transport(_))
    ));
    assert!(matches!(
        factory.create_socket("sub", "data"),
        Err(Error::Transport(_))
    ));
}

// Scenario: sampler sends "Hello" on channel data, sink receives and
// compares; segment free memory returns to the pre-send value after the
// sink drops the message.
#[test]
fn push_pull_hello() {
    let session = unique_session("hello");
    let endpoint = unique_endpoint("hello");

    let sampler = TransportFactory::new("sampler", &small_options(&session)).expect("sampler");
    let sink = TransportFactory::new("sink", &small_options(&session)).expect("sink");

    let before = sampler.manager().free_memory();

    let mut push = sampler.create_socket("push", "data").expect("push");
    assert!(push.bind(&endpoint));
    let mut pull = sink.create_socket("pull", "data").expect("pull");
    assert!(pull.connect(&endpoint));

    let mut msg = sampler.create_message_from_bytes(b"Hello").expect("message");
    let sent = push.send(&mut msg, 1000).expect("send");
    assert_eq!(sent, 5);
    drop(msg);

    let mut received = sink.create_message();
    let got = pull.receive(&mut received, 1000).expect("receive");
    assert_eq!(got, 5);
    assert_eq!(received.as_bytes(), b"Hello");

    drop(received);
    assert_eq!(sampler.manager().free_memory(), before);

    assert_eq!(push.messages_tx(), 1);
    assert_eq!(push.bytes_tx(), 5);
    assert_eq!(pull.messages_rx(), 1);
    assert_eq!(pull.bytes_rx(), 5);
}

// Scenario: one allocation fanned out via Copy to several sinks; all see
// identical bytes, the allocator reclaims the buffer exactly once.
#[test]
fn copy_fan_out_is_zero_copy() {
    let session = unique_session("fanout");
    let sampler = TransportFactory::new("sampler", &small_options(&session)).expect("sampler");
    let sink = TransportFactory::new("sink", &small_options(&session)).expect("sink");

    let before = sampler.manager().free_memory();
    let fan = 4usize;

    let mut pushes = Vec::new();
    let mut pulls = Vec::new();
    for i in 0..fan {
        let endpoint = unique_endpoint("fanout");
        let mut push = sampler
            .create_socket("push", &format!("data{i}"))
            .expect("push");
        assert!(push.bind(&endpoint));
        let mut pull = sink
            .create_socket("pull", &format!("data{i}"))
            .expect("pull");
        assert!(pull.connect(&endpoint));
        pushes.push(push);
        pulls.push(pull);
    }

    let mut original = sampler.create_message_with_size(1_000_000).expect("message");
    original.as_bytes_mut().fill(0xcd);
    let after_alloc = sampler.manager().free_memory();
    assert!(after_alloc < before);

    for push in pushes.iter_mut() {
        let mut copy = sampler.create_message();
        copy.copy_from(&original).expect("copy");
        push.send(&mut copy, 1000).expect("send");
    }
    // Only the one allocation happened.
    assert_eq!(sampler.manager().free_memory(), after_alloc);

    let mut receipts = Vec::new();
    for pull in pulls.iter_mut() {
        let mut msg = sink.create_message();
        pull.receive(&mut msg, 1000).expect("receive");
        assert_eq!(msg.size(), 1_000_000);
        assert!(msg.as_bytes().iter().all(|b| *b == 0xcd));
        receipts.push(msg);
    }

    drop(original);
    assert_eq!(sampler.manager().free_memory(), after_alloc);
    receipts.clear();
    assert_eq!(sampler.manager().free_memory(), before);
}

// Handle portability: bytes written through one factory's mapping are read
// back through another factory's mapping at every offset.
#[test]
fn handles_are_portable_across_factories() {
    let session = unique_session("portable");
    let endpoint = unique_endpoint("portable");

    let a = TransportFactory::new("a", &small_options(&session)).expect("factory a");
    let b = TransportFactory::new("b", &small_options(&session)).expect("factory b");

    let mut push = a.create_socket("push", "data").expect("push");
    assert!(push.bind(&endpoint));
    let mut pull = b.create_socket("pull", "data").expect("pull");
    assert!(pull.connect(&endpoint));

    let size = 4096usize;
    let mut msg = a.create_message_with_size(size).expect("message");
    for (i, byte) in msg.as_bytes_mut().iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    push.send(&mut msg, 1000).expect("send");

    let mut received = b.create_message();
    pull.receive(&mut received, 1000).expect("receive");
    assert_eq!(received.size(), size);
    for (i, byte) in received.as_bytes().iter().enumerate() {
        assert_eq!(*byte, (i % 251) as u8, "mismatch at offset {i}");
    }
}

// Scenario: a two-part frame [stopFlag | body] arrives as a single unit.
#[test]
fn multipart_frame_is_atomic() {
    let session = unique_session("multipart");
    let endpoint = unique_endpoint("multipart");

    let sampler = TransportFactory::new("sampler", &small_options(&session)).expect("sampler");
    let sink = TransportFactory::new("sink", &small_options(&session)).expect("sink");

    let mut push = sampler.create_socket("push", "data").expect("push");
    assert!(push.bind(&endpoint));
    let mut pull = sink.create_socket("pull", "data").expect("pull");
    assert!(pull.connect(&endpoint));

    for stop_flag in [0u32, 1u32] {
        let mut header = sampler.create_message_with_size(4).expect("header");
        header.as_bytes_mut().copy_from_slice(&stop_flag.to_ne_bytes());
        let mut body = sampler.create_message_with_size(1000).expect("body");
        body.as_bytes_mut().fill(stop_flag as u8);
        let mut parts = vec![header, body];
        let total = push.send_vec(&mut parts, 1000).expect("send frame");
        assert_eq!(total, 1004);
    }

    let mut first: Vec<Message> = Vec::new();
    pull.receive_vec(&mut first, 1000).expect("receive frame 1");
    assert_eq!(first.len(), 2);
    let flag = u32::from_ne_bytes(first[0].as_bytes().try_into().unwrap());
    assert_eq!(flag, 0);
    assert_eq!(first[1].size(), 1000);

    let mut second: Vec<Message> = Vec::new();
    pull.receive_vec(&mut second, 1000).expect("receive frame 2");
    let flag = u32::from_ne_bytes(second[0].as_bytes().try_into().unwrap());
    assert_eq!(flag, 1);
}

#[test]
fn req_rep_roundtrip_and_state_errors() {
    let session = unique_session("reqrep");
    let endpoint = unique_endpoint("reqrep");

    let server = TransportFactory::new("server", &small_options(&session)).expect("server");
    let client = TransportFactory::new("client", &small_options(&session)).expect("client");

    let mut rep = server.create_socket("rep", "data").expect("rep");
    assert!(rep.bind(&endpoint));
    let mut req = client.create_socket("req", "data").expect("req");
    assert!(req.connect(&endpoint));

    // Receiving before asking is a state error.
    let mut stray = client.create_message();
    assert!(matches!(
        req.receive(&mut stray, 0),
        Err(TransferError::Socket(_))
    ));

    let mut ask = client.create_message_from_bytes(b"ask").expect("ask");
    req.send(&mut ask, 1000).expect("send request");

    // A second request before the reply is a state error.
    let mut early = client.create_message_from_bytes(b"again").expect("again");
    assert!(matches!(
        req.send(&mut early, 0),
        Err(TransferError::Socket(_))
    ));

    let mut question = server.create_message();
    rep.receive(&mut question, 1000).expect("receive request");
    assert_eq!(question.as_bytes(), b"ask");

    let mut answer = server.create_message_from_bytes(b"answer").expect("answer");
    rep.send(&mut answer, 1000).expect("send reply");

    let mut reply = client.create_message();
    req.receive(&mut reply, 1000).expect("receive reply");
    assert_eq!(reply.as_bytes(), b"answer");
}

#[test]
fn timed_receive_returns_timeout() {
    let session = unique_session("timeout");
    let endpoint = unique_endpoint("timeout");

    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");
    let mut pull = factory.create_socket("pull", "data").expect("pull");
    assert!(pull.bind(&endpoint));

    let mut msg = factory.create_message();
    let start = Instant::now();
    assert!(matches!(
        pull.receive(&mut msg, 150),
        Err(TransferError::Timeout)
    ));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(3));

    // Strict non-blocking returns immediately.
    let start = Instant::now();
    assert!(matches!(
        pull.receive(&mut msg, 0),
        Err(TransferError::Timeout)
    ));
    assert!(start.elapsed() < Duration::from_millis(100));
}

// After interrupt(), any blocking transfer returns Interrupted within
// 200 ms.
#[test]
fn interrupt_unblocks_transfers() {
    let session = unique_session("interrupt");
    let endpoint = unique_endpoint("interrupt");

    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");
    let mut pull = factory.create_socket("pull", "data").expect("pull");
    assert!(pull.bind(&endpoint));

    let manager = factory.manager().clone();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        manager.interrupt();
    });

    let mut msg = factory.create_message();
    let start = Instant::now();
    let result = pull.receive(&mut msg, -1);
    assert!(matches!(result, Err(TransferError::Interrupted)));
    assert!(start.elapsed() < Duration::from_millis(300));

    interrupter.join().expect("interrupter");

    // The flag is sticky until resume.
    assert!(matches!(
        pull.receive(&mut msg, -1),
        Err(TransferError::Interrupted)
    ));
    factory.resume();
    assert!(matches!(
        pull.receive(&mut msg, 0),
        Err(TransferError::Timeout)
    ));
}

// A configured minimum metadata message size pads the wire frames but
// changes nothing about the reconstructed messages.
#[test]
fn metadata_padding_is_transparent() {
    let session = unique_session("padding");
    let endpoint = unique_endpoint("padding");

    let mut options = small_options(&session);
    options.metadata_msg_size = 256;
    let sampler = TransportFactory::new("sampler", &options).expect("sampler");
    let sink = TransportFactory::new("sink", &options).expect("sink");

    let mut push = sampler.create_socket("push", "data").expect("push");
    assert!(push.bind(&endpoint));
    let mut pull = sink.create_socket("pull", "data").expect("pull");
    assert!(pull.connect(&endpoint));

    let mut msg = sampler.create_message_from_bytes(b"padded").expect("message");
    assert_eq!(push.send(&mut msg, 1000).expect("send"), 6);

    let mut received = sink.create_message();
    assert_eq!(pull.receive(&mut received, 1000).expect("receive"), 6);
    assert_eq!(received.as_bytes(), b"padded");
}

#[test]
fn close_is_idempotent() {
    let session = unique_session("close");
    let factory = TransportFactory::new("dev", &small_options(&session)).expect("factory");

    let mut socket = factory.create_socket("push", "data").expect("push");
    socket.close();
    socket.close();

    let mut msg = factory.create_message();
    assert!(matches!(
        socket.send(&mut msg, 0),
        Err(TransferError::Socket(_))
    ));
}
