// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Minimal sampler/sink pair over the shared memory transport.
//
// Usage:
//   demo_sampler_sink sampler [endpoint] [count]
//   demo_sampler_sink sink    [endpoint] [count]
//
// The sampler pushes managed messages containing "Hello" on channel
// "data"; the sink pulls and prints them. Run both with the same session
// (environment FMQ_SESSION, default "demo").

use libfmq::{ShmOptions, TransportFactory};

fn options() -> ShmOptions {
    let session = std::env::var("FMQ_SESSION").unwrap_or_else(|_| "demo".to_string());
    let mut options = ShmOptions::with_session(&session);
    options.segment_size = 100_000_000;
    options
}

fn run_sampler(endpoint: &str, count: usize) {
    let factory = TransportFactory::new("sampler", &options()).expect("transport factory");
    let mut socket = factory.create_socket("push", "data").expect("push socket");
    assert!(socket.bind(endpoint), "bind {endpoint}");

    for i in 0..count {
        let mut msg = factory
            .create_message_from_bytes(b"Hello")
            .expect("message");
        match socket.send(&mut msg, -1) {
            Ok(sent) => println!("sampler: sent message {i} ({sent} bytes)"),
            Err(e) => {
                eprintln!("sampler: send failed: {e}");
                break;
            }
        }
    }

    // Give the sink time to drain before the factory tears down.
    std::thread::sleep(std::time::Duration::from_millis(500));
}

fn run_sink(endpoint: &str, count: usize) {
    let factory = TransportFactory::new("sink", &options()).expect("transport factory");
    let mut socket = factory.create_socket("pull", "data").expect("pull socket");
    assert!(socket.connect(endpoint), "connect {endpoint}");

    for i in 0..count {
        let mut msg = factory.create_message();
        match socket.receive(&mut msg, -1) {
            Ok(size) => {
                let body = String::from_utf8_lossy(msg.as_bytes()).into_owned();
                println!("sink: received message {i} ({size} bytes): {body}");
            }
            Err(e) => {
                eprintln!("sink: receive failed: {e}");
                break;
            }
        }
    }
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: demo_sampler_sink sampler|sink [endpoint] [count]");
        std::process::exit(1);
    }
    let endpoint = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| "ipc:///tmp/fmq_demo_data".to_string());
    let count: usize = args.get(3).map(|s| s.parse().expect("count")).unwrap_or(10);

    match args[1].as_str() {
        "sampler" => run_sampler(&endpoint, count),
        "sink" => run_sink(&endpoint, count),
        other => {
            eprintln!("unknown mode: {other}");
            std::process::exit(1);
        }
    }
}
