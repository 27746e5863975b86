// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Multi-part frames: a small header part carrying a stop flag plus a
// payload part, sent atomically.
//
// Usage:
//   demo_multipart sampler [endpoint] [count]
//   demo_multipart sink    [endpoint]
//
// The sampler sends `count` frames with stopFlag=0 and a final frame with
// stopFlag=1; the sink reads the flag from the first part and exits on it.

use libfmq::{Message, ShmOptions, TransportFactory};

fn options() -> ShmOptions {
    let session = std::env::var("FMQ_SESSION").unwrap_or_else(|_| "demo".to_string());
    let mut options = ShmOptions::with_session(&session);
    options.segment_size = 100_000_000;
    options
}

fn make_frame(factory: &TransportFactory, stop_flag: u32, body_size: usize) -> Vec<Message> {
    let mut header = factory.create_message_with_size(4).expect("header part");
    header
        .as_bytes_mut()
        .copy_from_slice(&stop_flag.to_ne_bytes());
    let mut body = factory.create_message_with_size(body_size).expect("body part");
    body.as_bytes_mut().fill(0x5a);
    vec![header, body]
}

fn run_sampler(endpoint: &str, count: usize) {
    let factory = TransportFactory::new("sampler", &options()).expect("transport factory");
    let mut socket = factory.create_socket("push", "data").expect("push socket");
    assert!(socket.bind(endpoint), "bind {endpoint}");

    for i in 0..count {
        let mut parts = make_frame(&factory, 0, 1000);
        socket.send_vec(&mut parts, -1).expect("send frame");
        println!("sampler: sent frame {i}");
    }
    let mut last = make_frame(&factory, 1, 1000);
    socket.send_vec(&mut last, -1).expect("send stop frame");
    println!("sampler: sent stop frame");

    std::thread::sleep(std::time::Duration::from_millis(500));
}

fn run_sink(endpoint: &str) {
    let factory = TransportFactory::new("sink", &options()).expect("transport factory");
    let mut socket = factory.create_socket("pull", "data").expect("pull socket");
    assert!(socket.connect(endpoint), "connect {endpoint}");

    let mut frames = 0usize;
    loop {
        let mut parts: Vec<Message> = Vec::new();
        socket.receive_vec(&mut parts, -1).expect("receive frame");
        assert_eq!(parts.len(), 2, "expected a two-part frame");

        let flag = u32::from_ne_bytes(parts[0].as_bytes().try_into().expect("4-byte header"));
        println!(
            "sink: frame {frames}: stopFlag {flag}, body {} bytes",
            parts[1].size()
        );
        if flag == 1 {
            break;
        }
        frames += 1;
    }
    println!("sink: stop flag received after {frames} data frames");
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: demo_multipart sampler|sink [endpoint] [count]");
        std::process::exit(1);
    }
    let endpoint = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| "ipc:///tmp/fmq_demo_multipart".to_string());

    match args[1].as_str() {
        "sampler" => {
            let count: usize = args.get(3).map(|s| s.parse().expect("count")).unwrap_or(5);
            run_sampler(&endpoint, count);
        }
        "sink" => run_sink(&endpoint),
        other => {
            eprintln!("unknown mode: {other}");
            std::process::exit(1);
        }
    }
}
