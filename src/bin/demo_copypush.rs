// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Copy-push fan-out: one allocation, many receivers.
//
// Usage:
//   demo_copypush sampler [receivers] [size]
//   demo_copypush sink <index>
//
// The sampler allocates one managed buffer and sends a refcount copy to
// each sink's endpoint; no payload bytes are duplicated. Sinks verify the
// content.

use libfmq::{ShmOptions, TransportFactory};

fn options() -> ShmOptions {
    let session = std::env::var("FMQ_SESSION").unwrap_or_else(|_| "demo".to_string());
    let mut options = ShmOptions::with_session(&session);
    options.segment_size = 100_000_000;
    options
}

fn endpoint(index: usize) -> String {
    format!("ipc:///tmp/fmq_demo_copypush_{index}")
}

fn run_sampler(receivers: usize, size: usize) {
    let factory = TransportFactory::new("sampler", &options()).expect("transport factory");

    let mut sockets = Vec::new();
    for i in 0..receivers {
        let mut socket = factory
            .create_socket("push", &format!("data{i}"))
            .expect("push socket");
        assert!(socket.bind(&endpoint(i)), "bind");
        sockets.push(socket);
    }

    let mut original = factory.create_message_with_size(size).expect("message");
    original.as_bytes_mut().fill(0xab);
    println!(
        "sampler: allocated {size} bytes once, refcount {}",
        original.ref_count()
    );

    for socket in sockets.iter_mut() {
        let mut copy = factory.create_message();
        copy.copy_from(&original).expect("copy");
        socket.send(&mut copy, -1).expect("send");
    }
    println!(
        "sampler: sent {} copies, refcount now {}",
        receivers,
        original.ref_count()
    );

    std::thread::sleep(std::time::Duration::from_millis(500));
}

fn run_sink(index: usize) {
    let factory = TransportFactory::new(&format!("sink{index}"), &options())
        .expect("transport factory");
    let mut socket = factory
        .create_socket("pull", &format!("data{index}"))
        .expect("pull socket");
    assert!(socket.connect(&endpoint(index)), "connect");

    let mut msg = factory.create_message();
    let size = socket.receive(&mut msg, -1).expect("receive");
    let ok = msg.as_bytes().iter().all(|b| *b == 0xab);
    println!("sink {index}: received {size} bytes, content {}", if ok { "ok" } else { "CORRUPT" });
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: demo_copypush sampler [receivers] [size] | sink <index>");
        std::process::exit(1);
    }

    match args[1].as_str() {
        "sampler" => {
            let receivers: usize = args.get(2).map(|s| s.parse().expect("receivers")).unwrap_or(8);
            let size: usize = args
                .get(3)
                .map(|s| s.parse().expect("size"))
                .unwrap_or(1_000_000);
            run_sampler(receivers, size);
        }
        "sink" => {
            let index: usize = args.get(2).map(|s| s.parse().expect("index")).unwrap_or(0);
            run_sink(index);
        }
        other => {
            eprintln!("unknown mode: {other}");
            std::process::exit(1);
        }
    }
}
