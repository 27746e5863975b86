// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Unmanaged-region sampler/sink: user-owned buffers with release acks.
//
// Usage:
//   demo_region sampler [endpoint] [count]
//   demo_region sink    [endpoint] [count]
//
// The sampler creates a 10 MB region, writes `count` 2 MB blocks and
// sends them as region messages. The sink receives and drops each; the
// sampler's bulk callback reports the released blocks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use libfmq::{RegionConfig, ShmOptions, TransportFactory};

const BLOCK_SIZE: usize = 2_000_000;
const REGION_SIZE: u64 = 10_000_000;

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

    let acked = Arc::new(AtomicUsize::new(0));
    let acked_cb = Arc::clone(&acked);
    let region = factory
        .create_unmanaged_region(
            REGION_SIZE,
            None,
            Some(Box::new(move |blocks| {
                for block in blocks {
                    println!(
                        "sampler: block released: size {}, hint {}",
                        block.size, block.hint
                    );
                }
                acked_cb.fetch_add(blocks.len(), Ordering::AcqRel);
            })),
            RegionConfig::default(),
        )
        .expect("unmanaged region");

    for i in 0..count {
        let offset = i * BLOCK_SIZE;
        let data = unsafe { region.data().add(offset) };
        unsafe { std::ptr::write_bytes(data, i as u8, BLOCK_SIZE) };

        let mut msg = factory
            .create_message_in_region(&region, data, BLOCK_SIZE, i as u64)
            .expect("region message");
        socket.send(&mut msg, -1).expect("send");
        println!("sampler: sent block {i} at offset {offset}");
    }

    while acked.load(Ordering::Acquire) < count {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    println!("sampler: all {count} blocks acknowledged");
}

fn run_sink(endpoint: &str, count: usize) {
    let factory = TransportFactory::new("sink", &options()).expect("transport factory");
    let mut socket = factory.create_socket("pull", "data").expect("pull socket");
    assert!(socket.connect(endpoint), "connect {endpoint}");

    for i in 0..count {
        let mut msg = factory.create_message();
        let size = socket.receive(&mut msg, -1).expect("receive");
        let first = msg.as_bytes().first().copied().unwrap_or(0);
        println!("sink: received block {i} ({size} bytes, fill {first})");
        // Dropping the message enqueues the release ack.
    }
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: demo_region sampler|sink [endpoint] [count]");
        std::process::exit(1);
    }
    let endpoint = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| "ipc:///tmp/fmq_demo_region".to_string());
    let count: usize = args.get(3).map(|s| s.parse().expect("count")).unwrap_or(5);

    match args[1].as_str() {
        "sampler" => run_sampler(&endpoint, count),
        "sink" => run_sink(&endpoint, count),
        other => {
            eprintln!("unknown mode: {other}");
            std::process::exit(1);
        }
    }
}
