// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bounded inter-process message queue in shared memory. Fixed capacity,
// fixed maximum message size; a ring of length-prefixed slots guarded by a
// process-shared mutex with a not-empty condition variable.
// Carries region ack bunches and the device->monitor control traffic.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::platform::posix::{
    init_shared_cond, init_shared_mutex, shared_cond_signal, shared_cond_timedwait,
    shared_mutex_lock, shared_mutex_unlock,
};
use crate::platform::{MapMode, ShmMapping};

const QUEUE_MAGIC: u64 = 0x464d_515f_5155_4521; // "FMQ_QUE!"

#[repr(C)]
struct QueueLayout {
    magic: AtomicU64,
    capacity: u64,
    msg_size: u64,
    count: u64,
    head: u64,
    tail: u64,
    mutex: libc::pthread_mutex_t,
    not_empty: libc::pthread_cond_t,
}

/// A bounded interprocess queue of byte messages up to `msg_size` each.
pub struct BlockQueue {
    mapping: ShmMapping,
    name: String,
    capacity: usize,
    msg_size: usize,
}

unsafe impl Send for BlockQueue {}
unsafe impl Sync for BlockQueue {}

fn slot_stride(msg_size: usize) -> usize {
    8 + (msg_size + 7) / 8 * 8
}

fn data_offset() -> usize {
    let hdr = std::mem::size_of::<QueueLayout>();
    (hdr + 7) / 8 * 8
}

impl BlockQueue {
    /// Open or create a named queue of `capacity` messages of up to
    /// `msg_size` bytes each.
    pub fn open_or_create(name: &str, capacity: usize, msg_size: usize) -> io::Result<Self> {
        let total = data_offset() + capacity * slot_stride(msg_size);
        let (mapping, created) = ShmMapping::acquire(name, total, MapMode::CreateOrOpen)?;
        let layout = mapping.as_ptr() as *mut QueueLayout;

        if created {
            unsafe {
                ptr::addr_of_mut!((*layout).capacity).write(capacity as u64);
                ptr::addr_of_mut!((*layout).msg_size).write(msg_size as u64);
                ptr::addr_of_mut!((*layout).count).write(0);
                ptr::addr_of_mut!((*layout).head).write(0);
                ptr::addr_of_mut!((*layout).tail).write(0);
                init_shared_mutex(ptr::addr_of_mut!((*layout).mutex))?;
                init_shared_cond(ptr::addr_of_mut!((*layout).not_empty))?;
                (*layout).magic.store(QUEUE_MAGIC, Ordering::Release);
            }
        } else {
            let deadline = Instant::now() + Duration::from_secs(10);
            while unsafe { &(*layout).magic }.load(Ordering::Acquire) != QUEUE_MAGIC {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("queue {name} never became initialized"),
                    ));
                }
                std::thread::yield_now();
            }
        }

        let (capacity, msg_size) = unsafe {
            (
                ptr::addr_of!((*layout).capacity).read() as usize,
                ptr::addr_of!((*layout).msg_size).read() as usize,
            )
        };

        Ok(Self {
            mapping,
            name: name.to_string(),
            capacity,
            msg_size,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn msg_size(&self) -> usize {
        self.msg_size
    }

    fn layout(&self) -> *mut QueueLayout {
        self.mapping.as_ptr() as *mut QueueLayout
    }

    fn slot_ptr(&self, idx: u64) -> *mut u8 {
        unsafe {
            self.mapping
                .as_ptr()
                .add(data_offset() + idx as usize * slot_stride(self.msg_size))
        }
    }

    /// Push one message without blocking. Returns `false` when the queue is
    /// full.
    pub fn try_send(&self, data: &[u8]) -> bool {
        if data.len() > self.msg_size {
            return false;
        }
        let layout = self.layout();
        unsafe {
            if shared_mutex_lock(ptr::addr_of_mut!((*layout).mutex)).is_err() {
                return false;
            }
            let count = ptr::addr_of!((*layout).count).read();
            if count >= self.capacity as u64 {
                let _ = shared_mutex_unlock(ptr::addr_of_mut!((*layout).mutex));
                return false;
            }
            let tail = ptr::addr_of!((*layout).tail).read();
            let slot = self.slot_ptr(tail);
            (slot as *mut u64).write(data.len() as u64);
            ptr::copy_nonoverlapping(data.as_ptr(), slot.add(8), data.len());
            ptr::addr_of_mut!((*layout).tail).write((tail + 1) % self.capacity as u64);
            ptr::addr_of_mut!((*layout).count).write(count + 1);
            shared_cond_signal(ptr::addr_of_mut!((*layout).not_empty));
            let _ = shared_mutex_unlock(ptr::addr_of_mut!((*layout).mutex));
        }
        true
    }

    /// Pop one message into `buf`, waiting up to `timeout_ms`. Returns the
    /// message length, or `None` on timeout.
    pub fn timed_receive(&self, buf: &mut [u8], timeout_ms: u64) -> Option<usize> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let layout = self.layout();
        unsafe {
            if shared_mutex_lock(ptr::addr_of_mut!((*layout).mutex)).is_err() {
                return None;
            }
            loop {
                let count = ptr::addr_of!((*layout).count).read();
                if count > 0 {
                    let head = ptr::addr_of!((*layout).head).read();
                    let slot = self.slot_ptr(head);
                    let len = (slot as *const u64).read() as usize;
                    let n = len.min(buf.len());
                    ptr::copy_nonoverlapping(slot.add(8), buf.as_mut_ptr(), n);
                    ptr::addr_of_mut!((*layout).head).write((head + 1) % self.capacity as u64);
                    ptr::addr_of_mut!((*layout).count).write(count - 1);
                    let _ = shared_mutex_unlock(ptr::addr_of_mut!((*layout).mutex));
                    return Some(n);
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    let _ = shared_mutex_unlock(ptr::addr_of_mut!((*layout).mutex));
                    return None;
                }
                match shared_cond_timedwait(
                    ptr::addr_of_mut!((*layout).not_empty),
                    ptr::addr_of_mut!((*layout).mutex),
                    remaining.as_millis() as u64 + 1,
                ) {
                    Ok(_) => {}
                    Err(_) => {
                        let _ = shared_mutex_unlock(ptr::addr_of_mut!((*layout).mutex));
                        return None;
                    }
                }
            }
        }
    }

    /// Number of messages currently queued.
    pub fn num_msg(&self) -> usize {
        let layout = self.layout();
        unsafe {
            if shared_mutex_lock(ptr::addr_of_mut!((*layout).mutex)).is_err() {
                return 0;
            }
            let count = ptr::addr_of!((*layout).count).read();
            let _ = shared_mutex_unlock(ptr::addr_of_mut!((*layout).mutex));
            count as usize
        }
    }

    /// Remove a named queue object. Returns `true` if one was removed.
    pub fn remove(name: &str) -> bool {
        ShmMapping::unlink(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique_name(prefix: &str) -> String {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_q_{}_{n}", std::process::id())
    }

    #[test]
    fn send_then_receive() {
        let name = unique_name("bq_basic");
        ShmMapping::unlink(&name);

        let q = BlockQueue::open_or_create(&name, 4, 64).expect("open queue");
        assert!(q.try_send(b"hello"));
        assert_eq!(q.num_msg(), 1);

        let mut buf = [0u8; 64];
        let n = q.timed_receive(&mut buf, 100).expect("receive");
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(q.num_msg(), 0);

        ShmMapping::unlink(&name);
    }

    #[test]
    fn full_queue_rejects() {
        let name = unique_name("bq_full");
        ShmMapping::unlink(&name);

        let q = BlockQueue::open_or_create(&name, 2, 16).expect("open queue");
        assert!(q.try_send(b"a"));
        assert!(q.try_send(b"b"));
        assert!(!q.try_send(b"c"));

        ShmMapping::unlink(&name);
    }

    #[test]
    fn receive_times_out_when_empty() {
        let name = unique_name("bq_timeout");
        ShmMapping::unlink(&name);

        let q = BlockQueue::open_or_create(&name, 2, 16).expect("open queue");
        let mut buf = [0u8; 16];
        let start = Instant::now();
        assert!(q.timed_receive(&mut buf, 50).is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));

        ShmMapping::unlink(&name);
    }
}
