// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Unmanaged region: a separately mapped, user-owned buffer pool shared
// across processes. The process that created the region is its controller
// and receives release notifications for every buffer through a bounded
// ack queue; any other process opens the region as a viewer and sends
// those notifications when its messages are destroyed.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::common::{
    RegionBlock, RegionBlockRef, RegionBulkCallback, RegionCallback, ACK_BUNCH_SIZE,
    ACK_QUEUE_CAPACITY,
};
use crate::config::RegionConfig;
use crate::errors::{Error, Result};
use crate::platform::posix::{init_shared_mutex, shared_mutex_lock, shared_mutex_unlock};
use crate::platform::{MapMode, ShmMapping};
use crate::queue::BlockQueue;
use crate::shm_id::shm_name_id;

// ---------------------------------------------------------------------------
// RefCountPool — auxiliary segment allocating shared refcount objects for
// region buffers that end up with multiple in-process owners.
// ---------------------------------------------------------------------------

const RC_MAGIC: u64 = 0x464d_515f_5252_4321; // "FMQ_RRC!"
const RC_SLOT_SIZE: u64 = 8;

#[repr(C)]
struct RcLayout {
    magic: AtomicU64,
    free_head: u64,
    next_unused: u64,
    end: u64,
    mutex: libc::pthread_mutex_t,
}

pub(crate) struct RefCountPool {
    mapping: ShmMapping,
}

unsafe impl Send for RefCountPool {}
unsafe impl Sync for RefCountPool {}

impl RefCountPool {
    fn open_or_create(name: &str, size: u64) -> io::Result<Self> {
        let (mapping, created) = ShmMapping::acquire(name, size as usize, MapMode::CreateOrOpen)?;
        let layout = mapping.as_ptr() as *mut RcLayout;
        if created {
            unsafe {
                let start = (std::mem::size_of::<RcLayout>() as u64 + 7) / 8 * 8;
                ptr::addr_of_mut!((*layout).free_head).write(0);
                ptr::addr_of_mut!((*layout).next_unused).write(start);
                ptr::addr_of_mut!((*layout).end).write(mapping.size() as u64);
                init_shared_mutex(ptr::addr_of_mut!((*layout).mutex))?;
                (*layout).magic.store(RC_MAGIC, Ordering::Release);
            }
            trace!("initialized ref count segment {name}");
        } else {
            let deadline = Instant::now() + Duration::from_secs(10);
            while unsafe { &(*layout).magic }.load(Ordering::Acquire) != RC_MAGIC {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("ref count segment {name} never became initialized"),
                    ));
                }
                thread::yield_now();
            }
        }
        Ok(Self { mapping })
    }

    fn layout(&self) -> *mut RcLayout {
        self.mapping.as_ptr() as *mut RcLayout
    }

    /// Allocate one refcount slot initialized to `initial`. Returns the
    /// slot handle, or `None` when the pool is exhausted.
    fn alloc(&self, initial: u16) -> Option<i64> {
        let layout = self.layout();
        let base = self.mapping.as_ptr();
        unsafe {
            shared_mutex_lock(ptr::addr_of_mut!((*layout).mutex)).ok()?;
            let off = {
                let free = ptr::addr_of!((*layout).free_head).read();
                if free != 0 {
                    let next = (base.add(free as usize) as *const u64).read();
                    ptr::addr_of_mut!((*layout).free_head).write(next);
                    free
                } else {
                    let next = ptr::addr_of!((*layout).next_unused).read();
                    if next + RC_SLOT_SIZE > ptr::addr_of!((*layout).end).read() {
                        let _ = shared_mutex_unlock(ptr::addr_of_mut!((*layout).mutex));
                        return None;
                    }
                    ptr::addr_of_mut!((*layout).next_unused).write(next + RC_SLOT_SIZE);
                    next
                }
            };
            (base.add(off as usize) as *mut u64).write(0);
            (*(base.add(off as usize) as *const AtomicU16)).store(initial, Ordering::Release);
            let _ = shared_mutex_unlock(ptr::addr_of_mut!((*layout).mutex));
            Some(off as i64)
        }
    }

    fn free(&self, handle: i64) {
        let layout = self.layout();
        let base = self.mapping.as_ptr();
        unsafe {
            if shared_mutex_lock(ptr::addr_of_mut!((*layout).mutex)).is_err() {
                return;
            }
            let free = ptr::addr_of!((*layout).free_head).read();
            (base.add(handle as usize) as *mut u64).write(free);
            ptr::addr_of_mut!((*layout).free_head).write(handle as u64);
            let _ = shared_mutex_unlock(ptr::addr_of_mut!((*layout).mutex));
        }
    }

    fn counter(&self, handle: i64) -> &AtomicU16 {
        unsafe { &*(self.mapping.as_ptr().add(handle as usize) as *const AtomicU16) }
    }
}

// ---------------------------------------------------------------------------
// Ack machinery shared with the sender/receiver threads.
// ---------------------------------------------------------------------------

struct Callbacks {
    single: Option<RegionCallback>,
    bulk: Option<RegionBulkCallback>,
}

struct AckShared {
    stop: AtomicBool,
    linger_ms: AtomicU32,
    pending: Mutex<Vec<RegionBlock>>,
    pending_cv: Condvar,
    queue: BlockQueue,
    callbacks: Mutex<Callbacks>,
    region_base: usize,
    region_name: String,
}

fn run_ack_sender(shared: Arc<AckShared>) {
    let wire = RegionBlock::WIRE_SIZE;
    let mut bunch = vec![0u8; ACK_BUNCH_SIZE * wire];
    let mut stop_deadline: Option<Instant> = None;

    loop {
        let stopping = shared.stop.load(Ordering::Acquire);
        if stopping && stop_deadline.is_none() {
            stop_deadline = Some(
                Instant::now()
                    + Duration::from_millis(shared.linger_ms.load(Ordering::Relaxed) as u64),
            );
        }

        let blocks: Vec<RegionBlock> = {
            let mut pending = shared.pending.lock().unwrap();
            // Try to gather a full bunch before sending.
            if pending.len() < ACK_BUNCH_SIZE && !stopping {
                let (guard, _) = shared
                    .pending_cv
                    .wait_timeout(pending, Duration::from_millis(500))
                    .unwrap();
                pending = guard;
            }
            let n = pending.len().min(ACK_BUNCH_SIZE);
            let at = pending.len() - n;
            pending.split_off(at)
        };

        if blocks.is_empty() {
            if shared.stop.load(Ordering::Acquire) {
                break;
            }
            continue;
        }

        for (i, block) in blocks.iter().enumerate() {
            block.write_to(&mut bunch[i * wire..(i + 1) * wire]);
        }
        let payload = &bunch[..blocks.len() * wire];

        loop {
            if shared.queue.try_send(payload) {
                break;
            }
            // Receiver slow? Yield and try again, up to the linger window
            // once shutdown has started.
            if let Some(deadline) = stop_deadline {
                if Instant::now() >= deadline {
                    warn!(
                        "ack sender for {} dropping {} unsent blocks after linger",
                        shared.region_name,
                        blocks.len()
                    );
                    return;
                }
            } else if shared.stop.load(Ordering::Acquire) {
                stop_deadline = Some(
                    Instant::now()
                        + Duration::from_millis(shared.linger_ms.load(Ordering::Relaxed) as u64),
                );
            }
            thread::yield_now();
        }
    }

    trace!("ack sender for {} leaving", shared.region_name);
}

fn run_ack_receiver(shared: Arc<AckShared>) {
    let wire = RegionBlock::WIRE_SIZE;
    let mut buf = vec![0u8; ACK_BUNCH_SIZE * wire];
    let mut refs: Vec<RegionBlockRef> = Vec::with_capacity(ACK_BUNCH_SIZE);

    loop {
        let leave = shared.stop.load(Ordering::Acquire);
        let timeout = if leave {
            shared.linger_ms.load(Ordering::Relaxed) as u64
        } else {
            100
        };

        while let Some(n) = shared.queue.timed_receive(&mut buf, timeout) {
            let num_blocks = n / wire;
            let callbacks = shared.callbacks.lock().unwrap();
            if let Some(bulk) = &callbacks.bulk {
                refs.clear();
                for i in 0..num_blocks {
                    let block = RegionBlock::read_from(&buf[i * wire..(i + 1) * wire]);
                    refs.push(RegionBlockRef {
                        ptr: (shared.region_base + block.handle as usize) as *mut u8,
                        size: block.size,
                        hint: block.hint,
                    });
                }
                bulk(&refs);
            } else if let Some(single) = &callbacks.single {
                for i in 0..num_blocks {
                    let block = RegionBlock::read_from(&buf[i * wire..(i + 1) * wire]);
                    single(&RegionBlockRef {
                        ptr: (shared.region_base + block.handle as usize) as *mut u8,
                        size: block.size,
                        hint: block.hint,
                    });
                }
            }
        }

        if leave {
            break;
        }
    }

    trace!(
        "ack receiver for {} leaving (remaining queue size: {})",
        shared.region_name,
        shared.queue.num_msg()
    );
}

// ---------------------------------------------------------------------------
// UnmanagedRegion
// ---------------------------------------------------------------------------

/// A user-controlled buffer pool mapped into this process, either as the
/// controller (creator, receives acks) or as a viewer.
pub struct UnmanagedRegion {
    id: u16,
    controlling: AtomicBool,
    remove_on_destruction: AtomicBool,
    created: bool,
    name: String,
    queue_name: String,
    rc_segment_name: String,
    mapping: ShmMapping,
    rc_pool: Option<RefCountPool>,
    acks: Arc<AckShared>,
    sender: Mutex<Option<JoinHandle<()>>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UnmanagedRegion {
    pub(crate) fn new(
        shm_id: &str,
        size: u64,
        controlling: bool,
        cfg: &RegionConfig,
    ) -> Result<Self> {
        let id = cfg
            .id
            .ok_or_else(|| Error::Transport("region config carries no id".to_string()))?;
        let name = shm_name_id(shm_id, "rg", id);
        let queue_name = shm_name_id(shm_id, "rgq", id);
        let rc_segment_name = shm_name_id(shm_id, "rrc", id);

        debug!(
            "UnmanagedRegion(): {name} ({})",
            if controlling { "controller" } else { "viewer" }
        );

        let (mapping, created) = if let Some(dir) = &cfg.path {
            let path = dir.join(&name);
            ShmMapping::acquire_file(&path, size as usize, controlling, cfg.creation_flags)
                .map_err(|e| {
                    Error::Transport(format!(
                        "failed to initialize file for shared memory region {}: {e}",
                        path.display()
                    ))
                })?
        } else {
            // Open first; only the controller may create.
            match ShmMapping::acquire_with_flags(&name, 0, MapMode::Open, cfg.creation_flags) {
                Ok(r) => r,
                Err(e) if controlling => {
                    debug!("could not open shared memory object for region {id} ({e}), creating");
                    ShmMapping::acquire_with_flags(
                        &name,
                        size as usize,
                        MapMode::Create,
                        cfg.creation_flags,
                    )
                    .map_err(|e| {
                        Error::Transport(format!(
                            "failed creating shared memory object for region {id}: {e}"
                        ))
                    })?
                }
                Err(e) => {
                    return Err(Error::Transport(format!(
                        "could not open view for shared memory object for region {id}: {e}"
                    )));
                }
            }
        };

        if size != 0 && mapping.size() as u64 != size {
            return Err(Error::Transport(format!(
                "created/opened region size ({}) does not match configured size ({size})",
                mapping.size()
            )));
        }

        if cfg.lock_memory {
            debug!("locking region {id}...");
            mapping
                .mlock_pages()
                .map_err(|e| Error::Transport(format!("could not lock region {name}: {e}")))?;
        }
        if cfg.zero_memory {
            debug!("zeroing region {id}...");
            mapping.zero();
        }

        let rc_pool = if cfg.rc_segment_size > 0 {
            Some(
                RefCountPool::open_or_create(&rc_segment_name, cfg.rc_segment_size).map_err(
                    |e| Error::Transport(format!("failed opening refcount segment: {e}")),
                )?,
            )
        } else {
            None
        };

        let queue = BlockQueue::open_or_create(
            &queue_name,
            ACK_QUEUE_CAPACITY,
            ACK_BUNCH_SIZE * RegionBlock::WIRE_SIZE,
        )
        .map_err(|e| Error::Transport(format!("failed opening region ack queue: {e}")))?;
        trace!("initialized region queue {queue_name}");

        let acks = Arc::new(AckShared {
            stop: AtomicBool::new(false),
            linger_ms: AtomicU32::new(cfg.linger_ms),
            pending: Mutex::new(Vec::new()),
            pending_cv: Condvar::new(),
            queue,
            callbacks: Mutex::new(Callbacks {
                single: None,
                bulk: None,
            }),
            region_base: mapping.as_ptr() as usize,
            region_name: name.clone(),
        });

        debug!(
            "{} unmanaged shared memory region {name} ({}), size {}",
            if created { "created" } else { "opened" },
            if controlling { "controller" } else { "viewer" },
            mapping.size()
        );

        Ok(Self {
            id,
            controlling: AtomicBool::new(controlling),
            remove_on_destruction: AtomicBool::new(cfg.remove_on_destruction),
            created,
            name,
            queue_name,
            rc_segment_name,
            mapping,
            rc_pool,
            acks,
            sender: Mutex::new(None),
            receiver: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Local base address of the region.
    pub fn data(&self) -> *mut u8 {
        self.mapping.as_ptr()
    }

    pub fn size(&self) -> u64 {
        self.mapping.size() as u64
    }

    pub fn set_linger(&self, linger_ms: u32) {
        self.acks.linger_ms.store(linger_ms, Ordering::Relaxed);
    }

    pub fn linger(&self) -> u32 {
        self.acks.linger_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn created(&self) -> bool {
        self.created
    }

    pub(crate) fn is_controlling(&self) -> bool {
        self.controlling.load(Ordering::Acquire)
    }

    pub(crate) fn remove_on_destruction(&self) -> bool {
        self.remove_on_destruction.load(Ordering::Acquire)
    }

    /// Upgrade a view into the controller role in place.
    pub(crate) fn become_controller(&self, cfg: &RegionConfig) {
        debug!("unmanaged region (view) {} promoting to controller", self.name);
        self.controlling.store(true, Ordering::Release);
        self.remove_on_destruction
            .store(cfg.remove_on_destruction, Ordering::Release);
        self.acks.linger_ms.store(cfg.linger_ms, Ordering::Relaxed);
    }

    pub(crate) fn set_callbacks(
        &self,
        callback: Option<RegionCallback>,
        bulk_callback: Option<RegionBulkCallback>,
    ) {
        let mut callbacks = self.acks.callbacks.lock().unwrap();
        callbacks.single = callback;
        callbacks.bulk = bulk_callback;
    }

    pub(crate) fn start_ack_sender(&self) {
        let mut sender = self.sender.lock().unwrap();
        if sender.is_none() {
            let shared = Arc::clone(&self.acks);
            *sender = Some(thread::spawn(move || run_ack_sender(shared)));
        }
    }

    pub(crate) fn start_ack_receiver(&self) {
        let mut receiver = self.receiver.lock().unwrap();
        if receiver.is_none() {
            let shared = Arc::clone(&self.acks);
            *receiver = Some(thread::spawn(move || run_ack_receiver(shared)));
        }
    }

    /// Queue a release notification produced by a destroyed region message.
    pub(crate) fn release_block(&self, block: RegionBlock) {
        let mut pending = self.acks.pending.lock().unwrap();
        pending.push(block);
        let full = pending.len() >= ACK_BUNCH_SIZE;
        drop(pending);
        if full {
            self.acks.pending_cv.notify_one();
        }
    }

    /// Stop and join the ack threads, draining for up to the linger window.
    pub(crate) fn stop_acks(&self) {
        self.acks.stop.store(true, Ordering::Release);
        self.acks.pending_cv.notify_one();
        if let Some(handle) = self.sender.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.receiver.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    // --- shared refcount objects -----------------------------------------

    /// Allocate a shared refcount initialized to `initial`; returns its
    /// handle in the refcount segment.
    pub(crate) fn make_ref_count(&self, initial: u16) -> Result<i64> {
        let pool = self.rc_pool.as_ref().ok_or_else(|| {
            Error::Transport(format!("region {} has no refcount segment", self.id))
        })?;
        pool.alloc(initial)
            .ok_or_else(|| Error::Transport(format!("refcount segment of region {} is full", self.id)))
    }

    pub(crate) fn ref_count(&self, handle: i64) -> u16 {
        match &self.rc_pool {
            Some(pool) => pool.counter(handle).load(Ordering::Acquire),
            None => 1,
        }
    }

    pub(crate) fn increment_ref_count(&self, handle: i64) {
        if let Some(pool) = &self.rc_pool {
            pool.counter(handle).fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Decrement and return the previous count.
    pub(crate) fn decrement_ref_count(&self, handle: i64) -> u16 {
        match &self.rc_pool {
            Some(pool) => pool.counter(handle).fetch_sub(1, Ordering::AcqRel),
            None => 1,
        }
    }

    pub(crate) fn remove_ref_count(&self, handle: i64) {
        if let Some(pool) = &self.rc_pool {
            pool.free(handle);
        }
    }
}

impl Drop for UnmanagedRegion {
    fn drop(&mut self) {
        debug!(
            "~UnmanagedRegion(): {} ({})",
            self.name,
            if self.is_controlling() {
                "controller"
            } else {
                "viewer"
            }
        );
        self.stop_acks();

        if self.is_controlling() {
            if self.remove_on_destruction() {
                if ShmMapping::unlink(&self.name) {
                    trace!("region {} destroyed", self.name);
                }
                if let Some(path) = self.mapping.file_path() {
                    if ShmMapping::remove_file(path) {
                        trace!("file mapping {} destroyed", path.display());
                    }
                }
                if self.rc_pool.is_some() && ShmMapping::unlink(&self.rc_segment_name) {
                    trace!("ref count segment {} destroyed", self.rc_segment_name);
                }
            } else {
                debug!(
                    "skipping removal of {} unmanaged region, removal on destruction is disabled",
                    self.name
                );
            }

            if BlockQueue::remove(&self.queue_name) {
                trace!("region queue {} destroyed", self.queue_name);
            }
        }
    }
}

impl std::fmt::Debug for UnmanagedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnmanagedRegion")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.mapping.size())
            .field("controlling", &self.is_controlling())
            .finish()
    }
}

// Raw region pointers are shared across threads through the manager's
// region map; all mutable shared state is behind locks or atomics.
unsafe impl Send for UnmanagedRegion {}
unsafe impl Sync for UnmanagedRegion {}
