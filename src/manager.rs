// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The manager is the root object of the shared memory transport: it owns
// the management segment attachment, the managed segment map, the
// unmanaged region map, the interrupt flag, and the background workers
// (heartbeat, region events). Messages and sockets borrow capabilities
// from it: allocate/resolve/deallocate, region lookup, interruption.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, trace, warn};

use crate::common::{
    AllocationAlgorithm, RegionBulkCallback, RegionCallback, RegionEvent, RegionEventCallback,
    RegionInfo, HEARTBEAT_PERIOD_MS,
};
use crate::config::{RegionConfig, ShmOptions};
use crate::errors::{Error, Result};
use crate::management::{ManagementSegment, RegionRecord};
use crate::monitor;
use crate::platform::NamedMutex;
use crate::queue::BlockQueue;
use crate::region::UnmanagedRegion;
use crate::segment::{ManagedSegment, ShmHeader};
use crate::shm_id::{
    build_shm_id_from_session_and_uid, build_shm_id_u64, effective_uid, shm_name, shm_name_id,
};

const REGION_EVENTS_POLL_MS: u64 = 50;

struct HeartbeatShared {
    stop: Mutex<bool>,
    cv: Condvar,
    heartbeat_addr: usize,
    control_queue_name: String,
    device_id: String,
}

fn run_heartbeats(shared: Arc<HeartbeatShared>) {
    let counter = unsafe { &*(shared.heartbeat_addr as *const AtomicU64) };
    let control_queue = BlockQueue::open_or_create(&shared.control_queue_name, 256, 64).ok();

    let mut stop = shared.stop.lock().unwrap();
    while !*stop {
        counter.fetch_add(1, Ordering::AcqRel);
        if let Some(queue) = &control_queue {
            queue.try_send(shared.device_id.as_bytes());
        }
        let (guard, _) = shared
            .cv
            .wait_timeout(stop, Duration::from_millis(HEARTBEAT_PERIOD_MS))
            .unwrap();
        stop = guard;
    }
}

struct RegionEventsState {
    active: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

fn run_region_events(
    manager: Weak<Manager>,
    active: Arc<AtomicBool>,
    callback: RegionEventCallback,
) {
    let mut observed: HashMap<(u16, bool), RegionEvent> = HashMap::new();
    let mut num_observed_events: u64 = 0;

    while active.load(Ordering::Acquire) {
        let Some(manager) = manager.upgrade() else {
            break;
        };

        if num_observed_events != manager.mgmt.event_count() {
            let infos = manager.get_region_info();
            for info in &infos {
                use std::collections::hash_map::Entry;
                match observed.entry((info.id, info.managed)) {
                    Entry::Vacant(entry) => {
                        entry.insert(info.event);
                        // A region created and destroyed rapidly is seen as
                        // 'destroyed' without ever showing 'created'.
                        if info.event == RegionEvent::Created {
                            callback(info);
                            num_observed_events += 1;
                        } else {
                            num_observed_events += 2;
                        }
                    }
                    Entry::Occupied(mut entry) => {
                        if *entry.get() == RegionEvent::Created
                            && info.event == RegionEvent::Destroyed
                        {
                            callback(info);
                            entry.insert(info.event);
                            num_observed_events += 1;
                        }
                    }
                }
            }
        }
        drop(manager);

        thread::sleep(Duration::from_millis(REGION_EVENTS_POLL_MS));
    }
}

thread_local! {
    static REGION_CACHE: RefCell<Vec<(u16, u64, u64, Weak<UnmanagedRegion>)>> =
        const { RefCell::new(Vec::new()) };
}

/// Root object of one factory's attachment to a session.
pub struct Manager {
    shm_id64: u64,
    shm_id: String,
    device_id: String,
    segment_id: u16,
    mgmt: ManagementSegment,
    session_mtx: NamedMutex,

    bad_alloc_max_attempts: i32,
    bad_alloc_interval_ms: u64,
    no_cleanup: bool,
    metadata_msg_size: usize,

    segments: Mutex<HashMap<u16, ManagedSegment>>,
    regions: Mutex<HashMap<u16, Arc<UnmanagedRegion>>>,
    regions_gen: AtomicU64,

    interrupted: AtomicBool,
    msg_counter_new: AtomicU64,
    msg_counter_del: AtomicU64,

    heartbeat_shared: Arc<HeartbeatShared>,
    heartbeat_thread: Mutex<Option<JoinHandle<()>>>,
    region_events: Mutex<RegionEventsState>,

    shutdown_done: AtomicBool,
}

impl Manager {
    /// Attach to (or create) the session named in `options`. Side effects
    /// in order: derive the shm id, open the management segment, register
    /// this device, optionally launch the monitor, open the managed
    /// segment, start the heartbeat thread.
    pub fn new(device_id: &str, options: &ShmOptions) -> Result<Arc<Self>> {
        let uid = effective_uid();
        let shm_id = build_shm_id_from_session_and_uid(&options.session, uid);
        let shm_id64 = build_shm_id_u64(&options.session, uid);
        debug!(
            "generated shmid '{shm_id}' out of session id '{}'",
            options.session
        );

        let session_mtx = NamedMutex::open(&shm_name(&shm_id, "mtx"))
            .map_err(|e| Error::Transport(format!("failed opening session mutex: {e}")))?;
        let (mgmt, _) = ManagementSegment::open_or_create(&shm_name(&shm_id, "mng"))
            .map_err(|e| Error::Transport(format!("failed opening management segment: {e}")))?;

        let segment_id = options.segment_id;
        let mut device_registered = false;

        let attach = |device_registered: &mut bool| -> Result<ManagedSegment> {
            let guard = session_mtx
                .lock()
                .map_err(|e| Error::Transport(format!("failed locking session mutex: {e}")))?;

            let (session_name, creator) = mgmt.init_session_info(&options.session, uid);
            trace!("session info: name '{session_name}', creator id {creator}");

            let count = mgmt.increment_device_count();
            *device_registered = true;
            trace!("device counter now: {count}");

            if options.monitor {
                monitor::start_monitor(&shm_id)?;
            }

            let segment_name = shm_name_id(&shm_id, "m", segment_id);
            let registered = mgmt.segment_algorithm(segment_id);
            let requested = match registered {
                Some(present) => {
                    if present != options.allocation {
                        warn!(
                            "allocation algorithm of the registered segment is {}, but requested is {}, ignoring requested setting",
                            present.as_str(),
                            options.allocation.as_str()
                        );
                    }
                    present
                }
                None => options.allocation,
            };

            let (segment, created) =
                ManagedSegment::open_or_create(&segment_name, options.segment_size, requested)
                    .map_err(|e| {
                        Error::Transport(format!(
                            "failed to create/open shared memory segment '{segment_name}': {e}"
                        ))
                    })?;

            if registered.is_none() {
                mgmt.register_segment(segment_id, segment.algorithm())
                    .map_err(|e| Error::Transport(e.to_string()))?;
            }

            if created {
                if options.mlock_segment_on_creation {
                    mlock_segment(&segment)?;
                }
                if options.zero_segment_on_creation {
                    zero_segment(&segment);
                }
            }
            if options.mlock_segment {
                mlock_segment(&segment)?;
            }
            if options.zero_segment {
                zero_segment(&segment);
            }

            if created {
                mgmt.bump_event_count();
            }

            debug!(
                "{} managed shared memory segment {segment_name}, size: {} bytes, available: {} bytes, allocation algorithm: {}",
                if created { "created" } else { "opened" },
                segment.size(),
                segment.free_memory(),
                segment.algorithm().as_str()
            );

            drop(guard);
            Ok(segment)
        };

        let segment = match attach(&mut device_registered) {
            Ok(segment) => segment,
            Err(e) => {
                // Roll back the registration so a failed attach does not
                // pin the session; sweep if this device was alone.
                if device_registered {
                    let mut last = false;
                    if let Ok(_guard) = session_mtx.lock() {
                        last = mgmt.decrement_device_count() == 0;
                    }
                    if last && !options.no_cleanup {
                        monitor::cleanup(&shm_id, false);
                    }
                }
                return Err(e);
            }
        };

        let heartbeat_shared = Arc::new(HeartbeatShared {
            stop: Mutex::new(false),
            cv: Condvar::new(),
            heartbeat_addr: mgmt.heartbeat_counter_addr(),
            control_queue_name: shm_name(&shm_id, "cq"),
            device_id: device_id.to_string(),
        });

        let mut segments = HashMap::new();
        segments.insert(segment_id, segment);

        let manager = Arc::new(Self {
            shm_id64,
            shm_id,
            device_id: device_id.to_string(),
            segment_id,
            mgmt,
            session_mtx,
            bad_alloc_max_attempts: options.effective_bad_alloc_attempts(),
            bad_alloc_interval_ms: options.bad_alloc_attempt_interval_ms,
            no_cleanup: options.no_cleanup,
            metadata_msg_size: options.metadata_msg_size,
            segments: Mutex::new(segments),
            regions: Mutex::new(HashMap::new()),
            regions_gen: AtomicU64::new(1),
            interrupted: AtomicBool::new(false),
            msg_counter_new: AtomicU64::new(0),
            msg_counter_del: AtomicU64::new(0),
            heartbeat_shared,
            heartbeat_thread: Mutex::new(None),
            region_events: Mutex::new(RegionEventsState {
                active: Arc::new(AtomicBool::new(false)),
                handle: None,
            }),
            shutdown_done: AtomicBool::new(false),
        });

        let shared = Arc::clone(&manager.heartbeat_shared);
        *manager.heartbeat_thread.lock().unwrap() =
            Some(thread::spawn(move || run_heartbeats(shared)));

        Ok(manager)
    }

    pub fn shm_id(&self) -> &str {
        &self.shm_id
    }

    pub fn shm_id64(&self) -> u64 {
        self.shm_id64
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn segment_id(&self) -> u16 {
        self.segment_id
    }

    pub fn metadata_msg_size(&self) -> usize {
        self.metadata_msg_size
    }

    /// Current session heartbeat counter value.
    pub fn heartbeat(&self) -> u64 {
        self.mgmt.heartbeat()
    }

    /// Number of devices attached to the session.
    pub fn device_count(&self) -> u32 {
        self.mgmt.device_count()
    }

    // --- interruption -----------------------------------------------------

    /// Set the sticky interrupt flag observed by allocators and socket
    /// blocking loops.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.interrupted.store(false, Ordering::Release);
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Assert that no messages are alive. Called between device runs.
    pub fn reset(&self) -> Result<()> {
        let diff = self.msg_counter_new.load(Ordering::Acquire) as i64
            - self.msg_counter_del.load(Ordering::Acquire) as i64;
        if diff != 0 {
            error!("message counter during reset expected to be 0, found: {diff}");
            return Err(Error::Message(format!(
                "message counter during reset expected to be 0, found: {diff}"
            )));
        }
        Ok(())
    }

    pub(crate) fn increment_msg_counter(&self) {
        self.msg_counter_new.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decrement_msg_counter(&self) {
        self.msg_counter_del.fetch_add(1, Ordering::Relaxed);
    }

    // --- managed segments -------------------------------------------------

    /// Allocate `size` user bytes (plus buffer header) in the default
    /// segment, applying the bad-alloc retry policy. Returns the allocator
    /// handle.
    pub fn allocate(&self, size: usize, alignment: usize) -> Result<u64> {
        let full_size = ShmHeader::full_size(size, alignment);
        let mut attempts: i32 = 0;

        loop {
            {
                let segments = self.segments.lock().unwrap();
                let segment = segments
                    .get(&self.segment_id)
                    .expect("default segment is always mapped");

                if full_size > segment.max_allocation() {
                    return Err(Error::BadAlloc(format!(
                        "requested message size ({full_size}) exceeds segment size ({})",
                        segment.size()
                    )));
                }

                if let Some(handle) = segment.allocate(full_size) {
                    unsafe { ShmHeader::construct(segment.ptr_from_handle(handle), alignment) };
                    return Ok(handle);
                }

                attempts += 1;
                if self.bad_alloc_max_attempts >= 0 && attempts >= self.bad_alloc_max_attempts {
                    return Err(Error::BadAlloc(format!(
                        "shmem: could not create a message of size {size}, alignment: {alignment}, free memory: {}",
                        segment.free_memory()
                    )));
                }
                if attempts == 1 && self.bad_alloc_max_attempts != 1 {
                    warn!(
                        "shmem: could not create a message of size {size}, free memory: {}, retrying in {}ms intervals",
                        segment.free_memory(),
                        self.bad_alloc_interval_ms
                    );
                }
            }

            thread::sleep(Duration::from_millis(self.bad_alloc_interval_ms));
            if self.interrupted() {
                return Err(Error::BadAlloc(format!(
                    "shmem: could not create a message of size {size}: interrupted"
                )));
            }
        }
    }

    /// Return a managed buffer to its segment's allocator.
    pub fn deallocate(&self, handle: i64, segment_id: u16) {
        if self.ensure_segment(segment_id).is_err() {
            return;
        }
        let segments = self.segments.lock().unwrap();
        if let Some(segment) = segments.get(&segment_id) {
            segment.deallocate(handle as u64);
        }
    }

    /// Resolve an allocator handle to a local pointer, lazily opening a
    /// foreign segment.
    pub fn address_from_handle(&self, handle: i64, segment_id: u16) -> Result<*mut u8> {
        self.ensure_segment(segment_id)?;
        let segments = self.segments.lock().unwrap();
        let segment = segments
            .get(&segment_id)
            .ok_or_else(|| Error::Transport(format!("segment {segment_id} is not available")))?;
        Ok(segment.ptr_from_handle(handle as u64))
    }

    /// Offset of a pointer inside a mapped segment.
    pub fn handle_from_address(&self, ptr: *const u8, segment_id: u16) -> i64 {
        let segments = self.segments.lock().unwrap();
        match segments.get(&segment_id) {
            Some(segment) => segment.handle_from_ptr(ptr) as i64,
            None => -1,
        }
    }

    /// Shrink a managed buffer in place. Returns false when the allocator
    /// cannot split the tail.
    pub fn shrink_in_place(&self, handle: i64, new_full_size: usize, segment_id: u16) -> bool {
        let segments = self.segments.lock().unwrap();
        match segments.get(&segment_id) {
            Some(segment) => segment.shrink_in_place(handle as u64, new_full_size),
            None => false,
        }
    }

    /// Free bytes of the default segment.
    pub fn free_memory(&self) -> u64 {
        let segments = self.segments.lock().unwrap();
        segments
            .get(&self.segment_id)
            .map(|s| s.free_memory())
            .unwrap_or(0)
    }

    /// Total size of the default segment.
    pub fn segment_size(&self) -> usize {
        let segments = self.segments.lock().unwrap();
        segments
            .get(&self.segment_id)
            .map(|s| s.size())
            .unwrap_or(0)
    }

    fn ensure_segment(&self, segment_id: u16) -> Result<()> {
        {
            let segments = self.segments.lock().unwrap();
            if segments.contains_key(&segment_id) {
                return Ok(());
            }
        }

        let name = shm_name_id(&self.shm_id, "m", segment_id);
        let segment = ManagedSegment::open_existing(&name).map_err(|e| {
            error!("could not get segment with id '{segment_id}': {e}");
            Error::Transport(format!("could not get segment with id '{segment_id}': {e}"))
        })?;
        debug!("located segment with id '{segment_id}'");
        self.segments.lock().unwrap().entry(segment_id).or_insert(segment);
        Ok(())
    }

    // --- unmanaged regions ------------------------------------------------

    /// Create an unmanaged region (or promote an existing view to
    /// controller). Returns the region and its id.
    pub fn create_region(
        &self,
        size: u64,
        callback: Option<RegionCallback>,
        bulk_callback: Option<RegionBulkCallback>,
        mut cfg: RegionConfig,
    ) -> Result<(Arc<UnmanagedRegion>, u16)> {
        let result = {
            let _guard = self
                .session_mtx
                .lock()
                .map_err(|e| Error::Transport(format!("failed locking session mutex: {e}")))?;

            let id = match cfg.id {
                Some(id) => id,
                None => {
                    let id = self.mgmt.next_region_id();
                    trace!("issued region id {id}");
                    id
                }
            };
            cfg.id = Some(id);
            cfg.size = size;

            let mut regions = self.regions.lock().unwrap();

            let region = match regions.get(&id).cloned() {
                Some(existing) => {
                    if existing.is_controlling() {
                        error!("unmanaged region with id {id} already exists, only unique ids per session are allowed");
                        return Err(Error::Transport(format!(
                            "unmanaged region with id {id} already exists, only unique ids per session are allowed"
                        )));
                    }
                    existing.become_controller(&cfg);
                    existing
                }
                None => {
                    let region = Arc::new(UnmanagedRegion::new(&self.shm_id, size, true, &cfg)?);
                    if region.created() {
                        self.mgmt.register_region(
                            id,
                            &RegionRecord {
                                path: cfg.path.clone(),
                                creation_flags: cfg.creation_flags,
                                user_flags: cfg.user_flags,
                                size,
                                rc_segment_size: cfg.rc_segment_size,
                                destroyed: false,
                            },
                        )?;
                        self.mgmt.bump_event_count();
                    }
                    regions.insert(id, Arc::clone(&region));
                    region
                }
            };

            if callback.is_some() || bulk_callback.is_some() {
                region.set_callbacks(callback, bulk_callback);
                region.start_ack_sender();
                region.start_ack_receiver();
            }

            (region, id)
        };
        self.regions_gen.fetch_add(1, Ordering::Release);

        Ok(result)
    }

    /// Locate a region by id, opening a view if this process has none yet.
    pub fn get_region(&self, id: u16) -> Option<Arc<UnmanagedRegion>> {
        {
            let regions = self.regions.lock().unwrap();
            if let Some(region) = regions.get(&id) {
                return Some(Arc::clone(region));
            }
        }

        // Lock order is session mutex before the local region map,
        // matching create_region and remove_region.
        let record = {
            let _guard = self.session_mtx.lock().ok()?;
            self.mgmt.region_record(id)
        };
        let Some(record) = record else {
            error!("could not get remote region with id '{id}', does the region creator run with the same session id?");
            return None;
        };
        if record.destroyed {
            // Destruction only removes shared objects; no new views open.
            error!("region '{id}' is marked destroyed, not opening a view");
            return None;
        }

        let cfg = RegionConfig {
            id: Some(id),
            size: 0,
            user_flags: record.user_flags,
            creation_flags: record.creation_flags,
            path: record.path.clone(),
            rc_segment_size: record.rc_segment_size,
            ..RegionConfig::default()
        };

        match UnmanagedRegion::new(&self.shm_id, 0, false, &cfg) {
            Ok(region) => {
                let region = Arc::new(region);
                region.start_ack_sender();
                let mut regions = self.regions.lock().unwrap();
                if let Some(existing) = regions.get(&id) {
                    return Some(Arc::clone(existing));
                }
                regions.insert(id, Arc::clone(&region));
                Some(region)
            }
            Err(e) => {
                error!("could not get remote region for id '{id}': {e}");
                None
            }
        }
    }

    /// Region lookup through the thread-local cache, invalidated by the
    /// manager's generation counter.
    pub fn get_region_from_cache(&self, id: u16) -> Option<Arc<UnmanagedRegion>> {
        let generation = self.regions_gen.load(Ordering::Acquire);

        let cached = REGION_CACHE.with(|cache| {
            let cache = cache.borrow();
            for (cid, cshm, cgen, weak) in cache.iter() {
                if *cid == id && *cshm == self.shm_id64 && *cgen == generation {
                    if let Some(region) = weak.upgrade() {
                        return Some(region);
                    }
                }
            }
            None
        });
        if cached.is_some() {
            return cached;
        }

        let region = self.get_region(id)?;
        REGION_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            cache.retain(|(_, cshm, cgen, _)| *cshm != self.shm_id64 || *cgen == generation);
            cache.push((id, self.shm_id64, generation, Arc::downgrade(&region)));
        });
        Some(region)
    }

    /// Stop a region's ack machinery, mark it destroyed session-wide and
    /// drop the local attachment.
    pub fn remove_region(&self, id: u16) {
        {
            let guard = self.session_mtx.lock();
            let mut regions = self.regions.lock().unwrap();
            match regions.remove(&id) {
                Some(region) => {
                    region.stop_acks();
                    if region.remove_on_destruction() && guard.is_ok() {
                        self.mgmt.mark_region_destroyed(id);
                        self.mgmt.bump_event_count();
                    }
                }
                None => {
                    debug!("remove_region() could not locate region with id '{id}'");
                }
            }
        }
        self.regions_gen.fetch_add(1, Ordering::Release);
    }

    /// Snapshot of every managed segment and unmanaged region in the
    /// session.
    pub fn get_region_info(&self) -> Vec<RegionInfo> {
        let mut result = Vec::new();

        let (segments, regions) = {
            let Ok(_guard) = self.session_mtx.lock() else {
                return result;
            };
            (self.mgmt.segments(), self.mgmt.regions())
        };

        for (id, _) in segments {
            if self.ensure_segment(id).is_err() {
                error!("could not find segment with id {id}");
                continue;
            }
            let map = self.segments.lock().unwrap();
            if let Some(segment) = map.get(&id) {
                result.push(RegionInfo {
                    id,
                    managed: true,
                    event: RegionEvent::Created,
                    ptr: segment.base(),
                    size: segment.size() as u64,
                    flags: 0,
                });
            }
        }

        for (id, record) in regions {
            if record.destroyed {
                result.push(RegionInfo {
                    id,
                    managed: false,
                    event: RegionEvent::Destroyed,
                    ptr: std::ptr::null_mut(),
                    size: 0,
                    flags: record.user_flags,
                });
            } else {
                let (ptr, size) = match self.get_region(id) {
                    Some(region) => (region.data(), region.size()),
                    None => (std::ptr::null_mut(), 0),
                };
                result.push(RegionInfo {
                    id,
                    managed: false,
                    event: RegionEvent::Created,
                    ptr,
                    size,
                    flags: record.user_flags,
                });
            }
        }

        result
    }

    // --- region events ----------------------------------------------------

    /// Subscribe to region create/destroy events. Callbacks are serialized
    /// on a dedicated thread; an existing subscription is replaced.
    pub fn subscribe_to_region_events(self: &Arc<Self>, callback: RegionEventCallback) {
        let mut state = self.region_events.lock().unwrap();
        if let Some(handle) = state.handle.take() {
            debug!("already subscribed, overwriting previous subscription");
            state.active.store(false, Ordering::Release);
            let _ = handle.join();
        }

        let active = Arc::new(AtomicBool::new(true));
        state.active = Arc::clone(&active);
        let weak = Arc::downgrade(self);
        state.handle = Some(thread::spawn(move || {
            run_region_events(weak, active, callback)
        }));
    }

    pub fn subscribed_to_region_events(&self) -> bool {
        self.region_events.lock().unwrap().handle.is_some()
    }

    pub fn unsubscribe_from_region_events(&self) {
        let mut state = self.region_events.lock().unwrap();
        if let Some(handle) = state.handle.take() {
            state.active.store(false, Ordering::Release);
            let _ = handle.join();
        }
    }

    // --- lifecycle --------------------------------------------------------

    fn stop_heartbeats(&self) {
        {
            let mut stop = self.heartbeat_shared.stop.lock().unwrap();
            *stop = true;
        }
        self.heartbeat_shared.cv.notify_one();
        if let Some(handle) = self.heartbeat_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn cleanup_if_last(&self) {
        let mut last = false;
        match self.session_mtx.lock() {
            Ok(_guard) => {
                let remaining = self.mgmt.decrement_device_count();
                if remaining == 0 {
                    debug!(
                        "last segment user, {}",
                        if self.no_cleanup {
                            "skipping removal (shm-no-cleanup is set)"
                        } else {
                            "removing segment"
                        }
                    );
                    last = true;
                } else {
                    debug!("other segment users present ({remaining}), skipping removal");
                }
            }
            Err(e) => {
                error!("manager could not acquire lock: {e}");
            }
        }

        if last && !self.no_cleanup {
            monitor::cleanup(&self.shm_id, false);
        }
    }

    /// Tear down the attachment: join workers, deregister the device and
    /// sweep the session objects if this was the last device. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.regions_gen.fetch_add(1, Ordering::Release);
        self.unsubscribe_from_region_events();
        self.stop_heartbeats();

        {
            let mut regions = self.regions.lock().unwrap();
            for (_, region) in regions.iter() {
                region.stop_acks();
            }
            regions.clear();
        }

        self.cleanup_if_last();
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn mlock_segment(segment: &ManagedSegment) -> Result<()> {
    debug!("locking the managed segment memory pages...");
    segment.mlock_pages().map_err(|e| {
        error!("could not lock the managed segment memory: {e}");
        Error::Transport(format!("could not lock the managed segment memory: {e}"))
    })?;
    debug!("successfully locked the managed segment memory pages");
    Ok(())
}

fn zero_segment(segment: &ManagedSegment) {
    debug!("zeroing the managed segment free memory...");
    segment.zero_free_memory();
    debug!("successfully zeroed the managed segment free memory");
}
