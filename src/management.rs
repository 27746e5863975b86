// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Management segment: a small shared region holding session metadata —
// device counter, event counter, region id generator, heartbeat, and the
// segment/region registries. Everything lives in one fixed #[repr(C)]
// layout at the segment base; registry mutations happen under the named
// session mutex, counters are atomics readable without it.

use std::io;
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::trace;

use crate::common::{AllocationAlgorithm, FIRST_REGION_ID, MANAGEMENT_SEGMENT_SIZE};
use crate::platform::{MapMode, ShmMapping};

const MANAGEMENT_MAGIC: u64 = 0x464d_515f_4d4e_4721; // "FMQ_MNG!"

pub const MAX_SEGMENTS: usize = 16;
pub const MAX_REGIONS: usize = 64;

const NAME_CAPACITY: usize = 256;
const PATH_CAPACITY: usize = 256;

#[repr(C)]
struct SegmentSlot {
    used: u32,
    id: u32,
    algorithm: u32,
    _pad: u32,
}

#[repr(C)]
struct RegionSlot {
    used: u32,
    id: u32,
    destroyed: AtomicU32,
    creation_flags: i32,
    user_flags: u64,
    size: u64,
    rc_segment_size: u64,
    path_len: u32,
    _pad: u32,
    path: [u8; PATH_CAPACITY],
}

#[repr(C)]
struct ManagementLayout {
    magic: AtomicU64,
    session_name_len: u32,
    creator_uid: u32,
    session_name: [u8; NAME_CAPACITY],
    device_count: AtomicU32,
    _pad: u32,
    event_count: AtomicU64,
    region_counter: AtomicU64,
    heartbeat: AtomicU64,
    segments: [SegmentSlot; MAX_SEGMENTS],
    regions: [RegionSlot; MAX_REGIONS],
}

const _: () = assert!(std::mem::size_of::<ManagementLayout>() < MANAGEMENT_SEGMENT_SIZE);

/// Registered properties of one unmanaged region.
#[derive(Clone, Debug, Default)]
pub struct RegionRecord {
    pub path: Option<PathBuf>,
    pub creation_flags: i32,
    pub user_flags: u64,
    pub size: u64,
    pub rc_segment_size: u64,
    pub destroyed: bool,
}

/// The mapped management segment of one session.
pub struct ManagementSegment {
    mapping: ShmMapping,
}

unsafe impl Send for ManagementSegment {}
unsafe impl Sync for ManagementSegment {}

impl ManagementSegment {
    /// Open or create the session management segment (`fmq_<S>_mng`).
    pub fn open_or_create(name: &str) -> io::Result<(Self, bool)> {
        let (mapping, created) =
            ShmMapping::acquire(name, MANAGEMENT_SEGMENT_SIZE, MapMode::CreateOrOpen)?;
        let layout = mapping.as_ptr() as *mut ManagementLayout;

        if created {
            mapping.zero();
            unsafe {
                (*layout)
                    .region_counter
                    .store(FIRST_REGION_ID, Ordering::Relaxed);
                (*layout).magic.store(MANAGEMENT_MAGIC, Ordering::Release);
            }
            trace!("created management segment {name}");
        } else {
            let deadline = Instant::now() + Duration::from_secs(10);
            while unsafe { &(*layout).magic }.load(Ordering::Acquire) != MANAGEMENT_MAGIC {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("management segment {name} never became initialized"),
                    ));
                }
                std::thread::yield_now();
            }
            trace!("opened management segment {name}");
        }

        Ok((Self { mapping }, created))
    }

    /// Open the management segment of an existing session.
    pub fn open_existing(name: &str) -> io::Result<Self> {
        let mapping = ShmMapping::open_existing(name)?;
        let layout = mapping.as_ptr() as *const ManagementLayout;
        if unsafe { &(*layout).magic }.load(Ordering::Acquire) != MANAGEMENT_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("management segment {name} is not initialized"),
            ));
        }
        Ok(Self { mapping })
    }

    fn layout(&self) -> *mut ManagementLayout {
        self.mapping.as_ptr() as *mut ManagementLayout
    }

    // --- session info -----------------------------------------------------

    /// Record the session name and creator uid if not present yet. Returns
    /// the stored values. Caller holds the session mutex.
    pub fn init_session_info(&self, session_name: &str, uid: u32) -> (String, u32) {
        let layout = self.layout();
        unsafe {
            if ptr::addr_of!((*layout).session_name_len).read() == 0 {
                let bytes = session_name.as_bytes();
                let n = bytes.len().min(NAME_CAPACITY);
                ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    ptr::addr_of_mut!((*layout).session_name) as *mut u8,
                    n,
                );
                ptr::addr_of_mut!((*layout).creator_uid).write(uid);
                ptr::addr_of_mut!((*layout).session_name_len).write(n as u32);
            }
        }
        self.session_info()
    }

    /// Stored session name and creator uid.
    pub fn session_info(&self) -> (String, u32) {
        let layout = self.layout();
        unsafe {
            let len = ptr::addr_of!((*layout).session_name_len).read() as usize;
            let name_ptr = ptr::addr_of!((*layout).session_name) as *const u8;
            let bytes = std::slice::from_raw_parts(name_ptr, len.min(NAME_CAPACITY));
            (
                String::from_utf8_lossy(bytes).into_owned(),
                ptr::addr_of!((*layout).creator_uid).read(),
            )
        }
    }

    // --- counters ---------------------------------------------------------

    /// Increment the device counter; returns the new value. Caller holds
    /// the session mutex.
    pub fn increment_device_count(&self) -> u32 {
        unsafe { &(*self.layout()).device_count }.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the device counter; returns the new value. Caller holds
    /// the session mutex.
    pub fn decrement_device_count(&self) -> u32 {
        unsafe { &(*self.layout()).device_count }
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1)
    }

    pub fn device_count(&self) -> u32 {
        unsafe { &(*self.layout()).device_count }.load(Ordering::Acquire)
    }

    pub fn event_count(&self) -> u64 {
        unsafe { &(*self.layout()).event_count }.load(Ordering::Acquire)
    }

    pub fn bump_event_count(&self) {
        unsafe { &(*self.layout()).event_count }.fetch_add(1, Ordering::AcqRel);
    }

    /// Next unmanaged-region id. Ids are monotonic per session, starting at
    /// 1024.
    pub fn next_region_id(&self) -> u16 {
        let id = unsafe { &(*self.layout()).region_counter }.fetch_add(1, Ordering::AcqRel);
        id as u16
    }

    pub fn heartbeat(&self) -> u64 {
        unsafe { &(*self.layout()).heartbeat }.load(Ordering::Acquire)
    }

    pub fn beat(&self) {
        unsafe { &(*self.layout()).heartbeat }.fetch_add(1, Ordering::AcqRel);
    }

    /// Address of the heartbeat counter inside the mapping, for the
    /// heartbeat thread. Valid for the lifetime of this segment handle.
    pub fn heartbeat_counter_addr(&self) -> usize {
        unsafe { ptr::addr_of!((*self.layout()).heartbeat) as usize }
    }

    // --- segment registry -------------------------------------------------

    /// Register a managed segment. Caller holds the session mutex.
    pub fn register_segment(&self, id: u16, algorithm: AllocationAlgorithm) -> io::Result<()> {
        let layout = self.layout();
        unsafe {
            let slots = ptr::addr_of_mut!((*layout).segments) as *mut SegmentSlot;
            for i in 0..MAX_SEGMENTS {
                let slot = slots.add(i);
                if ptr::addr_of!((*slot).used).read() != 0 {
                    if ptr::addr_of!((*slot).id).read() == id as u32 {
                        return Ok(());
                    }
                    continue;
                }
                ptr::addr_of_mut!((*slot).id).write(id as u32);
                ptr::addr_of_mut!((*slot).algorithm).write(algorithm.as_u32());
                ptr::addr_of_mut!((*slot).used).write(1);
                return Ok(());
            }
        }
        Err(io::Error::new(
            io::ErrorKind::OutOfMemory,
            "segment registry is full",
        ))
    }

    /// Allocation algorithm of a registered segment.
    pub fn segment_algorithm(&self, id: u16) -> Option<AllocationAlgorithm> {
        let layout = self.layout();
        unsafe {
            let slots = ptr::addr_of!((*layout).segments) as *const SegmentSlot;
            for i in 0..MAX_SEGMENTS {
                let slot = slots.add(i);
                if ptr::addr_of!((*slot).used).read() != 0
                    && ptr::addr_of!((*slot).id).read() == id as u32
                {
                    return Some(AllocationAlgorithm::from_u32(
                        ptr::addr_of!((*slot).algorithm).read(),
                    ));
                }
            }
        }
        None
    }

    /// All registered segments.
    pub fn segments(&self) -> Vec<(u16, AllocationAlgorithm)> {
        let layout = self.layout();
        let mut out = Vec::new();
        unsafe {
            let slots = ptr::addr_of!((*layout).segments) as *const SegmentSlot;
            for i in 0..MAX_SEGMENTS {
                let slot = slots.add(i);
                if ptr::addr_of!((*slot).used).read() != 0 {
                    out.push((
                        ptr::addr_of!((*slot).id).read() as u16,
                        AllocationAlgorithm::from_u32(ptr::addr_of!((*slot).algorithm).read()),
                    ));
                }
            }
        }
        out
    }

    // --- region registry --------------------------------------------------

    /// Register an unmanaged region. Fails if the id is already present.
    /// Caller holds the session mutex.
    pub fn register_region(&self, id: u16, record: &RegionRecord) -> io::Result<()> {
        let layout = self.layout();
        unsafe {
            let slots = ptr::addr_of_mut!((*layout).regions) as *mut RegionSlot;
            let mut free = None;
            for i in 0..MAX_REGIONS {
                let slot = slots.add(i);
                if ptr::addr_of!((*slot).used).read() != 0 {
                    if ptr::addr_of!((*slot).id).read() == id as u32 {
                        return Err(io::Error::new(
                            io::ErrorKind::AlreadyExists,
                            format!("unmanaged region with id {id} has already been registered"),
                        ));
                    }
                } else if free.is_none() {
                    free = Some(slot);
                }
            }
            let slot = free.ok_or_else(|| {
                io::Error::new(io::ErrorKind::OutOfMemory, "region registry is full")
            })?;

            ptr::addr_of_mut!((*slot).id).write(id as u32);
            (*slot).destroyed.store(0, Ordering::Relaxed);
            ptr::addr_of_mut!((*slot).creation_flags).write(record.creation_flags);
            ptr::addr_of_mut!((*slot).user_flags).write(record.user_flags);
            ptr::addr_of_mut!((*slot).size).write(record.size);
            ptr::addr_of_mut!((*slot).rc_segment_size).write(record.rc_segment_size);
            let path = record
                .path
                .as_ref()
                .and_then(|p| p.to_str())
                .unwrap_or("")
                .as_bytes();
            let n = path.len().min(PATH_CAPACITY);
            ptr::copy_nonoverlapping(
                path.as_ptr(),
                ptr::addr_of_mut!((*slot).path) as *mut u8,
                n,
            );
            ptr::addr_of_mut!((*slot).path_len).write(n as u32);
            ptr::addr_of_mut!((*slot).used).write(1);
        }
        Ok(())
    }

    /// Registered record of a region id.
    pub fn region_record(&self, id: u16) -> Option<RegionRecord> {
        self.regions().into_iter().find(|(i, _)| *i == id).map(|(_, r)| r)
    }

    /// Mark a region destroyed. Returns whether the id was registered.
    pub fn mark_region_destroyed(&self, id: u16) -> bool {
        let layout = self.layout();
        unsafe {
            let slots = ptr::addr_of!((*layout).regions) as *const RegionSlot;
            for i in 0..MAX_REGIONS {
                let slot = slots.add(i);
                if ptr::addr_of!((*slot).used).read() != 0
                    && ptr::addr_of!((*slot).id).read() == id as u32
                {
                    (*slot).destroyed.store(1, Ordering::Release);
                    return true;
                }
            }
        }
        false
    }

    /// All registered regions.
    pub fn regions(&self) -> Vec<(u16, RegionRecord)> {
        let layout = self.layout();
        let mut out = Vec::new();
        unsafe {
            let slots = ptr::addr_of!((*layout).regions) as *const RegionSlot;
            for i in 0..MAX_REGIONS {
                let slot = slots.add(i);
                if ptr::addr_of!((*slot).used).read() == 0 {
                    continue;
                }
                let path_len = ptr::addr_of!((*slot).path_len).read() as usize;
                let path = if path_len > 0 {
                    let p = ptr::addr_of!((*slot).path) as *const u8;
                    let bytes = std::slice::from_raw_parts(p, path_len.min(PATH_CAPACITY));
                    Some(PathBuf::from(String::from_utf8_lossy(bytes).into_owned()))
                } else {
                    None
                };
                out.push((
                    ptr::addr_of!((*slot).id).read() as u16,
                    RegionRecord {
                        path,
                        creation_flags: ptr::addr_of!((*slot).creation_flags).read(),
                        user_flags: ptr::addr_of!((*slot).user_flags).read(),
                        size: ptr::addr_of!((*slot).size).read(),
                        rc_segment_size: ptr::addr_of!((*slot).rc_segment_size).read(),
                        destroyed: (*slot).destroyed.load(Ordering::Acquire) != 0,
                    },
                ));
            }
        }
        out
    }
}
