// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Managed shared memory segment: a single contiguous mapping hosting a
// concurrent allocator. Handles are segment-relative offsets, so a handle
// allocated by any process resolves to the same logical buffer in every
// process that has mapped the segment.
//
// Block layout: every block (used or free) starts with a 16-byte header
// holding the total block size; free blocks reuse the second header word
// for the address-ordered free-list link. Payloads are 16-byte aligned.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use log::{debug, warn};

use crate::common::AllocationAlgorithm;
use crate::platform::posix::{
    init_shared_mutex, shared_mutex_lock, shared_mutex_unlock,
};
use crate::platform::{MapMode, ShmMapping};

const SEGMENT_MAGIC: u64 = 0x464d_515f_5345_4721; // "FMQ_SEG!"

/// Allocation granularity; payload pointers are aligned to this.
const GRANULARITY: usize = 16;

/// Per-block bookkeeping preceding every payload.
const BLOCK_HEADER_SIZE: usize = 16;

/// Smallest block the allocator will carve out (header + minimal payload).
const MIN_BLOCK_SIZE: usize = BLOCK_HEADER_SIZE + GRANULARITY;

/// Offset 0 is the null link; real offsets start past the segment header.
const NO_BLOCK: u64 = 0;

#[repr(C)]
struct SegmentLayout {
    magic: AtomicU64,
    algorithm: u32,
    _pad: u32,
    total_size: u64,
    free_bytes: AtomicU64,
    free_head: u64,
    mutex: libc::pthread_mutex_t,
}

fn data_start() -> u64 {
    let hdr = std::mem::size_of::<SegmentLayout>();
    ((hdr + GRANULARITY - 1) / GRANULARITY * GRANULARITY) as u64
}

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) / align * align
}

/// A managed segment mapped into this process. Allocator mutations are
/// guarded by a process-shared robust mutex embedded in the segment header;
/// the free-byte counter is readable without the lock.
pub struct ManagedSegment {
    mapping: ShmMapping,
    name: String,
    algorithm: AllocationAlgorithm,
}

unsafe impl Send for ManagedSegment {}
unsafe impl Sync for ManagedSegment {}

impl ManagedSegment {
    /// Open or create the named segment. When creating, the full free range
    /// becomes a single free block under the requested algorithm. When
    /// opening, a differing requested algorithm logs a warning and the
    /// present one is honored.
    pub fn open_or_create(
        name: &str,
        size: usize,
        algorithm: AllocationAlgorithm,
    ) -> io::Result<(Self, bool)> {
        let (mapping, created) = ShmMapping::acquire(name, size, MapMode::CreateOrOpen)?;
        let layout = mapping.as_ptr() as *mut SegmentLayout;

        if created {
            unsafe {
                ptr::addr_of_mut!((*layout).algorithm).write(algorithm.as_u32());
                ptr::addr_of_mut!((*layout).total_size).write(mapping.size() as u64);
                init_shared_mutex(ptr::addr_of_mut!((*layout).mutex))?;

                let start = data_start();
                let free = mapping.size() as u64 - start;
                write_block_size(mapping.as_ptr(), start, free);
                write_block_next(mapping.as_ptr(), start, NO_BLOCK);
                ptr::addr_of_mut!((*layout).free_head).write(start);
                (*layout).free_bytes.store(free, Ordering::Relaxed);

                (*layout).magic.store(SEGMENT_MAGIC, Ordering::Release);
            }
            debug!(
                "created managed segment {name}: {} bytes, algorithm {}",
                mapping.size(),
                algorithm.as_str()
            );
            Ok((
                Self {
                    mapping,
                    name: name.to_string(),
                    algorithm,
                },
                true,
            ))
        } else {
            wait_initialized(&mapping, name)?;
            let present =
                AllocationAlgorithm::from_u32(unsafe { ptr::addr_of!((*layout).algorithm).read() });
            if present != algorithm {
                warn!(
                    "allocation algorithm of the opened segment is {}, but requested is {}, ignoring requested setting",
                    present.as_str(),
                    algorithm.as_str()
                );
            }
            debug!("opened managed segment {name}: {} bytes", mapping.size());
            Ok((
                Self {
                    mapping,
                    name: name.to_string(),
                    algorithm: present,
                },
                false,
            ))
        }
    }

    /// Open an existing segment, honoring whatever algorithm it carries.
    pub fn open_existing(name: &str) -> io::Result<Self> {
        let mapping = ShmMapping::open_existing(name)?;
        wait_initialized(&mapping, name)?;
        let layout = mapping.as_ptr() as *const SegmentLayout;
        let algorithm =
            AllocationAlgorithm::from_u32(unsafe { ptr::addr_of!((*layout).algorithm).read() });
        Ok(Self {
            mapping,
            name: name.to_string(),
            algorithm,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithm(&self) -> AllocationAlgorithm {
        self.algorithm
    }

    pub fn size(&self) -> usize {
        self.mapping.size()
    }

    pub fn base(&self) -> *mut u8 {
        self.mapping.as_ptr()
    }

    /// Bytes currently available to the allocator.
    pub fn free_memory(&self) -> u64 {
        let layout = self.mapping.as_ptr() as *const SegmentLayout;
        unsafe { &(*layout).free_bytes }.load(Ordering::Acquire)
    }

    /// Allocate `full_size` bytes; returns the payload offset. `None` means
    /// the segment is currently out of space (the caller applies the retry
    /// policy).
    pub fn allocate(&self, full_size: usize) -> Option<u64> {
        let need = (align_up(full_size.max(GRANULARITY), GRANULARITY) + BLOCK_HEADER_SIZE) as u64;
        let base = self.mapping.as_ptr();
        let layout = self.mapping.as_ptr() as *mut SegmentLayout;

        let _guard = SegmentLock::new(layout);

        // Walk the address-ordered free list; best-fit scans all blocks,
        // sequential fit takes the first that is large enough.
        let mut prev = NO_BLOCK;
        let mut cur = unsafe { ptr::addr_of!((*layout).free_head).read() };
        let mut chosen: Option<(u64, u64, u64)> = None; // (prev, offset, size)

        while cur != NO_BLOCK {
            let size = unsafe { read_block_size(base, cur) };
            if size >= need {
                match self.algorithm {
                    AllocationAlgorithm::SimpleSeqFit => {
                        chosen = Some((prev, cur, size));
                        break;
                    }
                    AllocationAlgorithm::RbtreeBestFit => {
                        if chosen.map_or(true, |(_, _, s)| size < s) {
                            chosen = Some((prev, cur, size));
                        }
                    }
                }
            }
            prev = cur;
            cur = unsafe { read_block_next(base, cur) };
        }

        let (cprev, coff, csize) = chosen?;
        let cnext = unsafe { read_block_next(base, coff) };

        let taken = if csize - need >= MIN_BLOCK_SIZE as u64 {
            // Split: the tail stays on the free list in place of the block.
            let rest = coff + need;
            unsafe {
                write_block_size(base, rest, csize - need);
                write_block_next(base, rest, cnext);
                write_block_size(base, coff, need);
                set_free_link(layout, base, cprev, rest);
            }
            need
        } else {
            unsafe { set_free_link(layout, base, cprev, cnext) };
            csize
        };

        unsafe { &(*layout).free_bytes }.fetch_sub(taken, Ordering::AcqRel);
        Some(coff + BLOCK_HEADER_SIZE as u64)
    }

    /// Return a payload to the allocator.
    pub fn deallocate(&self, handle: u64) {
        let base = self.mapping.as_ptr();
        let layout = self.mapping.as_ptr() as *mut SegmentLayout;
        let off = handle - BLOCK_HEADER_SIZE as u64;

        let _guard = SegmentLock::new(layout);

        let size = unsafe { read_block_size(base, off) };
        unsafe { insert_free_block(layout, base, off, size) };
        unsafe { &(*layout).free_bytes }.fetch_add(size, Ordering::AcqRel);
    }

    /// Shrink an allocated block in place, returning the tail to the free
    /// list. Fails when the tail is too small to form a block.
    pub fn shrink_in_place(&self, handle: u64, new_full_size: usize) -> bool {
        let base = self.mapping.as_ptr();
        let layout = self.mapping.as_ptr() as *mut SegmentLayout;
        let off = handle - BLOCK_HEADER_SIZE as u64;
        let need =
            (align_up(new_full_size.max(GRANULARITY), GRANULARITY) + BLOCK_HEADER_SIZE) as u64;

        let _guard = SegmentLock::new(layout);

        let size = unsafe { read_block_size(base, off) };
        if size < need || size - need < MIN_BLOCK_SIZE as u64 {
            return false;
        }

        let tail = off + need;
        unsafe {
            write_block_size(base, off, need);
            write_block_size(base, tail, size - need);
            insert_free_block(layout, base, tail, size - need);
        }
        unsafe { &(*layout).free_bytes }.fetch_add(size - need, Ordering::AcqRel);
        true
    }

    /// Zero the payload bytes of every free block.
    pub fn zero_free_memory(&self) {
        let base = self.mapping.as_ptr();
        let layout = self.mapping.as_ptr() as *mut SegmentLayout;

        let _guard = SegmentLock::new(layout);

        let mut cur = unsafe { ptr::addr_of!((*layout).free_head).read() };
        while cur != NO_BLOCK {
            let size = unsafe { read_block_size(base, cur) };
            let next = unsafe { read_block_next(base, cur) };
            unsafe {
                ptr::write_bytes(
                    base.add(cur as usize + BLOCK_HEADER_SIZE),
                    0,
                    size as usize - BLOCK_HEADER_SIZE,
                );
            }
            cur = next;
        }
    }

    /// Lock the segment pages in RAM.
    pub fn mlock_pages(&self) -> io::Result<()> {
        self.mapping.mlock_pages()
    }

    /// Resolve a payload offset to a local pointer.
    pub fn ptr_from_handle(&self, handle: u64) -> *mut u8 {
        unsafe { self.mapping.as_ptr().add(handle as usize) }
    }

    /// Offset of a payload pointer inside this segment.
    pub fn handle_from_ptr(&self, ptr: *const u8) -> u64 {
        ptr as u64 - self.mapping.as_ptr() as u64
    }

    /// Largest full allocation this segment could ever satisfy.
    pub fn max_allocation(&self) -> usize {
        self.mapping.size() - data_start() as usize - BLOCK_HEADER_SIZE
    }
}

fn wait_initialized(mapping: &ShmMapping, name: &str) -> io::Result<()> {
    use std::time::{Duration, Instant};
    let layout = mapping.as_ptr() as *const SegmentLayout;
    let deadline = Instant::now() + Duration::from_secs(10);
    while unsafe { &(*layout).magic }.load(Ordering::Acquire) != SEGMENT_MAGIC {
        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("segment {name} never became initialized"),
            ));
        }
        std::thread::yield_now();
    }
    Ok(())
}

struct SegmentLock {
    mtx: *mut libc::pthread_mutex_t,
}

impl SegmentLock {
    fn new(layout: *mut SegmentLayout) -> Self {
        let mtx = unsafe { ptr::addr_of_mut!((*layout).mutex) };
        unsafe { shared_mutex_lock(mtx) }.expect("segment mutex poisoned beyond recovery");
        Self { mtx }
    }
}

impl Drop for SegmentLock {
    fn drop(&mut self) {
        let _ = unsafe { shared_mutex_unlock(self.mtx) };
    }
}

unsafe fn read_block_size(base: *mut u8, off: u64) -> u64 {
    (base.add(off as usize) as *const u64).read()
}

unsafe fn write_block_size(base: *mut u8, off: u64, size: u64) {
    (base.add(off as usize) as *mut u64).write(size);
}

unsafe fn read_block_next(base: *mut u8, off: u64) -> u64 {
    (base.add(off as usize + 8) as *const u64).read()
}

unsafe fn write_block_next(base: *mut u8, off: u64, next: u64) {
    (base.add(off as usize + 8) as *mut u64).write(next);
}

unsafe fn set_free_link(layout: *mut SegmentLayout, base: *mut u8, prev: u64, target: u64) {
    if prev == NO_BLOCK {
        ptr::addr_of_mut!((*layout).free_head).write(target);
    } else {
        write_block_next(base, prev, target);
    }
}

/// Insert a block into the address-ordered free list, coalescing with
/// adjacent free neighbors.
unsafe fn insert_free_block(layout: *mut SegmentLayout, base: *mut u8, off: u64, size: u64) {
    let mut prev = NO_BLOCK;
    let mut cur = ptr::addr_of!((*layout).free_head).read();
    while cur != NO_BLOCK && cur < off {
        prev = cur;
        cur = read_block_next(base, cur);
    }

    let mut new_off = off;
    let mut new_size = size;

    // Coalesce with the predecessor.
    if prev != NO_BLOCK {
        let prev_size = read_block_size(base, prev);
        if prev + prev_size == off {
            new_off = prev;
            new_size += prev_size;
            prev = find_prev(layout, base, prev);
        }
    }

    // Coalesce with the successor.
    if cur != NO_BLOCK && new_off + new_size == cur {
        new_size += read_block_size(base, cur);
        cur = read_block_next(base, cur);
    }

    write_block_size(base, new_off, new_size);
    write_block_next(base, new_off, cur);
    set_free_link(layout, base, prev, new_off);
}

unsafe fn find_prev(layout: *mut SegmentLayout, base: *mut u8, target: u64) -> u64 {
    let mut prev = NO_BLOCK;
    let mut cur = ptr::addr_of!((*layout).free_head).read();
    while cur != NO_BLOCK && cur != target {
        prev = cur;
        cur = read_block_next(base, cur);
    }
    prev
}

// ---------------------------------------------------------------------------
// ShmHeader — per-buffer header preceding every managed allocation.
// ---------------------------------------------------------------------------

/// Fixed header stored at the allocator pointer of every managed buffer:
/// the offset from the allocator pointer to the (aligned) user pointer, and
/// an atomic reference count.
#[repr(C)]
pub struct ShmHeader {
    user_offset: u16,
    ref_count: AtomicU16,
}

impl ShmHeader {
    /// Bytes to request from the allocator for a buffer of `size` user
    /// bytes at `alignment`.
    pub fn full_size(size: usize, alignment: usize) -> usize {
        let alignment = alignment.max(GRANULARITY);
        size + alignment + std::mem::size_of::<ShmHeader>()
    }

    /// Initialize the header at the allocator pointer `ptr` and compute the
    /// aligned user pointer. Refcount starts at 1.
    ///
    /// # Safety
    /// `ptr` must point to an allocation of at least
    /// `full_size(size, alignment)` bytes.
    pub unsafe fn construct(ptr: *mut u8, alignment: usize) {
        let alignment = alignment.max(GRANULARITY);
        let raw = ptr as usize + std::mem::size_of::<ShmHeader>();
        let user = align_up(raw, alignment);
        let hdr = ptr as *mut ShmHeader;
        ptr::addr_of_mut!((*hdr).user_offset).write((user - ptr as usize) as u16);
        (*hdr).ref_count.store(1, Ordering::Release);
    }

    /// # Safety
    /// `ptr` must be a pointer previously passed to `construct`.
    pub unsafe fn user_ptr(ptr: *mut u8) -> *mut u8 {
        ptr.add(Self::user_offset(ptr) as usize)
    }

    /// # Safety
    /// `ptr` must be a pointer previously passed to `construct`.
    pub unsafe fn user_offset(ptr: *mut u8) -> u16 {
        let hdr = ptr as *const ShmHeader;
        ptr::addr_of!((*hdr).user_offset).read()
    }

    /// # Safety
    /// `ptr` must be a pointer previously passed to `construct`.
    pub unsafe fn ref_count(ptr: *mut u8) -> u16 {
        let hdr = ptr as *const ShmHeader;
        (*hdr).ref_count.load(Ordering::Acquire)
    }

    /// # Safety
    /// `ptr` must be a pointer previously passed to `construct`.
    pub unsafe fn increment_ref_count(ptr: *mut u8) -> u16 {
        let hdr = ptr as *const ShmHeader;
        (*hdr).ref_count.fetch_add(1, Ordering::Relaxed)
    }

    /// Decrement and return the previous count; the caller that receives 1
    /// was the last owner.
    ///
    /// # Safety
    /// `ptr` must be a pointer previously passed to `construct`.
    pub unsafe fn decrement_ref_count(ptr: *mut u8) -> u16 {
        let hdr = ptr as *const ShmHeader;
        (*hdr).ref_count.fetch_sub(1, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_constants_are_consistent() {
        assert_eq!(GRANULARITY % std::mem::align_of::<u64>(), 0);
        assert!(MIN_BLOCK_SIZE > BLOCK_HEADER_SIZE);
        assert_eq!(data_start() % GRANULARITY as u64, 0);
    }

    #[test]
    fn shm_header_full_size_covers_alignment() {
        // user_offset <= sizeof(ShmHeader) + alignment - 1
        let full = ShmHeader::full_size(100, 64);
        assert!(full >= 100 + std::mem::size_of::<ShmHeader>());
        assert!(full >= 100 + 64);
    }
}
