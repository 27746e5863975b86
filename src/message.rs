// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// A message owns at most one managed buffer or one unmanaged-region block.
// Payload bytes never travel on a socket: a successful send transfers
// reclamation responsibility to the receiving process, which rebuilds the
// message from the metadata header and resolves the handle locally.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use log::{debug, error, warn};

use crate::common::{MetaHeader, RegionBlock};
use crate::errors::{Error, Result};
use crate::manager::Manager;
use crate::region::UnmanagedRegion;
use crate::segment::ShmHeader;

/// When shrinking fails in place and at least this many bytes would go
/// unused, the buffer is reallocated and copied instead of keeping slack.
pub const SHRINK_REALLOC_THRESHOLD: u64 = 1_000_000;

/// A zero-copy message of the shared memory transport.
pub struct Message {
    manager: Arc<Manager>,
    region_ptr: RefCell<Option<Arc<UnmanagedRegion>>>,
    local_ptr: Cell<*mut u8>,
    size: u64,
    hint: u64,
    handle: i64,
    shared: Cell<i64>,
    region_id: u16,
    segment_id: u16,
    alignment: usize,
    managed: bool,
    queued: bool,
}

// Messages may move between threads; resolution state is process-local and
// the underlying buffers are process-shared.
unsafe impl Send for Message {}

impl Message {
    fn blank(manager: Arc<Manager>) -> Self {
        let segment_id = manager.segment_id();
        manager.increment_msg_counter();
        Self {
            manager,
            region_ptr: RefCell::new(None),
            local_ptr: Cell::new(std::ptr::null_mut()),
            size: 0,
            hint: 0,
            handle: -1,
            shared: Cell::new(-1),
            region_id: 0,
            segment_id,
            alignment: 0,
            managed: true,
            queued: false,
        }
    }

    /// An empty message.
    pub fn new(manager: Arc<Manager>) -> Self {
        Self::blank(manager)
    }

    /// An empty message that will allocate with the given alignment.
    pub fn with_alignment(manager: Arc<Manager>, alignment: usize) -> Self {
        let mut msg = Self::blank(manager);
        msg.alignment = alignment;
        msg
    }

    /// A managed message owning `size` fresh bytes.
    pub fn with_size(manager: Arc<Manager>, size: usize) -> Result<Self> {
        let mut msg = Self::blank(manager);
        msg.initialize_chunk(size, 0)?;
        Ok(msg)
    }

    /// A managed message owning `size` fresh bytes at `alignment`.
    pub fn with_size_aligned(manager: Arc<Manager>, size: usize, alignment: usize) -> Result<Self> {
        let mut msg = Self::blank(manager);
        msg.alignment = alignment;
        msg.initialize_chunk(size, alignment)?;
        Ok(msg)
    }

    /// A managed message initialized with a copy of `data`; the source
    /// buffer stays with the caller.
    pub fn from_bytes(manager: Arc<Manager>, data: &[u8]) -> Result<Self> {
        let mut msg = Self::blank(manager);
        msg.initialize_chunk(data.len(), 0)?;
        if !data.is_empty() {
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), msg.local_ptr.get(), data.len());
            }
        }
        Ok(msg)
    }

    /// An unmanaged message over `size` bytes at `data` inside `region`.
    /// The user owns the bytes; `hint` is returned in the release ack.
    pub fn from_region(
        manager: Arc<Manager>,
        region: &Arc<UnmanagedRegion>,
        data: *mut u8,
        size: usize,
        hint: u64,
    ) -> Result<Self> {
        let base = region.data();
        let end = unsafe { base.add(region.size() as usize) };
        if data < base || data > end {
            error!("trying to create region message with data from outside the region");
            return Err(Error::Transport(
                "trying to create region message with data from outside the region".to_string(),
            ));
        }

        let mut msg = Self::blank(manager);
        msg.managed = false;
        msg.region_id = region.id();
        msg.handle = data as i64 - base as i64;
        msg.size = size as u64;
        msg.hint = hint;
        msg.local_ptr.set(data);
        *msg.region_ptr.borrow_mut() = Some(Arc::clone(region));
        Ok(msg)
    }

    /// Reconstruct a message from a received metadata header. Resolution of
    /// the local pointer happens lazily on first `data()`.
    pub(crate) fn from_meta(manager: Arc<Manager>, meta: MetaHeader) -> Self {
        let mut msg = Self::blank(manager);
        msg.apply_meta(meta);
        msg
    }

    fn apply_meta(&mut self, meta: MetaHeader) {
        self.size = meta.size;
        self.hint = meta.hint;
        self.handle = meta.handle;
        self.shared.set(meta.shared);
        self.region_id = meta.region_id;
        self.segment_id = meta.segment_id;
        self.managed = meta.managed != 0;
        self.local_ptr.set(std::ptr::null_mut());
        *self.region_ptr.borrow_mut() = None;
    }

    /// Replace this message's content with a received header, releasing any
    /// buffer it previously owned.
    pub(crate) fn set_meta(&mut self, meta: MetaHeader) {
        self.deallocate_buffer();
        self.queued = false;
        self.apply_meta(meta);
    }

    pub(crate) fn meta(&self) -> MetaHeader {
        MetaHeader {
            size: self.size,
            hint: self.hint,
            handle: self.handle,
            shared: self.shared.get(),
            region_id: self.region_id,
            segment_id: self.segment_id,
            managed: self.managed as u8,
            _pad: [0; 3],
        }
    }

    pub(crate) fn set_queued(&mut self) {
        self.queued = true;
    }

    fn initialize_chunk(&mut self, size: usize, alignment: usize) -> Result<()> {
        if size == 0 {
            self.size = 0;
            return Ok(());
        }
        let handle = self.manager.allocate(size, alignment)? as i64;
        let ptr = self.manager.address_from_handle(handle, self.segment_id)?;
        self.handle = handle;
        self.size = size as u64;
        self.local_ptr.set(unsafe { ShmHeader::user_ptr(ptr) });
        Ok(())
    }

    // --- rebuild ----------------------------------------------------------

    /// Equivalent to destroying and reconstructing empty.
    pub fn rebuild(&mut self) {
        self.deallocate_buffer();
        self.alignment = 0;
        self.queued = false;
    }

    pub fn rebuild_with_alignment(&mut self, alignment: usize) {
        self.deallocate_buffer();
        self.queued = false;
        self.alignment = alignment;
    }

    pub fn rebuild_with_size(&mut self, size: usize) -> Result<()> {
        self.deallocate_buffer();
        self.alignment = 0;
        self.queued = false;
        self.initialize_chunk(size, 0)
    }

    pub fn rebuild_with_size_aligned(&mut self, size: usize, alignment: usize) -> Result<()> {
        self.deallocate_buffer();
        self.queued = false;
        self.alignment = alignment;
        self.initialize_chunk(size, alignment)
    }

    pub fn rebuild_from_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.deallocate_buffer();
        self.alignment = 0;
        self.queued = false;
        self.initialize_chunk(data.len(), 0)?;
        if !data.is_empty() {
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), self.local_ptr.get(), data.len());
            }
        }
        Ok(())
    }

    // --- access -----------------------------------------------------------

    /// Local pointer to the payload, resolved lazily: managed handles map
    /// through the (possibly foreign) segment, region handles through the
    /// thread-local region cache. Null for an empty or unresolvable
    /// message.
    pub fn data(&self) -> *mut u8 {
        if self.local_ptr.get().is_null() {
            if self.managed {
                if self.size > 0 {
                    match self.manager.address_from_handle(self.handle, self.segment_id) {
                        Ok(ptr) => self.local_ptr.set(unsafe { ShmHeader::user_ptr(ptr) }),
                        Err(e) => error!("could not resolve message buffer: {e}"),
                    }
                }
            } else {
                match self.manager.get_region_from_cache(self.region_id) {
                    Some(region) => {
                        self.local_ptr
                            .set(unsafe { region.data().add(self.handle as usize) });
                        *self.region_ptr.borrow_mut() = Some(region);
                    }
                    None => {
                        warn!("could not get pointer from a region message");
                    }
                }
            }
        }
        self.local_ptr.get()
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Payload as a byte slice. Empty for an empty message.
    pub fn as_bytes(&self) -> &[u8] {
        let ptr = self.data();
        if ptr.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(ptr, self.size as usize) }
        }
    }

    /// Payload as a mutable byte slice. Empty for an empty message.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let ptr = self.data();
        if ptr.is_null() {
            &mut []
        } else {
            unsafe { std::slice::from_raw_parts_mut(ptr, self.size as usize) }
        }
    }

    /// Current owner count of the underlying buffer.
    pub fn ref_count(&self) -> u16 {
        if self.handle < 0 {
            return 1;
        }
        if self.managed {
            match self.manager.address_from_handle(self.handle, self.segment_id) {
                Ok(ptr) => unsafe { ShmHeader::ref_count(ptr) },
                Err(_) => 1,
            }
        } else if self.shared.get() < 0 {
            1
        } else {
            match self.manager.get_region_from_cache(self.region_id) {
                Some(region) => region.ref_count(self.shared.get()),
                None => 1,
            }
        }
    }

    // --- used size --------------------------------------------------------

    /// Narrow the logical size of the buffer, returning tail bytes to the
    /// allocator where possible. Never widens.
    pub fn set_used_size(&mut self, new_size: usize) -> bool {
        let new_size = new_size as u64;
        if new_size == self.size {
            return true;
        }
        if new_size == 0 {
            self.deallocate_buffer();
            return true;
        }
        if new_size > self.size {
            error!("cannot set used size higher than original");
            return false;
        }
        if !self.managed {
            error!("cannot set used size on an unmanaged region message");
            return false;
        }

        let old_ptr = match self.manager.address_from_handle(self.handle, self.segment_id) {
            Ok(ptr) => ptr,
            Err(e) => {
                debug!("could not set used size: {e}");
                return false;
            }
        };
        let user_offset = unsafe { ShmHeader::user_offset(old_ptr) } as usize;

        if self
            .manager
            .shrink_in_place(self.handle, user_offset + new_size as usize, self.segment_id)
        {
            self.size = new_size;
            return true;
        }

        // Shrinking can fail due to allocator block granularity. A large
        // unused tail is worth a reallocation; a small one is kept as
        // slack until the message is destroyed.
        if self.size - new_size >= SHRINK_REALLOC_THRESHOLD {
            match self.manager.allocate(new_size as usize, self.alignment) {
                Ok(new_handle) => {
                    let new_handle = new_handle as i64;
                    match self.manager.address_from_handle(new_handle, self.segment_id) {
                        Ok(new_ptr) => {
                            let new_user = unsafe { ShmHeader::user_ptr(new_ptr) };
                            unsafe {
                                std::ptr::copy_nonoverlapping(
                                    ShmHeader::user_ptr(old_ptr),
                                    new_user,
                                    new_size as usize,
                                );
                            }
                            self.manager.deallocate(self.handle, self.segment_id);
                            self.handle = new_handle;
                            self.local_ptr.set(new_user);
                        }
                        Err(e) => {
                            debug!("could not set used size: {e}");
                            self.manager.deallocate(new_handle, self.segment_id);
                        }
                    }
                }
                Err(e) => {
                    debug!("could not reallocate while setting used size, keeping slack: {e}");
                }
            }
        }
        self.size = new_size;
        true
    }

    // --- copy -------------------------------------------------------------

    /// Share the other message's buffer: bumps the managed header refcount
    /// or promotes the region message to a shared refcount object. Never
    /// copies payload bytes. An empty source closes this message.
    pub fn copy_from(&mut self, other: &Message) -> Result<()> {
        if other.handle < 0 {
            self.deallocate_buffer();
            return Ok(());
        }

        if self.handle >= 0 {
            self.deallocate_buffer();
        }

        if other.managed {
            let ptr = self
                .manager
                .address_from_handle(other.handle, other.segment_id)?;
            unsafe { ShmHeader::increment_ref_count(ptr) };
        } else {
            let region = self
                .manager
                .get_region_from_cache(other.region_id)
                .ok_or_else(|| {
                    Error::Transport(format!(
                        "cannot get unmanaged region with id {}",
                        other.region_id
                    ))
                })?;
            if other.shared.get() < 0 {
                // Not yet shared: create the refcount object with count 2.
                other.shared.set(region.make_ref_count(2)?);
            } else {
                region.increment_ref_count(other.shared.get());
            }
            *self.region_ptr.borrow_mut() = Some(region);
        }

        self.size = other.size;
        self.hint = other.hint;
        self.handle = other.handle;
        self.shared.set(other.shared.get());
        self.region_id = other.region_id;
        self.segment_id = other.segment_id;
        self.managed = other.managed;
        self.local_ptr.set(std::ptr::null_mut());
        Ok(())
    }

    // --- reclamation ------------------------------------------------------

    fn release_region_block(&self) {
        let region = self
            .region_ptr
            .borrow()
            .clone()
            .or_else(|| self.manager.get_region_from_cache(self.region_id));
        match region {
            Some(region) => {
                region.release_block(RegionBlock {
                    handle: self.handle,
                    size: self.size,
                    hint: self.hint,
                });
            }
            None => {
                warn!(
                    "region ack queue for id {} no longer exists, not sending ack",
                    self.region_id
                );
            }
        }
    }

    fn deallocate_buffer(&mut self) {
        if self.handle >= 0 && !self.queued {
            if self.managed {
                match self.manager.address_from_handle(self.handle, self.segment_id) {
                    Ok(ptr) => {
                        let prev = unsafe { ShmHeader::decrement_ref_count(ptr) };
                        if prev == 1 {
                            self.manager.deallocate(self.handle, self.segment_id);
                        }
                    }
                    Err(e) => error!("error releasing message buffer: {e}"),
                }
            } else {
                let shared = self.shared.get();
                if shared >= 0 {
                    match self.manager.get_region_from_cache(self.region_id) {
                        Some(region) => {
                            let prev = region.decrement_ref_count(shared);
                            if prev == 1 {
                                region.remove_ref_count(shared);
                                self.release_region_block();
                            }
                        }
                        None => error!(
                            "cannot get unmanaged region with id {}",
                            self.region_id
                        ),
                    }
                } else {
                    self.release_region_block();
                }
            }
        }
        self.handle = -1;
        self.shared.set(-1);
        self.local_ptr.set(std::ptr::null_mut());
        *self.region_ptr.borrow_mut() = None;
        self.size = 0;
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        self.deallocate_buffer();
        self.manager.decrement_msg_counter();
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("size", &self.size)
            .field("handle", &self.handle)
            .field("region_id", &self.region_id)
            .field("segment_id", &self.segment_id)
            .field("managed", &self.managed)
            .field("queued", &self.queued)
            .finish()
    }
}
