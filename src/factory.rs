// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Transport factory: the user-facing root of the shared memory transport.
// Mints messages, sockets, pollers and unmanaged regions; owns the manager
// and tears the session attachment down on drop.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use log::debug;

use crate::channel::Channel;
use crate::common::{RegionBulkCallback, RegionCallback, RegionEventCallback, RegionInfo};
use crate::config::{RegionConfig, ShmOptions};
use crate::errors::Result;
use crate::manager::Manager;
use crate::message::Message;
use crate::poller::Poller;
use crate::region::UnmanagedRegion;
use crate::socket::Socket;

/// Factory for the shared memory transport of one device.
pub struct TransportFactory {
    device_id: String,
    manager: Arc<Manager>,
}

impl TransportFactory {
    /// Attach to (or create) the session described by `options`.
    pub fn new(id: &str, options: &ShmOptions) -> Result<Self> {
        debug!("transport: using shared memory, session '{}'", options.session);
        if options.io_threads != 1 {
            debug!(
                "io-threads is {}; the host-local stream layer runs no io thread pool",
                options.io_threads
            );
        }
        let manager = Manager::new(id, options)?;
        Ok(Self {
            device_id: id.to_string(),
            manager,
        })
    }

    pub fn id(&self) -> &str {
        &self.device_id
    }

    /// Session shm id of this factory.
    pub fn shm_id(&self) -> &str {
        self.manager.shm_id()
    }

    /// The manager backing this factory.
    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    // --- messages ---------------------------------------------------------

    /// An empty message.
    pub fn create_message(&self) -> Message {
        Message::new(Arc::clone(&self.manager))
    }

    /// A message owning `size` fresh bytes in the managed segment.
    pub fn create_message_with_size(&self, size: usize) -> Result<Message> {
        Message::with_size(Arc::clone(&self.manager), size)
    }

    /// A message owning `size` fresh bytes at `alignment`.
    pub fn create_message_with_alignment(&self, size: usize, alignment: usize) -> Result<Message> {
        Message::with_size_aligned(Arc::clone(&self.manager), size, alignment)
    }

    /// A message initialized with a copy of `data`.
    pub fn create_message_from_bytes(&self, data: &[u8]) -> Result<Message> {
        Message::from_bytes(Arc::clone(&self.manager), data)
    }

    /// An unmanaged message over user-owned bytes inside `region`.
    pub fn create_message_in_region(
        &self,
        region: &RegionHandle,
        data: *mut u8,
        size: usize,
        hint: u64,
    ) -> Result<Message> {
        Message::from_region(Arc::clone(&self.manager), region.region(), data, size, hint)
    }

    // --- sockets & pollers ------------------------------------------------

    /// A socket of the given pattern ("push", "pull", "req", "rep",
    /// "pair"); `pub`/`sub` are rejected on this transport.
    pub fn create_socket(&self, socket_type: &str, name: &str) -> Result<Socket> {
        Socket::new(
            Arc::clone(&self.manager),
            socket_type,
            name,
            &self.device_id,
        )
    }

    /// A poller over the sub-sockets of the given channels.
    pub fn create_poller(&self, channels: &[&Channel]) -> Result<Poller> {
        Poller::new(channels)
    }

    /// A poller over `channel_list` entries of a channel map.
    pub fn create_poller_from_map(
        &self,
        channels: &HashMap<String, Channel>,
        channel_list: &[&str],
    ) -> Result<Poller> {
        Poller::from_map(channels, channel_list)
    }

    // --- unmanaged regions ------------------------------------------------

    /// Create an unmanaged region of `size` bytes. The per-block or bulk
    /// callback receives release notifications; the returned handle
    /// removes the region when dropped.
    pub fn create_unmanaged_region(
        &self,
        size: u64,
        callback: Option<RegionCallback>,
        bulk_callback: Option<RegionBulkCallback>,
        config: RegionConfig,
    ) -> Result<RegionHandle> {
        let (region, id) = self
            .manager
            .create_region(size, callback, bulk_callback, config)?;
        Ok(RegionHandle {
            manager: Arc::clone(&self.manager),
            region,
            id,
        })
    }

    pub fn subscribe_to_region_events(&self, callback: RegionEventCallback) {
        self.manager.subscribe_to_region_events(callback);
    }

    pub fn subscribed_to_region_events(&self) -> bool {
        self.manager.subscribed_to_region_events()
    }

    pub fn unsubscribe_from_region_events(&self) {
        self.manager.unsubscribe_from_region_events();
    }

    pub fn get_region_info(&self) -> Vec<RegionInfo> {
        self.manager.get_region_info()
    }

    // --- control ----------------------------------------------------------

    /// Set the sticky interrupt flag; blocking transfers return
    /// `Interrupted` within the loop period.
    pub fn interrupt(&self) {
        self.manager.interrupt();
    }

    pub fn resume(&self) {
        self.manager.resume();
    }

    /// Check the alive-message invariant between device runs.
    pub fn reset(&self) -> Result<()> {
        self.manager.reset()
    }
}

impl Drop for TransportFactory {
    fn drop(&mut self) {
        debug!("destroying shared memory transport...");
        self.manager.shutdown();
    }
}

/// Owning handle of a created unmanaged region. Dropping it stops the ack
/// machinery (draining for the linger window) and removes the region from
/// the session.
pub struct RegionHandle {
    manager: Arc<Manager>,
    region: Arc<UnmanagedRegion>,
    id: u16,
}

impl RegionHandle {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn region(&self) -> &Arc<UnmanagedRegion> {
        &self.region
    }
}

impl Deref for RegionHandle {
    type Target = UnmanagedRegion;

    fn deref(&self) -> &Self::Target {
        &self.region
    }
}

impl Drop for RegionHandle {
    fn drop(&mut self) {
        self.manager.remove_region(self.id);
    }
}
