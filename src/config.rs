// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Transport configuration. Command-line and config-file parsing live
// outside the transport; these structs carry the recognized options with
// their defaults and are filled by whoever drives the device.

use std::path::PathBuf;

use crate::common::{
    AllocationAlgorithm, DEFAULT_BAD_ALLOC_INTERVAL_MS, DEFAULT_LINGER_MS, DEFAULT_RC_SEGMENT_SIZE,
};

/// Options of the shared memory transport factory.
#[derive(Clone, Debug)]
pub struct ShmOptions {
    /// Human session name; the shm id is derived from it and the uid.
    pub session: String,
    /// Size of the managed segment on first creation.
    pub segment_size: usize,
    /// Managed segment selector.
    pub segment_id: u16,
    /// Auto-launch the monitor process when absent.
    pub monitor: bool,
    /// Lock managed segment pages in RAM on every open.
    pub mlock_segment: bool,
    /// Lock managed segment pages in RAM on the creation path only.
    pub mlock_segment_on_creation: bool,
    /// Zero the segment's free memory on every open.
    pub zero_segment: bool,
    /// Zero the segment's free memory on the creation path only.
    pub zero_segment_on_creation: bool,
    /// Allocation algorithm requested for the managed segment.
    pub allocation: AllocationAlgorithm,
    /// When false, allocation retries forever instead of failing.
    pub throw_bad_alloc: bool,
    /// Allocation retry attempts; -1 retries until interruption.
    pub bad_alloc_max_attempts: i32,
    /// Spacing between allocation retries, in ms.
    pub bad_alloc_attempt_interval_ms: u64,
    /// When true, the last-out factory skips session cleanup.
    pub no_cleanup: bool,
    /// Minimum bytes per metadata wire message (0 = exact header size).
    pub metadata_msg_size: usize,
    /// Io-thread count of the underlying transport.
    pub io_threads: usize,
}

impl Default for ShmOptions {
    fn default() -> Self {
        Self {
            session: "default".to_string(),
            segment_size: 2_000_000_000,
            segment_id: 0,
            monitor: false,
            mlock_segment: false,
            mlock_segment_on_creation: false,
            zero_segment: false,
            zero_segment_on_creation: false,
            allocation: AllocationAlgorithm::RbtreeBestFit,
            throw_bad_alloc: true,
            bad_alloc_max_attempts: 1,
            bad_alloc_attempt_interval_ms: DEFAULT_BAD_ALLOC_INTERVAL_MS,
            no_cleanup: false,
            metadata_msg_size: 0,
            io_threads: 1,
        }
    }
}

impl ShmOptions {
    pub fn with_session(session: &str) -> Self {
        Self {
            session: session.to_string(),
            ..Self::default()
        }
    }

    /// Effective retry attempt count: `throw_bad_alloc == false` overrides
    /// it and retries until interruption.
    pub fn effective_bad_alloc_attempts(&self) -> i32 {
        if self.throw_bad_alloc {
            self.bad_alloc_max_attempts
        } else {
            -1
        }
    }
}

/// Per-region configuration for `create_unmanaged_region`.
#[derive(Clone, Debug)]
pub struct RegionConfig {
    /// Explicit region id; issued from the session counter when absent.
    pub id: Option<u16>,
    /// Region size in bytes (controller side).
    pub size: u64,
    /// Opaque user flags stored in the region registry.
    pub user_flags: u64,
    /// Extra flags OR-ed into the mmap call.
    pub creation_flags: i32,
    /// Directory for a file-backed region; shm-object backed when absent.
    pub path: Option<PathBuf>,
    /// Remove the shared objects when the controller is destroyed.
    pub remove_on_destruction: bool,
    /// Drain window of the ack threads on shutdown, in ms.
    pub linger_ms: u32,
    /// Size of the auxiliary refcount segment.
    pub rc_segment_size: u64,
    /// Lock the region pages in RAM after mapping.
    pub lock_memory: bool,
    /// Zero the region after mapping.
    pub zero_memory: bool,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            id: None,
            size: 0,
            user_flags: 0,
            creation_flags: 0,
            path: None,
            remove_on_destruction: true,
            linger_ms: DEFAULT_LINGER_MS,
            rc_segment_size: DEFAULT_RC_SEGMENT_SIZE,
            lock_memory: false,
            zero_memory: false,
        }
    }
}
