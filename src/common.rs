// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared wire types and session-wide constants.
// `MetaHeader` and `RegionBlock` are the only structures that cross a
// process boundary outside of shared memory itself; both have a fixed
// #[repr(C)] layout that is asserted at compile time.

/// Size of the management segment (`fmq_<S>_mng`) on first creation.
pub const MANAGEMENT_SEGMENT_SIZE: usize = 6_553_600;

/// Number of `RegionBlock`s per ack-queue message.
pub const ACK_BUNCH_SIZE: usize = 256;

/// Number of messages the region ack queue can hold.
pub const ACK_QUEUE_CAPACITY: usize = 1024;

/// Soft-blocking loop period of the socket transfer path, in ms. The
/// interrupt flag is observed at this granularity.
pub const SOCKET_LOOP_PERIOD_MS: u64 = 100;

/// Default drain window for the region ack threads on shutdown, in ms.
pub const DEFAULT_LINGER_MS: u32 = 100;

/// Default spacing between allocation retries when the segment is full.
pub const DEFAULT_BAD_ALLOC_INTERVAL_MS: u64 = 50;

/// Heartbeat counter bump period of a live factory.
pub const HEARTBEAT_PERIOD_MS: u64 = 100;

/// Heartbeat-stasis window after which the monitor declares a session dead.
pub const DEFAULT_MONITOR_TIMEOUT_MS: u64 = 2000;

/// Monitor main-loop period.
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 100;

/// Default size of the per-region refcount sub-segment (`fmq_<S>_rrc_<id>`).
pub const DEFAULT_RC_SEGMENT_SIZE: u64 = 1 << 20;

/// First id handed out for unmanaged regions.
pub const FIRST_REGION_ID: u64 = 1024;

/// The metadata descriptor that travels on a socket in place of payload
/// bytes. Field order is normative; the struct is exactly 40 bytes and
/// receivers refuse anything smaller.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaHeader {
    pub size: u64,
    pub hint: u64,
    /// Allocator offset (managed) or region offset (unmanaged).
    pub handle: i64,
    /// Handle into the region refcount sub-segment, or -1.
    pub shared: i64,
    /// 0 = managed segment, else unmanaged-region id.
    pub region_id: u16,
    pub segment_id: u16,
    pub managed: u8,
    pub _pad: [u8; 3],
}

impl MetaHeader {
    pub const WIRE_SIZE: usize = 40;

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.size.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.hint.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.handle.to_ne_bytes());
        buf[24..32].copy_from_slice(&self.shared.to_ne_bytes());
        buf[32..34].copy_from_slice(&self.region_id.to_ne_bytes());
        buf[34..36].copy_from_slice(&self.segment_id.to_ne_bytes());
        buf[36] = self.managed;
        buf[37..40].fill(0);
    }

    pub fn read_from(buf: &[u8]) -> Self {
        Self {
            size: u64::from_ne_bytes(buf[0..8].try_into().unwrap()),
            hint: u64::from_ne_bytes(buf[8..16].try_into().unwrap()),
            handle: i64::from_ne_bytes(buf[16..24].try_into().unwrap()),
            shared: i64::from_ne_bytes(buf[24..32].try_into().unwrap()),
            region_id: u16::from_ne_bytes(buf[32..34].try_into().unwrap()),
            segment_id: u16::from_ne_bytes(buf[34..36].try_into().unwrap()),
            managed: buf[36],
            _pad: [0; 3],
        }
    }
}

const _: () = assert!(std::mem::size_of::<MetaHeader>() == MetaHeader::WIRE_SIZE);

/// Release notification for one unmanaged-region buffer. Enqueued on the
/// region ack queue by the last owner of a region message; consumed by the
/// region creator's callback.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionBlock {
    pub handle: i64,
    pub size: u64,
    pub hint: u64,
}

impl RegionBlock {
    pub const WIRE_SIZE: usize = 24;

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.handle.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.size.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.hint.to_ne_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Self {
        Self {
            handle: i64::from_ne_bytes(buf[0..8].try_into().unwrap()),
            size: u64::from_ne_bytes(buf[8..16].try_into().unwrap()),
            hint: u64::from_ne_bytes(buf[16..24].try_into().unwrap()),
        }
    }
}

const _: () = assert!(std::mem::size_of::<RegionBlock>() == RegionBlock::WIRE_SIZE);

/// Allocation strategy of a managed segment. The names match the
/// configuration strings accepted by the C++ transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationAlgorithm {
    RbtreeBestFit,
    SimpleSeqFit,
}

impl AllocationAlgorithm {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rbtree_best_fit" => Some(Self::RbtreeBestFit),
            "simple_seq_fit" => Some(Self::SimpleSeqFit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RbtreeBestFit => "rbtree_best_fit",
            Self::SimpleSeqFit => "simple_seq_fit",
        }
    }

    pub(crate) fn from_u32(v: u32) -> Self {
        if v == 1 {
            Self::SimpleSeqFit
        } else {
            Self::RbtreeBestFit
        }
    }

    pub(crate) fn as_u32(&self) -> u32 {
        match self {
            Self::RbtreeBestFit => 0,
            Self::SimpleSeqFit => 1,
        }
    }
}

impl Default for AllocationAlgorithm {
    fn default() -> Self {
        Self::RbtreeBestFit
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionEvent {
    Created,
    Destroyed,
}

/// Snapshot of one managed segment or unmanaged region, as reported by
/// `TransportFactory::get_region_info` and region-event callbacks.
#[derive(Clone, Debug)]
pub struct RegionInfo {
    pub id: u16,
    pub managed: bool,
    pub event: RegionEvent,
    /// Local mapping address, null when the region is already destroyed.
    pub ptr: *mut u8,
    pub size: u64,
    pub flags: u64,
}

/// One released region buffer, resolved to a local pointer for the
/// controller's callback.
#[derive(Clone, Copy, Debug)]
pub struct RegionBlockRef {
    pub ptr: *mut u8,
    pub size: u64,
    pub hint: u64,
}

pub type RegionCallback = Box<dyn Fn(&RegionBlockRef) + Send>;
pub type RegionBulkCallback = Box<dyn Fn(&[RegionBlockRef]) + Send>;
pub type RegionEventCallback = Box<dyn Fn(&RegionInfo) + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_header_roundtrip() {
        let meta = MetaHeader {
            size: 1000,
            hint: 42,
            handle: 4096,
            shared: -1,
            region_id: 3,
            segment_id: 1,
            managed: 0,
            _pad: [0; 3],
        };
        let mut buf = [0u8; MetaHeader::WIRE_SIZE];
        meta.write_to(&mut buf);
        assert_eq!(MetaHeader::read_from(&buf), meta);
    }

    #[test]
    fn region_block_roundtrip() {
        let block = RegionBlock {
            handle: 2_000_000,
            size: 512,
            hint: 7,
        };
        let mut buf = [0u8; RegionBlock::WIRE_SIZE];
        block.write_to(&mut buf);
        assert_eq!(RegionBlock::read_from(&buf), block);
    }

    #[test]
    fn algorithm_strings() {
        assert_eq!(
            AllocationAlgorithm::parse("rbtree_best_fit"),
            Some(AllocationAlgorithm::RbtreeBestFit)
        );
        assert_eq!(
            AllocationAlgorithm::parse("simple_seq_fit"),
            Some(AllocationAlgorithm::SimpleSeqFit)
        );
        assert_eq!(AllocationAlgorithm::parse("buddy"), None);
    }
}
