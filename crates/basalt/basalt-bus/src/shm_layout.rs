//! Shared memory layout of a topic region.
//!
//! Every process attached to a topic maps the same object and interprets it
//! through these `#[repr(C)]` structs, so the layout is part of the wire
//! contract between processes built from the same library version.
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        TopicHeader (64B)                       │
//! │  magic │ version │ capacity │ data_len │ lifetime │ state │pad │
//! ├────────────────────────────────────────────────────────────────┤
//! │                        SyncBlock                               │
//! │  pthread mutex (robust, process-shared)                        │
//! │  pthread cond  (process-shared, CLOCK_MONOTONIC)               │
//! │  cursor: SeqlockSlot<Cursor>                                   │
//! │  lifecycle (refcount | retired) │ writer_pid │ heartbeat │ ... │
//! │  attachments[MAX_ATTACHMENTS] (pids)                           │
//! ├────────────────────────────────────────────────────────────────┤
//! │                   ring bytes (data_len)                        │
//! │  [frame][frame][frame]...........................[pad]         │
//! └────────────────────────────────────────────────────────────────┘
//! ```

use crate::frame::FRAME_ALIGN;
use crate::options::Lifetime;
use crate::ring::RingConfig;
use crate::seqlock::SeqlockSlot;
use crate::sync::{SharedCondvar, SharedMutex};
use std::io;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Magic number identifying a topic region: ASCII "BASALTTP".
pub const TOPIC_MAGIC: u64 = 0x4241_5341_4C54_5450;

/// Increment on any incompatible change to the structs below.
pub const LAYOUT_VERSION: u64 = 1;

/// Number of attachment slots; bounds the processes attached to one topic.
pub const MAX_ATTACHMENTS: usize = 64;

pub(crate) const STATE_READY: u32 = 1;

/// Set in [`SyncBlock::lifecycle`] once the region must not gain attachments.
pub(crate) const RETIRED_BIT: u64 = 1 << 32;
pub(crate) const REFCOUNT_MASK: u64 = 0xFFFF_FFFF;

/// Ring cursor. All positions are monotonically increasing byte offsets; the
/// offset into the ring is `pos % data_len`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cursor {
    /// Position one past the last committed frame.
    pub head_pos: u64,
    /// Position of the oldest frame still in the ring.
    pub tail_pos: u64,
    /// Sequence the next published frame will get.
    pub next_seq: u64,
    /// Sequence of the frame at `tail_pos`.
    pub tail_seq: u64,
}

/// Cross-process synchronization state.
#[repr(C, align(64))]
pub struct SyncBlock {
    pub(crate) mutex: SharedMutex,
    pub(crate) cond: SharedCondvar,
    pub(crate) cursor: SeqlockSlot<Cursor>,
    /// Low 32 bits: count of attached mappings. Bit 32: retired.
    pub(crate) lifecycle: AtomicU64,
    /// Pid holding the exclusive publisher claim, 0 if none.
    pub(crate) writer_pid: AtomicU32,
    _pad0: u32,
    /// Wall-clock nanoseconds of the last publish, 0 before the first.
    pub(crate) last_publish_ns: AtomicU64,
    /// Count of crash recoveries performed on this region.
    pub(crate) recoveries: AtomicU64,
    pub(crate) attachments: [AtomicU32; MAX_ATTACHMENTS],
}

#[repr(C, align(64))]
pub struct TopicHeader {
    pub magic: u64,
    pub version: u64,
    /// Total size of the region in bytes.
    pub capacity: u64,
    /// Size of the ring area following the header.
    pub data_len: u64,
    pub lifetime: u32,
    pub(crate) state: AtomicU32,
    _pad0: [u8; 24],
    pub(crate) sync: SyncBlock,
}

/// Bytes occupied by the header in front of the ring.
#[inline(always)]
pub const fn header_len() -> usize {
    size_of::<TopicHeader>()
}

impl TopicHeader {
    /// Writes a fresh header at `this`, leaving `state` not ready.
    ///
    /// # Safety
    /// `this` must point to a zero-filled, writable region of at least
    /// `cfg.capacity` bytes that no other process uses yet.
    pub(crate) unsafe fn init(this: *mut Self, cfg: RingConfig, lifetime: Lifetime) -> io::Result<()> {
        unsafe {
            ptr::addr_of_mut!((*this).magic).write(TOPIC_MAGIC);
            ptr::addr_of_mut!((*this).version).write(LAYOUT_VERSION);
            ptr::addr_of_mut!((*this).capacity).write(cfg.capacity as u64);
            ptr::addr_of_mut!((*this).data_len).write(cfg.data_len() as u64);
            ptr::addr_of_mut!((*this).lifetime).write(lifetime.as_raw());

            let sync = ptr::addr_of_mut!((*this).sync);
            SharedMutex::init(ptr::addr_of_mut!((*sync).mutex))?;
            SharedCondvar::init(ptr::addr_of_mut!((*sync).cond))?;
            SeqlockSlot::init(ptr::addr_of_mut!((*sync).cursor), Cursor::default());
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_READY
    }

    #[inline]
    pub(crate) fn mark_ready(&self) {
        self.state.store(STATE_READY, Ordering::Release);
    }

    /// Validates a header written by another process against the size of the
    /// object it was found in.
    pub fn validate(&self, mapped_len: usize) -> Result<(), &'static str> {
        if self.magic != TOPIC_MAGIC {
            return Err("Bad magic");
        }
        if self.version != LAYOUT_VERSION {
            return Err("Wrong version");
        }
        if self.capacity != mapped_len as u64 {
            return Err("Capacity does not match object size");
        }
        if self.capacity <= header_len() as u64 || self.data_len != self.capacity - header_len() as u64 {
            return Err("Ring length does not match capacity");
        }
        if self.data_len % FRAME_ALIGN as u64 != 0 {
            return Err("Ring length is not frame aligned");
        }
        if Lifetime::from_raw(self.lifetime).is_none() {
            return Err("Unknown lifetime policy");
        }
        Ok(())
    }

    #[inline]
    pub fn lifetime(&self) -> Lifetime {
        Lifetime::from_raw(self.lifetime).unwrap_or_default()
    }
}
