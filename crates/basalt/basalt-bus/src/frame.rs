//! Frame encoding inside the ring.
//!
//! ```text
//! ┌──────────────┬──────────────┬────────────────┬──────────────────────────┐
//! │ len: u32     │ kind: u32    │ seq: u64       │ payload (len bytes)      │
//! │              │ DATA | PAD   │                │ + zero padding to 16     │
//! └──────────────┴──────────────┴────────────────┴──────────────────────────┘
//! ```
//!
//! Every frame starts on a [`FRAME_ALIGN`] boundary. A `PAD` frame covers the
//! unused tail of the ring before a wrap; its `len` is the number of bytes it
//! covers (header included) and its `seq` is meaningless.

use std::mem::size_of;

/// Frame start alignment; equals the header size so that any leftover room at
/// the ring's end can always hold a padding header.
pub const FRAME_ALIGN: usize = 16;

/// Size of [`FrameHeader`] in bytes.
pub const FRAME_HEADER_LEN: usize = size_of::<FrameHeader>();

pub(crate) const KIND_DATA: u32 = 0x4441_5441; // "DATA"
pub(crate) const KIND_PAD: u32 = 0x5041_4444; // "PADD"

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub len: u32,
    pub kind: u32,
    pub seq: u64,
}

impl FrameHeader {
    #[inline]
    pub fn data(len: u32, seq: u64) -> Self {
        Self {
            len,
            kind: KIND_DATA,
            seq,
        }
    }

    #[inline]
    pub fn padding(covered: u32) -> Self {
        Self {
            len: covered,
            kind: KIND_PAD,
            seq: 0,
        }
    }
}

/// A message copied out of the ring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Position of the message in the topic's total order.
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl Message {
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }
}

/// Rounds `n` up to the next multiple of [`FRAME_ALIGN`].
#[inline(always)]
pub const fn align_up(n: usize) -> usize {
    (n + FRAME_ALIGN - 1) & !(FRAME_ALIGN - 1)
}

/// Bytes a data frame with a `payload_len`-byte payload occupies in the ring.
#[inline(always)]
pub const fn frame_len(payload_len: usize) -> usize {
    align_up(FRAME_HEADER_LEN + payload_len)
}
