//! Byte ring of variable-length frames.
//!
//! Positions are monotonically increasing `u64` byte counts; `pos % data_len`
//! is the offset into the ring. The ring holds the frames between the cursor's
//! `tail_pos` and `head_pos`.
//!
//! # Writing (writer exclusion held)
//! 1. If the frame does not fit before the ring end, a padding frame covers the
//!    rest and the frame starts at offset 0.
//! 2. Oldest frames are evicted until `head - tail <= data_len`; the advanced
//!    tail is published *before* any evicted byte is overwritten.
//! 3. Header and payload are copied, then head and next sequence are published.
//!
//! # Reading (lock-free)
//! A reader snapshots the cursor, copies frames between its position and the
//! snapshot's head, then snapshots again. Any copied frame that now lies behind
//! the tail may have been overwritten during the copy and is rejected as
//! [`BusError::SequenceTooOld`]. Frames are evicted oldest-first, so checking
//! the first copied frame covers the whole batch.

use crate::error::{BusError, Result};
use crate::frame::{
    FRAME_ALIGN, FRAME_HEADER_LEN, FrameHeader, KIND_DATA, KIND_PAD, Message, frame_len,
};
use crate::shm_layout::{Cursor, SyncBlock, header_len};
use crate::sync::WriterGuard;
use std::ptr;
use std::sync::atomic::{Ordering, fence};

/// Geometry of a topic region.
///
/// `capacity` is the total size of the shared object, header included. It must
/// be a multiple of the frame alignment (16 bytes) so that the ring length is
/// too.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingConfig {
    pub capacity: usize,
}

impl RingConfig {
    /// Creates a configuration for a region of `capacity` bytes.
    ///
    /// # Panics
    /// Panics if the capacity is rejected by [`try_new`](Self::try_new).
    ///
    /// # Example
    /// ```
    /// use basalt_bus::RingConfig;
    /// let cfg = RingConfig::new(1 << 16);
    /// assert!(cfg.max_payload() < cfg.capacity);
    /// ```
    pub fn new(capacity: usize) -> Self {
        match Self::try_new(capacity) {
            Ok(cfg) => cfg,
            Err(e) => panic!("{e}"),
        }
    }

    pub fn try_new(capacity: usize) -> Result<Self> {
        if capacity % FRAME_ALIGN != 0 {
            return Err(BusError::InvalidCapacity {
                capacity,
                reason: "must be a multiple of 16 bytes",
            });
        }
        if capacity < header_len() + 2 * FRAME_ALIGN {
            return Err(BusError::InvalidCapacity {
                capacity,
                reason: "too small for the header and one frame",
            });
        }
        if capacity - header_len() > u32::MAX as usize {
            return Err(BusError::InvalidCapacity {
                capacity,
                reason: "ring must not exceed 4 GiB",
            });
        }
        Ok(Self { capacity })
    }

    /// Smallest configuration whose ring accepts a `max_payload`-byte message.
    pub fn for_max_payload(max_payload: usize) -> Self {
        Self::new(header_len() + frame_len(max_payload))
    }

    /// Length of the ring area.
    #[inline]
    pub fn data_len(&self) -> usize {
        self.capacity - header_len()
    }

    /// Largest payload a single message may carry.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.data_len() - FRAME_HEADER_LEN
    }
}

/// Converts a ring position to a byte offset into the ring area.
///
/// ```text
/// data_len = 512
/// pos =    0 →   0
/// pos =  496 → 496
/// pos =  512 →   0  (wraps around)
/// pos = 1040 →  16
/// ```
#[inline(always)]
pub fn pos_to_offset(pos: u64, data_len: u64) -> u64 {
    pos % data_len
}

/// Where a reader resumes: the next sequence and, when known, its position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Position {
    pub seq: u64,
    pub pos: Option<u64>,
}

impl Position {
    pub fn at_head(c: &Cursor) -> Self {
        Self {
            seq: c.next_seq,
            pos: Some(c.head_pos),
        }
    }

    pub fn at_tail(c: &Cursor) -> Self {
        Self {
            seq: c.tail_seq,
            pos: Some(c.tail_pos),
        }
    }

    pub fn at_seq(seq: u64) -> Self {
        Self { seq, pos: None }
    }
}

pub(crate) struct Batch {
    pub messages: Vec<Message>,
    pub next: Position,
}

impl Batch {
    fn empty(at: Position) -> Self {
        Self {
            messages: Vec::new(),
            next: at,
        }
    }
}

/// View over the ring area of a mapped region.
pub(crate) struct Ring<'a> {
    sync: &'a SyncBlock,
    data: *mut u8,
    data_len: u64,
}

impl<'a> Ring<'a> {
    /// # Safety
    /// `data` must point to `data_len` bytes, 16-byte aligned, that stay mapped
    /// for `'a` and belong to the same region as `sync`.
    pub(crate) unsafe fn new(sync: &'a SyncBlock, data: *mut u8, data_len: u64) -> Self {
        Self {
            sync,
            data,
            data_len,
        }
    }

    #[inline]
    pub(crate) fn max_payload(&self) -> usize {
        self.data_len as usize - FRAME_HEADER_LEN
    }

    #[inline(always)]
    fn header_at(&self, offset: u64) -> FrameHeader {
        // SAFETY: offsets are < data_len and FRAME_ALIGN aligned.
        unsafe { (self.data.add(offset as usize) as *const FrameHeader).read_volatile() }
    }

    #[inline(always)]
    fn put_header(&self, offset: u64, header: FrameHeader) {
        unsafe { (self.data.add(offset as usize) as *mut FrameHeader).write_volatile(header) }
    }

    /// Appends one frame and returns its sequence number.
    pub(crate) fn write(&self, guard: &WriterGuard<'_>, payload: &[u8]) -> Result<u64> {
        let max = self.max_payload();
        if payload.len() > max {
            return Err(BusError::BufferTooSmall {
                len: payload.len(),
                max,
            });
        }
        debug_assert_eq!(guard.data_len(), self.data_len);

        let flen = frame_len(payload.len()) as u64;
        let c = guard.cursor();
        let offset = pos_to_offset(c.head_pos, self.data_len);
        let room = self.data_len - offset;
        let pad = if flen > room { room } else { 0 };
        let new_head = c.head_pos + pad + flen;

        let mut evicted = c;
        while new_head - evicted.tail_pos > self.data_len {
            let toff = pos_to_offset(evicted.tail_pos, self.data_len);
            let troom = self.data_len - toff;
            let hdr = self.header_at(toff);
            let step = match hdr.kind {
                KIND_PAD => Some((troom, 0)),
                KIND_DATA if frame_len(hdr.len as usize) as u64 <= troom => {
                    Some((frame_len(hdr.len as usize) as u64, 1))
                }
                _ => None,
            };
            match step {
                Some((bytes, frames)) if evicted.tail_pos < c.head_pos => {
                    evicted.tail_pos += bytes;
                    evicted.tail_seq += frames;
                }
                // everything committed is gone (or unreadable): restart at the new frame
                _ => {
                    evicted.tail_pos = c.head_pos + pad;
                    evicted.tail_seq = c.next_seq;
                    break;
                }
            }
        }
        if evicted != c {
            guard.store_cursor(evicted);
            fence(Ordering::SeqCst);
        }

        if pad > 0 {
            self.put_header(offset, FrameHeader::padding(pad as u32));
        }
        let foff = pos_to_offset(c.head_pos + pad, self.data_len);
        let seq = c.next_seq;
        self.put_header(foff, FrameHeader::data(payload.len() as u32, seq));
        // SAFETY: foff + flen <= data_len by construction of `pad`.
        unsafe {
            ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.data.add(foff as usize + FRAME_HEADER_LEN),
                payload.len(),
            );
        }

        guard.store_cursor(Cursor {
            head_pos: new_head,
            next_seq: seq + 1,
            ..evicted
        });
        Ok(seq)
    }

    /// Copies every frame from `from.seq` up to the current head.
    pub(crate) fn read(&self, from: Position) -> Result<Batch> {
        let Some(c) = self.sync.snapshot() else {
            return Ok(Batch::empty(from));
        };
        if from.seq < c.tail_seq {
            return Err(BusError::SequenceTooOld {
                requested: from.seq,
                oldest: c.tail_seq,
            });
        }
        if from.seq >= c.next_seq {
            return Ok(Batch::empty(from));
        }

        let (mut seq, mut pos) = match from.pos {
            Some(p) if p >= c.tail_pos && p <= c.head_pos => (from.seq, p),
            _ => (c.tail_seq, c.tail_pos),
        };
        let mut messages = Vec::new();
        let mut first_pos = None;

        while pos < c.head_pos && seq < c.next_seq {
            let off = pos_to_offset(pos, self.data_len);
            let room = self.data_len - off;
            let hdr = self.header_at(off);
            if hdr.kind == KIND_PAD && u64::from(hdr.len) == room {
                pos += room;
                continue;
            }
            let flen = frame_len(hdr.len as usize) as u64;
            if hdr.kind != KIND_DATA || hdr.seq != seq || flen > room || pos + flen > c.head_pos {
                // overwritten under us; settled by the validation below
                break;
            }
            if seq >= from.seq {
                let mut payload = vec![0u8; hdr.len as usize];
                unsafe {
                    ptr::copy_nonoverlapping(
                        self.data.add(off as usize + FRAME_HEADER_LEN),
                        payload.as_mut_ptr(),
                        payload.len(),
                    );
                }
                first_pos.get_or_insert(pos);
                messages.push(Message { seq, payload });
            }
            pos += flen;
            seq += 1;
        }

        fence(Ordering::Acquire);
        let Some(after) = self.sync.snapshot() else {
            return Ok(Batch::empty(from));
        };
        let overwritten = match first_pos {
            Some(p) => p < after.tail_pos,
            None => from.seq < after.tail_seq,
        };
        if overwritten {
            return Err(BusError::SequenceTooOld {
                requested: from.seq,
                oldest: after.tail_seq,
            });
        }
        if messages.is_empty() {
            return Ok(Batch::empty(from));
        }
        Ok(Batch {
            messages,
            next: Position {
                seq,
                pos: Some(pos),
            },
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::HeapRegion;
    use super::*;

    #[test]
    fn config_rejects_unaligned_and_tiny_capacities() {
        assert!(RingConfig::try_new(header_len() + 17).is_err());
        assert!(RingConfig::try_new(header_len()).is_err());
        assert!(RingConfig::try_new(header_len() + 32).is_ok());
    }

    #[test]
    fn for_max_payload_fits_exactly_aligned_payloads() {
        let cfg = RingConfig::for_max_payload(1024);
        assert_eq!(cfg.max_payload(), 1024);
    }

    #[test]
    fn frames_are_read_back_in_order() {
        let region = HeapRegion::new(4096);
        assert_eq!(region.publish(b"a").unwrap(), 0);
        assert_eq!(region.publish(b"bb").unwrap(), 1);
        assert_eq!(region.publish(b"ccc").unwrap(), 2);

        let all = region.read_all(0).unwrap();
        assert_eq!(all, vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]);
        assert_eq!(region.read_all(2).unwrap(), vec![b"ccc".to_vec()]);
        assert!(region.read_all(3).unwrap().is_empty());
        assert!(region.read_all(99).unwrap().is_empty());
    }

    #[test]
    fn payload_at_usable_capacity_succeeds_and_one_more_byte_fails() {
        let region = HeapRegion::new(512);
        let max = region.cfg.max_payload();
        assert_eq!(max, 512 - FRAME_HEADER_LEN);

        region.publish(b"small").unwrap();
        let seq = region.publish(&vec![7u8; max]).unwrap();
        let err = region.publish(&vec![7u8; max + 1]).unwrap_err();
        assert!(matches!(err, BusError::BufferTooSmall { len, max: m } if len == max + 1 && m == max));

        // the full-size frame evicted everything before it
        let c = region.cursor();
        assert_eq!(c.tail_seq, seq);
        assert_eq!(region.read_all(seq).unwrap(), vec![vec![7u8; max]]);
    }

    #[test]
    fn wrapping_writes_padding_and_keeps_frames_contiguous() {
        // 5 frames of 96 bytes fill 480 of 512 bytes; the 6th needs a wrap
        let region = HeapRegion::new(512);
        for i in 0..6u8 {
            region.publish(&[i; 80]).unwrap();
        }
        let c = region.cursor();
        assert_eq!(c.next_seq, 6);
        // pad (32) + frame (96) pushed the head to 608; the first frame was evicted
        assert_eq!(c.head_pos, 608);
        assert_eq!(c.tail_seq, 1);

        let got = region.read_all(1).unwrap();
        assert_eq!(got.len(), 5);
        for (i, payload) in got.iter().enumerate() {
            assert_eq!(payload, &vec![i as u8 + 1; 80]);
        }
    }

    #[test]
    fn overwritten_sequence_reports_oldest_available() {
        let region = HeapRegion::new(512);
        for i in 0..40u32 {
            region.publish(&i.to_le_bytes()).unwrap();
        }
        let oldest = region.cursor().tail_seq;
        assert!(oldest > 0);

        match region.read_all(0) {
            Err(BusError::SequenceTooOld { requested, oldest: o }) => {
                assert_eq!(requested, 0);
                assert_eq!(o, oldest);
            }
            other => panic!("expected SequenceTooOld, got {other:?}"),
        }

        let rest = region.read_all(oldest).unwrap();
        assert_eq!(rest.len() as u64, 40 - oldest);
        assert_eq!(rest.last().unwrap(), &39u32.to_le_bytes().to_vec());
    }

    #[test]
    fn position_hint_resumes_across_wraps() {
        let region = HeapRegion::new(512);
        let ring = region.ring();
        let mut at = Position::at_head(&region.cursor());
        let mut seen = Vec::new();

        for round in 0..20u8 {
            region.publish(&[round; 40]).unwrap();
            region.publish(&[round; 100]).unwrap();
            let batch = ring.read(at).unwrap();
            at = batch.next;
            seen.extend(batch.messages.into_iter().map(|m| (m.seq, m.payload.len())));
        }

        assert_eq!(seen.len(), 40);
        for (i, (seq, len)) in seen.iter().enumerate() {
            assert_eq!(*seq, i as u64);
            assert_eq!(*len, if i % 2 == 0 { 40 } else { 100 });
        }
    }

    #[test]
    fn empty_payloads_are_valid_messages() {
        let region = HeapRegion::new(512);
        region.publish(b"").unwrap();
        region.publish(b"x").unwrap();
        assert_eq!(region.read_all(0).unwrap(), vec![Vec::new(), b"x".to_vec()]);
    }
}
