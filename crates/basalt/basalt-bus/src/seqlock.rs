//! Seqlock (sequence lock) guarding the ring cursor inside the shared header.
//!
//! The writer holds the topic's writer exclusion, so there is never more than
//! one writer; readers never take the lock and instead detect concurrent
//! updates through the sequence number.
//!
//! # Protocol
//!
//! **Writer:**
//! 1. Increment seq to odd (signals "write in progress")
//! 2. Write data
//! 3. Increment seq to even (signals "write complete")
//!
//! **Reader:**
//! 1. Read seq; if odd, spin (write in progress)
//! 2. Copy data
//! 3. Read seq again; if changed, retry from step 1
//!
//! A writer that dies between steps 1 and 3 leaves the sequence odd forever.
//! Readers therefore spin for a bounded number of attempts only, and the
//! recovery path in [`crate::sync`] repairs the slot with [`SeqlockSlot::force_write`].

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering, fence};

/// A `Copy` value protected by a sequence lock, laid out for shared memory.
///
/// ```text
/// ┌─────────────────────────────────────┐
/// │  seq: AtomicU64  │  data: T         │
/// │  (8 bytes)       │  (size_of::<T>)  │
/// └─────────────────────────────────────┘
/// ```
#[repr(C, align(64))]
pub struct SeqlockSlot<T: Copy> {
    /// Sequence counter: odd = write in progress, even = stable.
    seq: AtomicU64,
    data: UnsafeCell<MaybeUninit<T>>,
}

impl<T: Copy> SeqlockSlot<T> {
    /// Initializes the slot to a stable state holding `value`.
    ///
    /// # Safety
    /// No other thread or process may access the slot concurrently.
    pub(crate) unsafe fn init(this: *mut Self, value: T) {
        unsafe {
            (*this).seq.store(0, Ordering::Relaxed);
            (*(*this).data.get()).write(value);
        }
    }

    /// Writes a value using the seqlock protocol.
    ///
    /// # Safety
    /// The caller must hold the topic's writer exclusion: two concurrent
    /// writers would interleave their sequence increments.
    #[inline(always)]
    pub(crate) unsafe fn write(&self, value: T) {
        let s0 = self.seq.load(Ordering::Relaxed);
        self.seq.store(s0.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        unsafe { (*self.data.get()).as_mut_ptr().write_volatile(value) };
        self.seq.store(s0.wrapping_add(2), Ordering::Release);
    }

    /// Overwrites the value after a writer died mid-update and leaves the
    /// sequence even again.
    ///
    /// # Safety
    /// Same contract as [`write`](Self::write).
    pub(crate) unsafe fn force_write(&self, value: T) {
        let s0 = self.seq.load(Ordering::Relaxed);
        let odd = s0 | 1;
        self.seq.store(odd, Ordering::Relaxed);
        fence(Ordering::Release);
        unsafe { (*self.data.get()).as_mut_ptr().write_volatile(value) };
        self.seq.store(odd.wrapping_add(1), Ordering::Release);
    }

    /// Reads the value without seqlock validation.
    ///
    /// # Safety
    /// Only meaningful while holding the writer exclusion, when no write can
    /// be in flight. After a crash the value may be torn, see [`is_torn`](Self::is_torn).
    #[inline(always)]
    pub(crate) unsafe fn read_exclusive(&self) -> T {
        unsafe { (*self.data.get()).as_ptr().read_volatile() }
    }

    /// True when a writer started an update it never finished.
    #[inline]
    pub(crate) fn is_torn(&self) -> bool {
        self.seq.load(Ordering::Acquire) & 1 == 1
    }

    /// Leaves the slot as a writer that died right after step 1 would.
    #[cfg(test)]
    pub(crate) fn abandon_write(&self) {
        self.seq.fetch_or(1, Ordering::Release);
    }

    /// Reads a consistent snapshot, giving up after `max_spins` attempts.
    ///
    /// Returns `None` only if the sequence stayed odd or kept changing for the
    /// whole budget, which in practice means the writer died mid-update.
    #[inline]
    pub(crate) fn try_read(&self, max_spins: u32) -> Option<T> {
        for _ in 0..max_spins {
            let s1 = self.seq.load(Ordering::Acquire);
            if s1 & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }

            // SAFETY: the slot is initialized at region creation; a torn copy is
            // detected by the sequence check below and discarded.
            let v = unsafe { (*self.data.get()).as_ptr().read_volatile() };

            fence(Ordering::Acquire);
            let s2 = self.seq.load(Ordering::Relaxed);
            if s1 == s2 {
                return Some(v);
            }
            std::hint::spin_loop();
        }
        None
    }
}
