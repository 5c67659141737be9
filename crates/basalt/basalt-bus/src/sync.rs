//! Process-shared synchronization block.
//!
//! The writer exclusion is a pthread mutex created with
//! `PTHREAD_PROCESS_SHARED` and `PTHREAD_MUTEX_ROBUST`, living inside the
//! mapped region next to a process-shared condition variable on
//! `CLOCK_MONOTONIC`. Both are initialized exactly once, by the process that
//! created the region.
//!
//! # Protocol
//!
//! **Writer:** lock → write frame → update cursor → broadcast → unlock.
//!
//! **Reader:** lock-free cursor snapshot → copy frames. Only when nothing is
//! new does a reader lock the mutex, re-check the cursor and sleep on the
//! condition variable with a deadline.
//!
//! # Crash recovery
//!
//! If the holder of the mutex dies, the next `pthread_mutex_lock` (or a wait
//! returning the mutex) reports `EOWNERDEAD`. The new owner then:
//! 1. repairs the cursor if its seqlock was left mid-update: the backlog is
//!    dropped, head and tail jump to the next ring boundary and the oldest
//!    sequence becomes the next sequence, so readers observe a gap instead of
//!    a half-written frame;
//! 2. marks the mutex consistent and bumps the shared `recoveries` counter.
//!
//! A writer that dies after evicting but before committing needs no repair:
//! its partial frame lies beyond the committed head and is simply overwritten.

use crate::shm_layout::{Cursor, SyncBlock};
use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

/// Attempts a lock-free reader makes before treating the cursor as abandoned.
pub(crate) const SNAPSHOT_SPINS: u32 = 1 << 14;

/// Outcome of [`wait_for_data`](crate::Topic::wait_for_data).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The awaited sequence has been published.
    Ready,
    TimedOut,
    Cancelled,
}

#[repr(C)]
pub(crate) struct SharedMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

#[repr(C)]
pub(crate) struct SharedCondvar {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

enum Locked {
    Clean,
    OwnerDied,
}

enum Wake {
    Signaled,
    TimedOut,
    OwnerDied,
}

#[inline]
fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

impl SharedMutex {
    /// # Safety
    /// `this` must point into the mapped region and must not be in use by any
    /// other thread or process.
    pub(crate) unsafe fn init(this: *mut Self) -> io::Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        unsafe {
            check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            let attr_ptr = attr.as_mut_ptr();
            let result = check(libc::pthread_mutexattr_setpshared(
                attr_ptr,
                libc::PTHREAD_PROCESS_SHARED,
            ))
            .and_then(|_| {
                check(libc::pthread_mutexattr_setrobust(
                    attr_ptr,
                    libc::PTHREAD_MUTEX_ROBUST,
                ))
            })
            .and_then(|_| check(libc::pthread_mutex_init((*this).raw.get(), attr_ptr)));
            libc::pthread_mutexattr_destroy(attr_ptr);
            result
        }
    }

    fn lock(&self) -> io::Result<Locked> {
        // SAFETY: initialized by the region creator before the region was marked ready.
        match unsafe { libc::pthread_mutex_lock(self.raw.get()) } {
            0 => Ok(Locked::Clean),
            libc::EOWNERDEAD => Ok(Locked::OwnerDied),
            rc => Err(io::Error::from_raw_os_error(rc)),
        }
    }

    fn make_consistent(&self) -> io::Result<()> {
        check(unsafe { libc::pthread_mutex_consistent(self.raw.get()) })
    }

    fn unlock(&self) {
        unsafe { libc::pthread_mutex_unlock(self.raw.get()) };
    }
}

impl SharedCondvar {
    /// # Safety
    /// Same contract as [`SharedMutex::init`].
    pub(crate) unsafe fn init(this: *mut Self) -> io::Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        unsafe {
            check(libc::pthread_condattr_init(attr.as_mut_ptr()))?;
            let attr_ptr = attr.as_mut_ptr();
            let result = check(libc::pthread_condattr_setpshared(
                attr_ptr,
                libc::PTHREAD_PROCESS_SHARED,
            ))
            .and_then(|_| check(libc::pthread_condattr_setclock(attr_ptr, libc::CLOCK_MONOTONIC)))
            .and_then(|_| check(libc::pthread_cond_init((*this).raw.get(), attr_ptr)));
            libc::pthread_condattr_destroy(attr_ptr);
            result
        }
    }

    fn broadcast(&self) {
        unsafe { libc::pthread_cond_broadcast(self.raw.get()) };
    }

    fn wait_until(&self, mutex: &SharedMutex, deadline: &libc::timespec) -> io::Result<Wake> {
        match unsafe { libc::pthread_cond_timedwait(self.raw.get(), mutex.raw.get(), deadline) } {
            0 => Ok(Wake::Signaled),
            libc::ETIMEDOUT => Ok(Wake::TimedOut),
            libc::EOWNERDEAD => Ok(Wake::OwnerDied),
            rc => Err(io::Error::from_raw_os_error(rc)),
        }
    }
}

/// Holds the topic's writer exclusion; released on drop.
pub struct WriterGuard<'a> {
    block: &'a SyncBlock,
    data_len: u64,
}

impl SyncBlock {
    /// Acquires the writer exclusion, recovering from a dead previous holder.
    pub(crate) fn lock(&self, data_len: u64) -> io::Result<WriterGuard<'_>> {
        let locked = self.mutex.lock()?;
        let guard = WriterGuard {
            block: self,
            data_len,
        };
        if let Locked::OwnerDied = locked {
            self.recover(data_len)?;
        }
        Ok(guard)
    }

    fn recover(&self, data_len: u64) -> io::Result<()> {
        let torn = self.cursor.is_torn();
        if torn {
            // SAFETY: we own the (inconsistent) mutex, nobody else writes the cursor.
            let c = unsafe { self.cursor.read_exclusive() };
            let repaired = repair_cursor(c, data_len);
            unsafe { self.cursor.force_write(repaired) };
        }
        self.mutex.make_consistent()?;
        let n = self.recoveries.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(torn_cursor = torn, recoveries = n, "recovered writer lock from a dead holder");
        Ok(())
    }

    /// Lock-free consistent cursor snapshot; `None` if the cursor looks abandoned.
    #[inline]
    pub(crate) fn snapshot(&self) -> Option<Cursor> {
        self.cursor.try_read(SNAPSHOT_SPINS)
    }

    /// Blocks until sequence `since_seq` has been published, the timeout
    /// elapses or `cancel` is raised.
    pub(crate) fn wait_for_data(
        &self,
        data_len: u64,
        since_seq: u64,
        timeout: Duration,
        cancel: Option<&AtomicBool>,
    ) -> io::Result<WaitOutcome> {
        let deadline = deadline_after(timeout);
        let guard = self.lock(data_len)?;
        loop {
            if guard.cursor().next_seq > since_seq {
                return Ok(WaitOutcome::Ready);
            }
            if cancel.is_some_and(|c| c.load(Ordering::Acquire)) {
                return Ok(WaitOutcome::Cancelled);
            }
            match self.cond.wait_until(&self.mutex, &deadline)? {
                Wake::Signaled => {}
                Wake::OwnerDied => self.recover(data_len)?,
                Wake::TimedOut => {
                    return Ok(if guard.cursor().next_seq > since_seq {
                        WaitOutcome::Ready
                    } else {
                        WaitOutcome::TimedOut
                    });
                }
            }
        }
    }
}

impl WriterGuard<'_> {
    /// Cursor as seen by the lock holder; never torn.
    #[inline]
    pub(crate) fn cursor(&self) -> Cursor {
        // SAFETY: holding the mutex excludes concurrent cursor writes and any
        // torn state was repaired when the lock was taken.
        unsafe { self.block.cursor.read_exclusive() }
    }

    #[inline]
    pub(crate) fn store_cursor(&self, cursor: Cursor) {
        // SAFETY: holding the mutex makes us the only writer.
        unsafe { self.block.cursor.write(cursor) }
    }

    #[inline]
    pub(crate) fn data_len(&self) -> u64 {
        self.data_len
    }

    /// Wakes every waiting subscriber in every process.
    #[inline]
    pub fn notify_all(&self) {
        self.block.cond.broadcast();
    }

    /// Releases the writer exclusion. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.block.mutex.unlock();
    }
}

/// Drops the backlog of a cursor left mid-update by a dead writer.
///
/// Each field is an individually written `u64`, so every value is either the
/// old or the new one; taking maxima keeps positions and sequences monotonic.
pub(crate) fn repair_cursor(c: Cursor, data_len: u64) -> Cursor {
    let boundary = c.head_pos.max(c.tail_pos).div_ceil(data_len) * data_len;
    let next = c.next_seq.max(c.tail_seq);
    Cursor {
        head_pos: boundary,
        tail_pos: boundary,
        next_seq: next,
        tail_seq: next,
    }
}

fn monotonic_now() -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts
}

fn deadline_after(timeout: Duration) -> libc::timespec {
    let now = monotonic_now();
    let secs = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX / 2);
    let mut tv_sec = (now.tv_sec as i64).saturating_add(secs);
    let mut tv_nsec = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    if tv_nsec >= 1_000_000_000 {
        tv_sec = tv_sec.saturating_add(1);
        tv_nsec -= 1_000_000_000;
    }
    libc::timespec {
        tv_sec: tv_sec as libc::time_t,
        tv_nsec: tv_nsec as libc::c_long,
    }
}
