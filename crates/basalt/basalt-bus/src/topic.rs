//! A resolved topic: one attached region plus the per-process publisher claim.

use crate::error::{BusError, Result};
use crate::frame::Message;
use crate::region::{Region, pid_alive};
use crate::ring::{Batch, Position};
use crate::shm_layout::Cursor;
use crate::sync::{WaitOutcome, WriterGuard};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// State of a topic's exclusive publisher claim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    /// Nobody holds the claim (no exclusive publisher ever attached, or it
    /// closed cleanly).
    NoPublisher,
    Alive { pid: u32 },
    /// The claiming process exited without releasing it.
    Dead { pid: u32 },
}

pub struct Topic {
    topic: String,
    region: Region,
    /// Exclusive publisher handles of this process on this topic.
    local_publishers: Mutex<usize>,
}

impl Topic {
    pub(crate) fn new(topic: &str, region: Region) -> Self {
        Self {
            topic: topic.to_owned(),
            region,
            local_publishers: Mutex::new(0),
        }
    }

    /// The topic name as given by the application.
    #[inline]
    pub fn name(&self) -> &str {
        &self.topic
    }

    /// The shared object name backing this topic.
    #[inline]
    pub fn shm_name(&self) -> &str {
        self.region.name()
    }

    /// Total region size in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    #[inline]
    pub fn max_payload(&self) -> usize {
        self.region.ring().max_payload()
    }

    /// Whether this process created the region.
    #[inline]
    pub fn created_here(&self) -> bool {
        self.region.created()
    }

    /// Mappings currently attached to the region, one per resolved topic per
    /// registry.
    pub fn refcount(&self) -> u32 {
        self.region.refcount()
    }

    pub fn is_retired(&self) -> bool {
        self.region.is_retired()
    }

    /// Crash recoveries performed on this region so far, by any process.
    pub fn recoveries(&self) -> u64 {
        self.region.sync().recoveries.load(Ordering::Acquire)
    }

    /// Acquires the topic's writer exclusion. Recovers the region if the
    /// previous holder died while holding it.
    pub fn acquire_writer(&self) -> Result<WriterGuard<'_>> {
        self.region
            .sync()
            .lock(self.region.data_len())
            .map_err(|e| BusError::os("pthread_mutex_lock", self.shm_name(), e))
    }

    /// Appends one frame under the writer exclusion and wakes all waiters.
    pub(crate) fn write_frame(&self, payload: &[u8]) -> Result<u64> {
        let guard = self.acquire_writer()?;
        let seq = self.region.ring().write(&guard, payload)?;
        self.region
            .sync()
            .last_publish_ns
            .store(wall_clock_ns(), Ordering::Release);
        guard.notify_all();
        Ok(seq)
    }

    pub(crate) fn read(&self, from: Position) -> Result<Batch> {
        self.region.ring().read(from)
    }

    /// Every message with sequence `>= seq` still held by the ring.
    ///
    /// Fails with [`BusError::SequenceTooOld`] if `seq` was already overwritten.
    pub fn read_from(&self, seq: u64) -> Result<Vec<Message>> {
        self.read(Position::at_seq(seq)).map(|batch| batch.messages)
    }

    /// Consistent cursor. Falls back to the writer exclusion when the lock-free
    /// snapshot keeps failing, which also repairs a cursor left by a dead writer.
    pub fn cursor(&self) -> Result<Cursor> {
        if let Some(c) = self.region.sync().snapshot() {
            return Ok(c);
        }
        Ok(self.acquire_writer()?.cursor())
    }

    /// Sequence the next published message will get.
    pub fn next_seq(&self) -> Result<u64> {
        self.cursor().map(|c| c.next_seq)
    }

    /// Oldest sequence still readable.
    pub fn oldest_seq(&self) -> Result<u64> {
        self.cursor().map(|c| c.tail_seq)
    }

    /// Blocks until sequence `since_seq` has been published or `timeout` elapses.
    pub fn wait_for_data(&self, since_seq: u64, timeout: Duration) -> Result<WaitOutcome> {
        self.wait(since_seq, timeout, None)
    }

    pub(crate) fn wait(
        &self,
        since_seq: u64,
        timeout: Duration,
        cancel: Option<&AtomicBool>,
    ) -> Result<WaitOutcome> {
        self.region
            .sync()
            .wait_for_data(self.region.data_len(), since_seq, timeout, cancel)
            .map_err(|e| BusError::os("pthread_cond_timedwait", self.shm_name(), e))
    }

    /// Wakes every waiter. Taking the writer exclusion first means a waiter
    /// either sees the caller's state change or is already asleep.
    pub(crate) fn wake_all(&self) -> Result<()> {
        self.acquire_writer()?.notify_all();
        Ok(())
    }

    pub fn publisher_liveness(&self) -> Liveness {
        match self.region.sync().writer_pid.load(Ordering::Acquire) {
            0 => Liveness::NoPublisher,
            pid if pid_alive(pid) => Liveness::Alive { pid },
            pid => Liveness::Dead { pid },
        }
    }

    /// Wall-clock time of the most recent publish, by any process.
    pub fn last_publish(&self) -> Option<SystemTime> {
        match self.region.sync().last_publish_ns.load(Ordering::Acquire) {
            0 => None,
            ns => Some(UNIX_EPOCH + Duration::from_nanos(ns)),
        }
    }

    /// Registers an exclusive publisher handle of this process. The first one
    /// claims the region's writer pid; a claim left by a dead process is taken
    /// over.
    pub(crate) fn claim_writer(&self) -> Result<()> {
        let mut local = self
            .local_publishers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *local == 0 {
            let own = process::id();
            let writer_pid = &self.region.sync().writer_pid;
            let mut cur = writer_pid.load(Ordering::Acquire);
            loop {
                if cur != 0 && cur != own && pid_alive(cur) {
                    return Err(BusError::PublisherExists {
                        topic: self.topic.clone(),
                        pid: cur,
                    });
                }
                match writer_pid.compare_exchange(cur, own, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => break,
                    Err(actual) => cur = actual,
                }
            }
            if cur != 0 && cur != own {
                warn!(topic = %self.topic, dead_pid = cur, "took over publisher claim of a dead process");
            }
        }
        *local += 1;
        Ok(())
    }

    pub(crate) fn release_writer(&self) {
        let mut local = self
            .local_publishers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *local = local.saturating_sub(1);
        if *local == 0 {
            let _ = self.region.sync().writer_pid.compare_exchange(
                process::id(),
                0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("topic", &self.topic)
            .field("shm_name", &self.shm_name())
            .field("capacity", &self.capacity())
            .finish()
    }
}

fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
