//! Lifecycle of a mapped topic region.
//!
//! Creation races are settled by `O_CREAT | O_EXCL`: exactly one process
//! creates and initializes the region, everyone else opens it and waits for the
//! READY state. Attachments are counted in the low half of
//! [`SyncBlock::lifecycle`]; the process whose detach takes the count to zero
//! under [`Lifetime::RemoveOnLastDetach`] sets the retired bit in the same CAS
//! and is the only one that unlinks. A retired region is never re-attached.

use crate::error::{BusError, Result};
use crate::options::Lifetime;
use crate::ring::{Ring, RingConfig};
use crate::shm_layout::{REFCOUNT_MASK, RETIRED_BIT, SyncBlock, TopicHeader, header_len};
use basalt_mmap::{ShmMapping, ShmObject};
use std::io;
use std::process;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const INIT_POLL: Duration = Duration::from_micros(200);

pub(crate) struct Region {
    _mapping: ShmMapping,
    base: *mut u8,
    name: String,
    slot: Option<usize>,
    created: bool,
    attached: bool,
}

// SAFETY: the mapping is shared memory; every mutation goes through atomics,
// the process-shared mutex, or the ring protocol.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Creates the region, or attaches to the existing one if another process
    /// won the race. `cfg` must match an existing region's capacity.
    pub(crate) fn create_or_attach(
        name: &str,
        cfg: RingConfig,
        lifetime: Lifetime,
        init_timeout: Duration,
    ) -> Result<Region> {
        let started = Instant::now();
        loop {
            match ShmObject::create_exclusive(name, cfg.capacity as u64) {
                Ok(obj) => return Self::initialize(obj, cfg, lifetime),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if let Some(region) = Self::open_existing(name, Some(cfg), init_timeout)? {
                        return Ok(region);
                    }
                }
                Err(e) => return Err(BusError::os("shm_open", name, e)),
            }
            // retired or unlinked between our create and open; try again
            if started.elapsed() >= init_timeout {
                return Err(BusError::Timeout {
                    name: name.to_owned(),
                    waited: init_timeout,
                });
            }
            thread::yield_now();
        }
    }

    /// Attaches to an existing region. `Ok(None)` if there is none, or the one
    /// found is being removed.
    pub(crate) fn attach(name: &str, init_timeout: Duration) -> Result<Option<Region>> {
        Self::open_existing(name, None, init_timeout)
    }

    fn initialize(obj: ShmObject, cfg: RingConfig, lifetime: Lifetime) -> Result<Region> {
        let name = obj.name().to_owned();
        let mut mapping = match obj.map_rw() {
            Ok(m) => m,
            Err(e) => {
                let _ = basalt_mmap::unlink(&name);
                return Err(BusError::os("mmap", &name, e));
            }
        };
        let base = mapping.as_mut_ptr();
        // SAFETY: a fresh object is zero-filled and private to us until READY.
        if let Err(e) = unsafe { TopicHeader::init(base as *mut TopicHeader, cfg, lifetime) } {
            let _ = basalt_mmap::unlink(&name);
            return Err(BusError::os("pthread init", &name, e));
        }

        let mut region = Region {
            _mapping: mapping,
            base,
            name,
            slot: None,
            created: true,
            attached: false,
        };
        // counted before READY so no attacher can see a zero count
        region.join()?;
        region.header().mark_ready();
        debug!(
            name = %region.name,
            capacity = cfg.capacity,
            ?lifetime,
            "created topic region"
        );
        Ok(region)
    }

    fn open_existing(name: &str, expected: Option<RingConfig>, init_timeout: Duration) -> Result<Option<Region>> {
        let started = Instant::now();
        let timed_out = || BusError::Timeout {
            name: name.to_owned(),
            waited: init_timeout,
        };

        let obj = match ShmObject::open(name) {
            Ok(obj) => obj,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BusError::os("shm_open", name, e)),
        };

        // the creator sizes the object right after creating it
        loop {
            let len = obj.len().map_err(|e| BusError::os("fstat", name, e))?;
            if len >= header_len() as u64 {
                break;
            }
            if started.elapsed() >= init_timeout {
                return Err(timed_out());
            }
            thread::sleep(INIT_POLL);
        }

        let mut mapping = obj.map_rw().map_err(|e| BusError::os("mmap", name, e))?;
        let base = mapping.as_mut_ptr();
        let mapped_len = mapping.len();
        // SAFETY: the object holds at least a header and stays mapped with `mapping`.
        let header = unsafe { &*(base as *const TopicHeader) };
        while !header.is_ready() {
            if started.elapsed() >= init_timeout {
                return Err(timed_out());
            }
            thread::sleep(INIT_POLL);
        }
        header
            .validate(mapped_len)
            .map_err(|reason| BusError::InvalidLayout {
                name: name.to_owned(),
                reason,
            })?;
        if let Some(cfg) = expected {
            if header.capacity != cfg.capacity as u64 {
                return Err(BusError::CapacityMismatch {
                    name: name.to_owned(),
                    requested: cfg.capacity as u64,
                    actual: header.capacity,
                });
            }
        }

        let mut region = Region {
            _mapping: mapping,
            base,
            name: name.to_owned(),
            slot: None,
            created: false,
            attached: false,
        };
        if !region.join()? {
            debug!(name, "region is retired, not attaching");
            return Ok(None);
        }
        debug!(
            name,
            capacity = header.capacity,
            refcount = region.refcount(),
            "attached to topic region"
        );
        Ok(Some(region))
    }

    /// Counts this handle as attached and claims a pid slot. `Ok(false)` if the
    /// region was retired first.
    fn join(&mut self) -> Result<bool> {
        let lifecycle = &self.sync().lifecycle;
        let mut cur = lifecycle.load(Ordering::Acquire);
        loop {
            if cur & RETIRED_BIT != 0 {
                return Ok(false);
            }
            if cur & REFCOUNT_MASK == REFCOUNT_MASK {
                return Err(BusError::ResourceExhausted {
                    name: self.name.clone(),
                    source: None,
                });
            }
            match lifecycle.compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        self.attached = true;

        self.reap_stale();
        let pid = process::id();
        self.slot = self.sync().attachments.iter().position(|s| {
            s.compare_exchange(0, pid, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        });
        if self.slot.is_none() {
            // Drop gives the count back
            return Err(BusError::ResourceExhausted {
                name: self.name.clone(),
                source: None,
            });
        }
        Ok(true)
    }

    /// Releases attachments left behind by processes that no longer exist.
    fn reap_stale(&self) {
        let sync = self.sync();
        let own = process::id();
        for slot in sync.attachments.iter() {
            let pid = slot.load(Ordering::Acquire);
            if pid == 0 || pid == own || pid_alive(pid) {
                continue;
            }
            if slot
                .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            // we hold an attachment ourselves, so the count stays above zero
            let prev = sync.lifecycle.fetch_sub(1, Ordering::AcqRel);
            warn!(
                name = %self.name,
                pid,
                refcount = (prev & REFCOUNT_MASK) - 1,
                "reaped attachment of a dead process"
            );
        }
    }

    fn detach(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        let slot = self.slot.take();
        let sync = self.sync();
        if let Some(slot) = slot {
            let _ = sync.attachments[slot].compare_exchange(
                process::id(),
                0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }

        let remove = self.header().lifetime() == Lifetime::RemoveOnLastDetach;
        let mut cur = sync.lifecycle.load(Ordering::Acquire);
        let (retire, left) = loop {
            let count = cur & REFCOUNT_MASK;
            if count == 0 {
                break (false, 0);
            }
            let retire = count == 1 && remove && cur & RETIRED_BIT == 0;
            let next = (cur - 1) | if retire { RETIRED_BIT } else { 0 };
            match sync
                .lifecycle
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break (retire, count - 1),
                Err(actual) => cur = actual,
            }
        };

        if retire {
            match basalt_mmap::unlink(&self.name) {
                Ok(()) => info!(name = %self.name, "last attachment gone, unlinked topic region"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(name = %self.name, error = %e, "failed to unlink topic region"),
            }
        } else {
            debug!(name = %self.name, refcount = left, "detached from topic region");
        }
    }

    /// Retires the region behind `name` and unlinks it. Processes already
    /// attached keep using their mapping; nobody attaches to it again.
    ///
    /// Returns `false` if there was nothing to remove.
    pub(crate) fn remove(name: &str) -> Result<bool> {
        let obj = match ShmObject::open(name) {
            Ok(obj) => obj,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(BusError::os("shm_open", name, e)),
        };
        let len = obj.len().map_err(|e| BusError::os("fstat", name, e))?;
        if len >= header_len() as u64 {
            let mut mapping = obj.map_rw().map_err(|e| BusError::os("mmap", name, e))?;
            let header = unsafe { &*(mapping.as_mut_ptr() as *const TopicHeader) };
            if header.is_ready() && header.validate(mapping.len()).is_ok() {
                let prev = header.sync.lifecycle.fetch_or(RETIRED_BIT, Ordering::AcqRel);
                if prev & RETIRED_BIT != 0 {
                    // whoever retired it unlinks it
                    return Ok(false);
                }
            }
        }
        match basalt_mmap::unlink(name) {
            Ok(()) => {
                info!(name, "removed topic region");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BusError::os("shm_unlink", name, e)),
        }
    }

    #[inline]
    pub(crate) fn header(&self) -> &TopicHeader {
        // SAFETY: validated (or initialized by us) before the Region was built.
        unsafe { &*(self.base as *const TopicHeader) }
    }

    #[inline]
    pub(crate) fn sync(&self) -> &SyncBlock {
        &self.header().sync
    }

    #[inline]
    pub(crate) fn ring(&self) -> Ring<'_> {
        // SAFETY: the ring area follows the header and is covered by the mapping.
        unsafe { Ring::new(self.sync(), self.base.add(header_len()), self.data_len()) }
    }

    #[inline]
    pub(crate) fn data_len(&self) -> u64 {
        self.header().data_len
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn created(&self) -> bool {
        self.created
    }

    pub(crate) fn refcount(&self) -> u32 {
        (self.sync().lifecycle.load(Ordering::Acquire) & REFCOUNT_MASK) as u32
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.sync().lifecycle.load(Ordering::Acquire) & RETIRED_BIT != 0
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.detach();
    }
}

/// `kill(pid, 0)` liveness check; a process we may not signal still exists.
pub(crate) fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}
