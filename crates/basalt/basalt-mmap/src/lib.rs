//! Named POSIX shared-memory objects (`shm_open`) mapped read-write with `memmap2`.
//!
//! Object names follow the POSIX convention: a leading `/` followed by up to
//! `NAME_MAX` bytes without further slashes. Name derivation is the caller's
//! business; this crate only opens, sizes, maps and unlinks.

use memmap2::MmapMut;
use std::{
    ffi::CString,
    fs::File,
    io,
    os::fd::FromRawFd,
};

/// Permission bits for newly created objects: owner read/write.
const SHM_MODE: libc::mode_t = 0o600;

/// An open, not yet mapped, shared-memory object.
pub struct ShmObject {
    name: String,
    file: File,
}

/// A shared-memory object mapped read-write into this process.
pub struct ShmMapping {
    _file: File,
    mmap: MmapMut,
    name: String,
}

impl ShmObject {
    /// Atomically create a new object of `size_bytes` (zero-filled).
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] when another process already
    /// owns the name, so exactly one of several racing creators succeeds.
    pub fn create_exclusive(name: &str, size_bytes: u64) -> io::Result<Self> {
        let file = shm_open(name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR)?;
        if let Err(e) = file.set_len(size_bytes) {
            let _ = unlink(name);
            return Err(e);
        }
        Ok(Self {
            name: name.to_owned(),
            file,
        })
    }

    /// Open an existing object read-write. Fails with [`io::ErrorKind::NotFound`]
    /// when no object has that name.
    pub fn open(name: &str) -> io::Result<Self> {
        let file = shm_open(name, libc::O_RDWR)?;
        Ok(Self {
            name: name.to_owned(),
            file,
        })
    }

    /// Current size of the object. A freshly created object may still report 0
    /// until its creator has sized it.
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Map the whole object read-write and shared.
    pub fn map_rw(self) -> io::Result<ShmMapping> {
        // SAFETY: the object is shared with other processes by design; every
        // access through the mapping goes through atomics, the process-shared
        // primitives, or the ring's seqlock validation.
        let mmap = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(ShmMapping {
            _file: self.file,
            mmap,
            name: self.name,
        })
    }
}

impl ShmMapping {
    /// Return raw pointer to the start of the mapped object
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Remove the name of a shared-memory object. Existing mappings stay valid
/// until they are dropped.
pub fn unlink(name: &str) -> io::Result<()> {
    let c_name = c_name(name)?;
    // SAFETY: c_name is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::shm_unlink(c_name.as_ptr()) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn shm_open(name: &str, oflag: libc::c_int) -> io::Result<File> {
    let c_name = c_name(name)?;
    // SAFETY: c_name is a valid NUL-terminated string for the duration of the call.
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), oflag | libc::O_CLOEXEC, SHM_MODE) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just returned by shm_open and is owned by nobody else.
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "shared memory name contains a NUL byte",
        )
    })
}
