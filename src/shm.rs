//! Low-level POSIX shared memory operations

use crate::error::{RelayError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Longest name accepted, excluding the leading `/`.
pub const MAX_NAME_LEN: usize = 250;

/// Turn a user supplied region name into the `/name` form `shm_open` wants.
///
/// A single leading `/` is accepted and kept; any other `/`, an interior NUL
/// or an empty name is rejected.
pub fn os_name(name: &str) -> Result<CString> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() || bare.contains('/') || bare.contains('\0') {
        return Err(RelayError::InvalidName(name.to_string()));
    }
    if bare.len() > MAX_NAME_LEN {
        return Err(RelayError::NameTooLong {
            max: MAX_NAME_LEN,
            got: bare.len(),
        });
    }
    CString::new(format!("/{bare}")).map_err(|_| RelayError::InvalidName(name.to_string()))
}

/// Handle to a mapped shared memory object
pub struct ShmSegment {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: CString,
    is_owner: bool,
}

// SAFETY: the mapping stays valid for the lifetime of the handle and every
// shared field inside it is accessed through atomics.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a fresh shared memory object of `size` bytes.
    ///
    /// Any stale object left behind under the same name (e.g. after a crash)
    /// is unlinked first. The new object comes from `ftruncate` and therefore
    /// reads as zeroes.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = os_name(name)?;

        match shm_unlink(c_name.as_c_str()) {
            Ok(()) => warn!(name, "removed stale shared memory object"),
            Err(e) if e == Errno::NOENT => {}
            Err(e) => debug!(name, error = %e, "stale unlink failed"),
        }

        let fd = shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP,
        )
        .map_err(|e| RelayError::ShmCreate {
            name: name.to_string(),
            source: e.into(),
        })?;

        let mapped = ftruncate(&fd, size as u64)
            .map_err(|e| RelayError::Truncate(e.into()))
            .and_then(|()| map(&fd, size));

        let addr = match mapped {
            Ok(addr) => addr,
            Err(e) => {
                let _ = shm_unlink(c_name.as_c_str());
                return Err(e);
            }
        };

        debug!(name, size, "created shared memory");

        Ok(Self {
            fd,
            addr,
            size,
            name: c_name,
            is_owner: true,
        })
    }

    /// Open an existing shared memory object and map all of it.
    ///
    /// Fails with `RegionTooSmall` if the object is shorter than `min_size`.
    pub fn open(name: &str, min_size: usize) -> Result<Self> {
        let c_name = os_name(name)?;

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
            RelayError::ShmOpen {
                name: name.to_string(),
                source: e.into(),
            }
        })?;

        let stat = rustix::fs::fstat(&fd).map_err(|e| RelayError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        })?;
        let size = usize::try_from(stat.st_size).unwrap_or(0);
        if size < min_size || size == 0 {
            return Err(RelayError::RegionTooSmall {
                needed: min_size,
                actual: size,
            });
        }

        let addr = map(&fd, size)?;

        debug!(name, size, "opened shared memory");

        Ok(Self {
            fd,
            addr,
            size,
            name: c_name,
            is_owner: false,
        })
    }

    /// Get raw pointer to shared memory
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get size of the mapping
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The OS-level name, including the leading `/`
    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or_default()
    }

    /// Check if this handle owns (and will unlink) the object
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }
}

fn map(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| RelayError::Mmap(e.into()))?
    };

    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| RelayError::Mmap(std::io::Error::other("mmap returned null")))
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }

        if self.is_owner {
            match shm_unlink(self.name.as_c_str()) {
                Ok(()) => debug!(name = self.name(), "unlinked shared memory"),
                Err(e) => warn!(name = self.name(), error = %e, "failed to unlink shared memory"),
            }
        }
    }
}
