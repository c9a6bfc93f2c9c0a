// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Fixed-size memory-mapped regions backed by a regular file or a POSIX
// shared-memory object. The region is truncated to the requested size and
// the mapping address is stable for the lifetime of the handle.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::path::Path;
use std::ptr;

/// A failed syscall: the syscall name plus the OS errno.
///
/// Connection and startup errors are surfaced to the embedder as a short
/// kind tag and an errno, so the tag is kept separate from the formatted
/// message instead of being folded into an `io::Error` string.
#[derive(Debug, Clone, Copy)]
pub struct SysError {
    pub what: &'static str,
    pub errno: i32,
}

impl SysError {
    /// Capture `errno` for a just-failed syscall.
    pub fn last(what: &'static str) -> Self {
        Self {
            what,
            errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }

    /// An error that carries no OS errno (protocol-level failures).
    pub fn plain(what: &'static str) -> Self {
        Self { what, errno: 0 }
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errno != 0 {
            write!(f, "{}: {}", self.what, io::Error::from_raw_os_error(self.errno))
        } else {
            f.write_str(self.what)
        }
    }
}

impl std::error::Error for SysError {}

impl From<SysError> for io::Error {
    fn from(e: SysError) -> Self {
        io::Error::new(io::ErrorKind::Other, e.to_string())
    }
}

/// An owned, fixed-size, shared mapping.
pub struct MmapRegion {
    mem: *mut u8,
    len: usize,
}

// Safety: the mapping is process-shared by design; cross-thread access is
// governed by the owning protocol objects.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// Map `len` bytes backed by a regular file, creating it if missing.
    pub fn open_file(path: &Path, len: usize) -> Result<Self, SysError> {
        let c_path = CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| SysError::plain("open"))?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o644) };
        if fd < 0 {
            return Err(SysError::last("open"));
        }
        Self::map_fd(fd, len)
    }

    /// Map `len` bytes backed by a POSIX shared-memory object, creating it
    /// if missing. `name` must begin with '/'.
    pub fn open_shm(name: &str, len: usize) -> Result<Self, SysError> {
        let c_name = CString::new(name.as_bytes()).map_err(|_| SysError::plain("shm_open"))?;
        let fd = unsafe {
            libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o666 as libc::mode_t)
        };
        if fd < 0 {
            return Err(SysError::last("shm_open"));
        }
        Self::map_fd(fd, len)
    }

    fn map_fd(fd: i32, len: usize) -> Result<Self, SysError> {
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = SysError::last("ftruncate");
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mem == libc::MAP_FAILED {
            return Err(SysError::last("mmap"));
        }
        Ok(Self {
            mem: mem as *mut u8,
            len,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Zero the whole region (fresh-peer reset).
    pub fn zero(&self) {
        unsafe { ptr::write_bytes(self.mem, 0, self.len) };
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.len) };
    }
}

/// Remove a named shm object; ignores errors (object may not exist).
pub fn shm_unlink(name: &str) {
    if let Ok(c_name) = CString::new(name.as_bytes()) {
        unsafe { libc::shm_unlink(c_name.as_ptr()) };
    }
}
