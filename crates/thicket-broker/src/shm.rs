//! Anonymous shared-memory segments backed by `memfd_create`.
//!
//! Each segment is created sealed to a fixed length, mapped read-write into
//! the broker, and its descriptor travels to clients over `SCM_RIGHTS`. The
//! broker never needs `MAP_HUGETLB` on its own mapping even for a huge-page
//! pool; the backing file carries the page size, clients opt in when they map.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

// ============================================================================
// Segment
// ============================================================================

/// One mapped memfd region. The mapping and the file live and die together.
pub(crate) struct Segment {
    file: File,
    addr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is plain process memory; interior mutation happens
// through atomics or under the owning binding's lock.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a segment of `len` bytes, zero-filled. `huge` asks the kernel
    /// for huge-page backing, in which case `len` must be a multiple of the
    /// huge page size.
    pub(crate) fn create(name: &str, len: usize, huge: bool) -> io::Result<Self> {
        let cname = std::ffi::CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "segment name has NUL"))?;
        let mut flags = libc::MFD_CLOEXEC;
        if huge {
            flags |= libc::MFD_HUGETLB;
        }
        // SAFETY: cname is a valid NUL-terminated string.
        let fd = unsafe { libc::memfd_create(cname.as_ptr(), flags) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is a freshly created, owned descriptor.
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(len as u64)?;

        // SAFETY: mapping a fully-truncated memfd we own; length checked
        // nonzero by callers.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            file,
            addr: addr.cast(),
            len,
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.addr
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: addr/len came from a successful mmap in create().
        unsafe {
            libc::munmap(self.addr.cast(), self.len);
        }
    }
}
