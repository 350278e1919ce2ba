//! Shared-region mapping and unwind.
//!
//! Three mappings per binding, all `MAP_SHARED | MAP_POPULATE` (the pool is on
//! the receive fast path; nothing may lazily fault):
//!
//! 1. buffer pool: `PROT_READ`, `MAP_FIXED` at the caller-supplied base,
//!    `MAP_HUGETLB` when the metrics flag it huge-page backed
//! 2. server FIFO: `PROT_READ`, kernel-chosen address
//! 3. client FIFO + state block: `PROT_READ | PROT_WRITE`, one mapping
//!
//! All lengths come from [`SharedMetrics`] and nowhere else. A mapping that
//! fails halfway leaves the already-established regions recorded so
//! [`SharedRegions::unmap`] can unwind exactly what exists.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::AtomicU32;

use thicket_primitives::{
    BIND_FD_COUNT, ClientState, FD_CLIENT_FIFO, FD_POOL, FD_SERVER_FIFO, SLOT_BYTES, SharedMetrics,
};

/// The three mapped regions of one binding. Null pointers mark regions that
/// are not (or no longer) mapped.
#[derive(Debug)]
pub(crate) struct SharedRegions {
    pool: *mut u8,
    server_fifo: *mut u8,
    client_region: *mut u8,
    /// Byte offset of the state block within `client_region`, recorded from
    /// the wire metrics at map time.
    state_offset: usize,
}

impl SharedRegions {
    pub(crate) fn empty() -> Self {
        Self {
            pool: ptr::null_mut(),
            server_fifo: ptr::null_mut(),
            client_region: ptr::null_mut(),
            state_offset: 0,
        }
    }

    /// Establish all three mappings. On error the regions mapped so far stay
    /// recorded; the caller must invoke [`Self::unmap`].
    pub(crate) fn map(
        &mut self,
        metrics: &SharedMetrics,
        pool_base: *mut u8,
        fds: &[OwnedFd; BIND_FD_COUNT],
    ) -> io::Result<()> {
        let mut pool_flags = libc::MAP_SHARED | libc::MAP_POPULATE | libc::MAP_FIXED;
        if metrics.huge_pool() {
            pool_flags |= libc::MAP_HUGETLB;
        }
        self.pool = map_region(
            pool_base,
            metrics.pool_bytes(),
            libc::PROT_READ,
            pool_flags,
            fds[FD_POOL].as_raw_fd(),
        )?;

        self.server_fifo = map_region(
            ptr::null_mut(),
            metrics.server_fifo_bytes(),
            libc::PROT_READ,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fds[FD_SERVER_FIFO].as_raw_fd(),
        )?;

        self.client_region = map_region(
            ptr::null_mut(),
            metrics.client_region_bytes(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fds[FD_CLIENT_FIFO].as_raw_fd(),
        )?;
        self.state_offset = metrics.state_offset as usize;

        Ok(())
    }

    /// Tear down whatever is mapped, tolerating partial initialization.
    /// Lengths are derived from `metrics`, the sole authority on geometry.
    pub(crate) fn unmap(&mut self, metrics: &SharedMetrics) {
        // SAFETY: each non-null pointer was returned by mmap with the matching
        // length computed from the same metrics.
        unsafe {
            if !self.pool.is_null() {
                libc::munmap(self.pool.cast(), metrics.pool_bytes());
                self.pool = ptr::null_mut();
            }
            if !self.server_fifo.is_null() {
                libc::munmap(self.server_fifo.cast(), metrics.server_fifo_bytes());
                self.server_fifo = ptr::null_mut();
            }
            if !self.client_region.is_null() {
                libc::munmap(self.client_region.cast(), metrics.client_region_bytes());
                self.client_region = ptr::null_mut();
            }
        }
    }

    #[inline]
    pub(crate) fn pool(&self) -> *const u8 {
        self.pool
    }

    /// Server FIFO slot, written by the broker, read here with `Acquire`.
    #[inline]
    pub(crate) fn server_slot(&self, index: u32) -> &AtomicU32 {
        debug_assert!(!self.server_fifo.is_null());
        // SAFETY: index is a cursor bounded by server_fifo_size and the
        // mapping covers server_fifo_size slots.
        unsafe { &*self.server_fifo.add(index as usize * SLOT_BYTES).cast() }
    }

    /// Client FIFO slot, written here with `Release`, read by the broker.
    #[inline]
    pub(crate) fn client_slot(&self, index: u32) -> &AtomicU32 {
        debug_assert!(!self.client_region.is_null());
        // SAFETY: index is a cursor bounded by client_fifo_size and the
        // mapping covers the FIFO plus the state block.
        unsafe { &*self.client_region.add(index as usize * SLOT_BYTES).cast() }
    }

    #[inline]
    pub(crate) fn state(&self) -> &ClientState {
        debug_assert!(!self.client_region.is_null());
        // SAFETY: the client region mapping extends state_offset +
        // size_of::<ClientState>() bytes; the block is private to this client.
        unsafe { &*self.client_region.add(self.state_offset).cast() }
    }

    #[inline]
    pub(crate) fn state_mut(&mut self) -> &mut ClientState {
        debug_assert!(!self.client_region.is_null());
        // SAFETY: as in `state`; `&mut self` guarantees exclusive access.
        unsafe { &mut *self.client_region.add(self.state_offset).cast() }
    }
}

fn map_region(
    addr: *mut u8,
    len: usize,
    prot: libc::c_int,
    flags: libc::c_int,
    fd: RawFd,
) -> io::Result<*mut u8> {
    // SAFETY: len is non-zero for every region a validated metrics describes;
    // a MAP_FIXED addr is the caller's reservation to clobber.
    let map = unsafe { libc::mmap(addr.cast(), len, prot, flags, fd, 0) };
    if map == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(map.cast())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::os::fd::FromRawFd;

    fn memfd(name: &str, len: usize) -> OwnedFd {
        let cname = CString::new(name).unwrap();
        // SAFETY: cname is a valid C string; flags are a plain bitmask.
        let fd = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) };
        assert!(fd >= 0, "memfd_create failed: {}", io::Error::last_os_error());
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        // SAFETY: fd is a fresh memfd.
        let rc = unsafe { libc::ftruncate(fd, len as libc::off_t) };
        assert_eq!(rc, 0, "ftruncate failed: {}", io::Error::last_os_error());
        owned
    }

    fn reserve(len: usize) -> *mut u8 {
        // SAFETY: plain anonymous PROT_NONE reservation.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED);
        addr.cast()
    }

    fn sample_metrics() -> SharedMetrics {
        SharedMetrics::new(4096, 2, 4, 4, 0)
    }

    #[test]
    fn map_and_unmap_all_regions() {
        let metrics = sample_metrics();
        let fds = [
            memfd("test-pool", metrics.pool_bytes()),
            memfd("test-server-fifo", metrics.server_fifo_bytes()),
            memfd("test-client-region", metrics.client_region_bytes()),
        ];
        let base = reserve(metrics.pool_bytes());

        let mut regions = SharedRegions::empty();
        regions.map(&metrics, base, &fds).unwrap();
        assert!(!regions.pool().is_null());
        regions.unmap(&metrics);
        assert!(regions.pool().is_null());
    }

    #[test]
    fn partial_failure_unwinds_only_what_was_mapped() {
        let metrics = sample_metrics();
        // A pipe cannot be mmapped, so the client-region mapping fails after
        // the first two regions are established.
        let mut pipe_fds = [0 as libc::c_int; 2];
        // SAFETY: pipe_fds points at two writable slots.
        let rc = unsafe { libc::pipe(pipe_fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        // SAFETY: ownership of both pipe ends transfers here.
        let pipe_read = unsafe { OwnedFd::from_raw_fd(pipe_fds[0]) };
        let _pipe_write = unsafe { OwnedFd::from_raw_fd(pipe_fds[1]) };

        let fds = [
            memfd("test-pool-partial", metrics.pool_bytes()),
            memfd("test-server-fifo-partial", metrics.server_fifo_bytes()),
            pipe_read,
        ];
        let base = reserve(metrics.pool_bytes());

        let mut regions = SharedRegions::empty();
        assert!(regions.map(&metrics, base, &fds).is_err());
        // Pool and server FIFO were mapped; the client region never was.
        // Unwind must release the former and skip the latter without fault.
        regions.unmap(&metrics);
        assert!(regions.pool().is_null());
        // A second unwind is a no-op.
        regions.unmap(&metrics);
    }
}
