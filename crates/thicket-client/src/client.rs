//! The client runtime: one socket handshake, three mappings, two FIFOs.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::Ordering;

use thicket_primitives::{
    BIND_FD_COUNT, BufferId, BufferRef, METRICS_WIRE_LEN, Request, SLOT_BYTES, SharedMetrics,
    TOKEN_RESPONSE_LEN, TokenResponse, next_slot,
};

use crate::error::ClientError;
use crate::mapping::SharedRegions;

/// A live binding to one logical queue of a thicket broker.
///
/// Owns the handshake socket (the broker tears the binding down when it
/// closes) and the three shared-memory mappings. Steady-state operations are
/// wait-free single-reader/single-writer ring accesses; nothing here takes a
/// lock or issues a syscall after `open` returns.
#[derive(Debug)]
pub struct Client {
    // Kept open for the life of the binding; dropping it signals teardown.
    _socket: UnixStream,
    regions: SharedRegions,
}

// SAFETY: the mappings are process-local and every steady-state operation
// takes &mut self, so moving a Client between threads is sound. It is
// deliberately !Sync: one binding is single-reader/single-writer.
unsafe impl Send for Client {}

/// Snapshot of the two private cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStatus {
    /// Read cursor into the server FIFO.
    pub server_fifo_index: u32,
    /// Write cursor into the client FIFO.
    pub client_fifo_index: u32,
}

impl Client {
    /// Request a capability token without binding a queue.
    ///
    /// Opens a connection, performs the token exchange, and closes it. This
    /// path never maps shared memory.
    pub fn request_token(addr: impl AsRef<Path>) -> Result<TokenResponse, ClientError> {
        let mut socket = UnixStream::connect(addr).map_err(ClientError::Transport)?;
        socket
            .write_all(&Request::token().to_bytes())
            .map_err(ClientError::Transport)?;

        let mut frame = [0u8; TOKEN_RESPONSE_LEN];
        let got = read_up_to(&mut socket, &mut frame).map_err(ClientError::Transport)?;
        if got < TOKEN_RESPONSE_LEN {
            return Err(ClientError::ShortResponse {
                expected: TOKEN_RESPONSE_LEN,
                found: got,
            });
        }
        Ok(TokenResponse::from_bytes(frame))
    }

    /// Bind to logical queue `qid` of the broker at `addr`.
    ///
    /// `pool_base` is the page-aligned address the buffer pool will be mapped
    /// at (`MAP_FIXED`), so id-to-payload arithmetic stays stable across the
    /// process. The caller is expected to have reserved that range.
    ///
    /// On success this client owns the three mappings; the transferred handles
    /// are closed before returning since only the mappings matter afterwards.
    /// Every failure tears down whatever was established and leaves no partial
    /// state behind.
    pub fn open(
        addr: impl AsRef<Path>,
        qid: u32,
        pool_base: *mut u8,
    ) -> Result<Self, ClientError> {
        if pool_base.is_null() {
            return Err(ClientError::InvalidArgument("pool base address required"));
        }

        let mut socket = UnixStream::connect(addr).map_err(ClientError::Transport)?;
        socket
            .write_all(&Request::queue_bind(qid).to_bytes())
            .map_err(ClientError::Transport)?;

        let (metrics, fds) = recv_bind_response(&socket)?;
        metrics.validate()?;

        let mut regions = SharedRegions::empty();
        if let Err(e) = regions.map(&metrics, pool_base, &fds) {
            regions.unmap(&metrics);
            return Err(ClientError::Mapping(e));
        }
        // Handles are only needed for mapping; the mappings keep the memory
        // alive from here on.
        drop(fds);

        // The broker seeds the state block with zeroed cursors and its metrics
        // copy; a disagreement with the wire copy means the two sides are not
        // looking at the same binding.
        if regions.state().metrics != metrics {
            regions.unmap(&metrics);
            return Err(ClientError::ControlData(
                "state block disagrees with wire metrics",
            ));
        }

        tracing::debug!(
            qid,
            buffer_count = metrics.buffer_count,
            buffer_bytes = metrics.buffer_bytes,
            "queue binding established"
        );

        Ok(Self {
            _socket: socket,
            regions,
        })
    }

    /// Geometry of this binding, read from the state block.
    #[inline]
    pub fn metrics(&self) -> &SharedMetrics {
        &self.regions.state().metrics
    }

    /// Take the next buffer handed to us by the broker.
    ///
    /// Returns `None` when the server FIFO is empty at the read cursor: a
    /// normal, retryable "not ready yet", not an error. Buffers are observed
    /// in exactly the order the broker enqueued them.
    #[inline]
    pub fn acquire(&mut self) -> Option<BufferRef> {
        let index = self.regions.state().server_fifo_index;
        let id = BufferId::from_raw(self.regions.server_slot(index).load(Ordering::Acquire));
        if id.is_empty() {
            return None;
        }
        let len = self.regions.state().metrics.server_fifo_size;
        self.regions.state_mut().server_fifo_index = next_slot(index, len);
        Some(id.decode())
    }

    /// Return a buffer to the broker.
    ///
    /// Single-writer: the private write cursor advances by one slot, wrapping
    /// at the client FIFO length.
    #[inline]
    pub fn release(&mut self, id: BufferId) {
        let index = self.regions.state().client_fifo_index;
        self.regions
            .client_slot(index)
            .store(id.raw(), Ordering::Release);
        let len = self.regions.state().metrics.client_fifo_size;
        self.regions.state_mut().client_fifo_index = next_slot(index, len);
    }

    /// Non-destructive readiness check: is the next server FIFO slot
    /// populated? Advances no cursor.
    #[inline]
    pub fn buffer_available(&self) -> bool {
        let index = self.regions.state().server_fifo_index;
        !BufferId::from_raw(self.regions.server_slot(index).load(Ordering::Acquire)).is_empty()
    }

    /// Payload address of pool buffer `index`, or `None` when the index is
    /// outside the pool. Pure arithmetic against the fixed pool base.
    #[inline]
    pub fn buffer_ptr(&self, index: u32) -> Option<*const u8> {
        let metrics = &self.regions.state().metrics;
        if (index as u64) >= metrics.buffer_count {
            return None;
        }
        // SAFETY: index is in bounds, so the offset stays within the pool
        // mapping.
        Some(unsafe {
            self.regions
                .pool()
                .add(index as usize * metrics.buffer_bytes as usize)
        })
    }

    /// Current cursor positions.
    pub fn status(&self) -> ClientStatus {
        let state = self.regions.state();
        ClientStatus {
            server_fifo_index: state.server_fifo_index,
            client_fifo_index: state.client_fifo_index,
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Copy the geometry out before the state block's mapping goes away.
        let metrics = self.regions.state().metrics;
        self.regions.unmap(&metrics);
    }
}

/// Read until `buf` is full, EOF, or an error. Returns the bytes read; a
/// short count is the caller's protocol violation to report.
fn read_up_to(socket: &mut UnixStream, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match socket.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Receive the queue-bind response: a metrics payload plus exactly three
/// handles in one `SCM_RIGHTS` block, ordered (pool, server FIFO, client
/// FIFO). Any received handles are closed before a validation error is
/// returned.
fn recv_bind_response(
    socket: &UnixStream,
) -> Result<(SharedMetrics, [OwnedFd; BIND_FD_COUNT]), ClientError> {
    // One spare slot so an over-long payload is detectable as a length
    // mismatch rather than silently truncated.
    let mut payload = [0u8; METRICS_WIRE_LEN + SLOT_BYTES];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };

    const FD_BYTES: usize = BIND_FD_COUNT * std::mem::size_of::<libc::c_int>();
    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space = unsafe { libc::CMSG_SPACE(FD_BYTES as u32) } as usize;
    let mut control = vec![0u8; cmsg_space];

    // SAFETY: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_control = control.as_mut_ptr().cast();
    msghdr.msg_controllen = control.len() as _;

    // SAFETY: msghdr points to live iov/control buffers.
    let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msghdr, 0) };
    if n < 0 {
        return Err(ClientError::Transport(io::Error::last_os_error()));
    }
    let n = n as usize;
    if n != METRICS_WIRE_LEN {
        // Covers the broker closing the connection without replying (a
        // rejected bind) as well as a malformed payload.
        close_cmsg_fds(&msghdr);
        return Err(ClientError::ShortResponse {
            expected: METRICS_WIRE_LEN,
            found: n,
        });
    }
    if msghdr.msg_flags & libc::MSG_CTRUNC != 0 {
        close_cmsg_fds(&msghdr);
        return Err(ClientError::ControlData("truncated ancillary data"));
    }

    // SAFETY: the control buffer was sized with CMSG_SPACE and filled by
    // recvmsg.
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msghdr) };
    if cmsg.is_null() {
        return Err(ClientError::ControlData("missing ancillary data"));
    }
    // SAFETY: cmsg was returned by CMSG_FIRSTHDR over a valid msghdr.
    let (level, typ, len) = unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type, (*cmsg).cmsg_len) };
    // SAFETY: CMSG_LEN is a pure size computation.
    if level != libc::SOL_SOCKET
        || typ != libc::SCM_RIGHTS
        || len as usize != unsafe { libc::CMSG_LEN(FD_BYTES as u32) } as usize
    {
        close_cmsg_fds(&msghdr);
        return Err(ClientError::ControlData(
            "expected exactly three SCM_RIGHTS handles",
        ));
    }

    let mut raw_fds = [0 as libc::c_int; BIND_FD_COUNT];
    // SAFETY: the cmsg carries exactly FD_BYTES of fd data, checked above.
    unsafe {
        std::ptr::copy_nonoverlapping(
            libc::CMSG_DATA(cmsg).cast::<libc::c_int>(),
            raw_fds.as_mut_ptr(),
            BIND_FD_COUNT,
        );
    }
    // SAFETY: SCM_RIGHTS transferred ownership of these descriptors to us.
    let fds = raw_fds.map(|fd| unsafe { OwnedFd::from_raw_fd(fd) });

    let metrics = SharedMetrics::from_bytes(&payload[..METRICS_WIRE_LEN])?;
    Ok((metrics, fds))
}

/// Close any descriptors sitting in a received control block; used on the
/// validation error paths so a malformed response cannot leak handles.
fn close_cmsg_fds(msghdr: &libc::msghdr) {
    // SAFETY: msghdr points at the control buffer recvmsg just filled.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msghdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let base = libc::CMSG_LEN(0) as usize;
                let bytes = ((*cmsg).cmsg_len as usize).saturating_sub(base);
                let count = bytes / std::mem::size_of::<libc::c_int>();
                let data = libc::CMSG_DATA(cmsg).cast::<libc::c_int>();
                for i in 0..count {
                    libc::close(*data.add(i));
                }
            }
            cmsg = libc::CMSG_NXTHDR(msghdr, cmsg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::path::PathBuf;
    use std::thread;

    use thicket_primitives::PROTOCOL_VERSION;

    fn temp_sock(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "thicket-client-{tag}-{}.sock",
            std::process::id()
        ));
        std::fs::remove_file(&path).ok();
        path
    }

    /// A one-connection fake broker running `serve` against the accepted
    /// stream.
    fn fake_broker(
        tag: &str,
        serve: impl FnOnce(UnixStream) + Send + 'static,
    ) -> (PathBuf, thread::JoinHandle<()>) {
        let path = temp_sock(tag);
        let listener = UnixListener::bind(&path).unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve(stream);
        });
        (path, handle)
    }

    fn reserve(len: usize) -> *mut u8 {
        // SAFETY: anonymous PROT_NONE reservation for a fixed-address map.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
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

    fn sendmsg_with_fds(stream: &UnixStream, payload: &[u8], fds: &[libc::c_int]) {
        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        let fd_bytes = fds.len() * std::mem::size_of::<libc::c_int>();
        let space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
        let mut control = vec![0u8; space];

        let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
        msghdr.msg_iov = &mut iov;
        msghdr.msg_iovlen = 1;
        msghdr.msg_control = control.as_mut_ptr().cast();
        msghdr.msg_controllen = control.len() as _;

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msghdr);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as _;
            std::ptr::copy_nonoverlapping(
                fds.as_ptr(),
                libc::CMSG_DATA(cmsg).cast::<libc::c_int>(),
                fds.len(),
            );
            let n = libc::sendmsg(stream.as_raw_fd(), &msghdr, 0);
            assert_eq!(n as usize, payload.len());
        }
    }

    #[test]
    fn token_exchange() {
        let (path, broker) = fake_broker("token-ok", |mut stream| {
            let mut req = [0u8; thicket_primitives::REQUEST_LEN];
            stream.read_exact(&mut req).unwrap();
            let decoded = Request::from_bytes(&req).unwrap();
            assert_eq!(decoded, Request::token());
            stream
                .write_all(&TokenResponse::new(42).to_bytes())
                .unwrap();
        });

        let token = Client::request_token(&path).unwrap();
        assert_eq!(token.token, 42);
        broker.join().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn token_short_read_is_protocol_violation() {
        let (path, broker) = fake_broker("token-short", |mut stream| {
            let mut req = [0u8; 12];
            stream.read_exact(&mut req).unwrap();
            stream.write_all(&[0u8; 10]).unwrap();
            // Close without completing the record.
        });

        let err = Client::request_token(&path).unwrap_err();
        assert!(matches!(
            err,
            ClientError::ShortResponse {
                expected: TOKEN_RESPONSE_LEN,
                found: 10
            }
        ));
        assert!(err.is_protocol_violation());
        broker.join().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_socket_is_transport_failure() {
        let err = Client::request_token("/nonexistent/thicket.sock").unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
        assert!(!err.is_protocol_violation());
    }

    #[test]
    fn null_pool_base_rejected_before_connecting() {
        let err = Client::open("/nonexistent/thicket.sock", 0, std::ptr::null_mut()).unwrap_err();
        // InvalidArgument, not Transport: validation precedes any socket work.
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[test]
    fn bind_response_without_handles_is_protocol_violation() {
        let metrics = SharedMetrics::new(4096, 2, 4, 4, 0);
        let (path, broker) = fake_broker("bind-no-fds", move |mut stream| {
            let mut req = [0u8; 12];
            stream.read_exact(&mut req).unwrap();
            // Metrics payload without any SCM_RIGHTS block.
            stream.write_all(&metrics.to_bytes()).unwrap();
        });

        let base = reserve(metrics.pool_bytes());
        let err = Client::open(&path, 0, base).unwrap_err();
        assert!(matches!(err, ClientError::ControlData(_)));
        broker.join().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn bind_version_mismatch_rejected_before_mapping() {
        let mut metrics = SharedMetrics::new(4096, 2, 4, 4, 0);
        metrics.version = PROTOCOL_VERSION + 1;
        let (path, broker) = fake_broker("bind-bad-version", move |mut stream| {
            let mut req = [0u8; 12];
            stream.read_exact(&mut req).unwrap();
            // Three perfectly good handles accompany a bad version; the
            // client must close them all and map nothing.
            let make_memfd = || {
                let name = std::ffi::CString::new("bad-version-fd").unwrap();
                let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
                assert!(fd >= 0);
                unsafe { libc::ftruncate(fd, 4096) };
                fd
            };
            let fds = [make_memfd(), make_memfd(), make_memfd()];
            sendmsg_with_fds(&stream, &metrics.to_bytes(), &fds);
            for fd in fds {
                unsafe { libc::close(fd) };
            }
        });

        let base = reserve(metrics.pool_bytes());
        let err = Client::open(&path, 0, base).unwrap_err();
        assert!(matches!(
            err,
            ClientError::Metrics(thicket_primitives::MetricsError::VersionMismatch { .. })
        ));
        assert!(err.is_protocol_violation());
        broker.join().unwrap();
        std::fs::remove_file(&path).ok();
    }
}
