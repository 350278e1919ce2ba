//! Sending the queue-bind response: one datagram-like write carrying the
//! metrics payload and the three region descriptors in a single `SCM_RIGHTS`
//! block.
//!
//! Tokio's `UnixStream` has no ancillary-data API, so this drops to raw
//! `sendmsg` behind `try_io`, retrying on `WouldBlock` after re-arming
//! writable interest.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use tokio::io::Interest;
use tokio::net::UnixStream;

use thicket_primitives::{BIND_FD_COUNT, METRICS_WIRE_LEN, SharedMetrics};

/// Send `metrics` plus the `(pool, server FIFO, client region)` descriptors
/// over `stream`. The payload and the control block go out in one `sendmsg`;
/// Unix sockets do not split them.
pub(crate) async fn send_bind_response(
    stream: &UnixStream,
    metrics: &SharedMetrics,
    fds: [RawFd; BIND_FD_COUNT],
) -> io::Result<()> {
    let payload = metrics.to_bytes();
    loop {
        stream.writable().await?;
        match stream.try_io(Interest::WRITABLE, || {
            sendmsg_with_fds(stream.as_raw_fd(), &payload, &fds)
        }) {
            Ok(n) => {
                if n != METRICS_WIRE_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "short write on bind response",
                    ));
                }
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

fn sendmsg_with_fds(socket: RawFd, payload: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let fd_bytes = std::mem::size_of_val(fds);
    // SAFETY: CMSG_SPACE is a pure size computation.
    let space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
    let mut control = vec![0u8; space];

    // SAFETY: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_control = control.as_mut_ptr().cast();
    msghdr.msg_controllen = control.len() as _;

    // SAFETY: the control buffer was sized for exactly this fd count.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msghdr);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as _;
        std::ptr::copy_nonoverlapping(fds.as_ptr(), libc::CMSG_DATA(cmsg).cast::<RawFd>(), fds.len());
    }

    // MSG_NOSIGNAL: a vanished client must surface as EPIPE, not kill the
    // broker.
    // SAFETY: msghdr points to live iov/control buffers.
    let n = unsafe { libc::sendmsg(socket, &msghdr, libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}
