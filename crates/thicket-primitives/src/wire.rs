//! Handshake wire records.
//!
//! A client opens one connection to the broker's Unix socket, sends exactly
//! one fixed-size [`Request`], and expects exactly one response:
//!
//! - [`RequestKind::Token`]: a fixed-size [`TokenResponse`]; the connection is
//!   then closed. This path never touches shared memory.
//! - [`RequestKind::QueueBind`]: a 48-byte [`crate::SharedMetrics`] payload
//!   accompanied by exactly [`BIND_FD_COUNT`] resource handles in a single
//!   `SCM_RIGHTS` block, ordered (pool, server FIFO, client FIFO).
//!
//! All integers are little-endian. The broker rejects a mismatched version or
//! unknown kind by closing the connection; the client observes a short read
//! and reports a protocol violation.

use core::fmt;

use crate::metrics::PROTOCOL_VERSION;

/// Encoded request length.
pub const REQUEST_LEN: usize = 12;

/// Encoded token response length.
pub const TOKEN_RESPONSE_LEN: usize = 16;

/// Number of handles accompanying a queue-bind response.
pub const BIND_FD_COUNT: usize = 3;

/// Position of the buffer-pool handle in the transferred set.
pub const FD_POOL: usize = 0;
/// Position of the server-FIFO handle.
pub const FD_SERVER_FIFO: usize = 1;
/// Position of the client-FIFO (plus state block) handle.
pub const FD_CLIENT_FIFO: usize = 2;

/// Highest controller id accepted by the spawn/bind glue.
pub const MAX_CONTROLLER_ID: u32 = 255;

/// Highest logical queue id accepted by the bind glue.
pub const MAX_QUEUE_ID: u32 = 255;

/// What a connection is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestKind {
    /// Capability-token query; no queue is bound and nothing is mapped.
    Token = 0,
    /// Bind to a logical queue and receive the shared-memory handles.
    QueueBind = 1,
}

/// Fixed-size handshake request (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Must equal the broker's compiled [`PROTOCOL_VERSION`].
    pub version: u32,
    pub kind: RequestKind,
    /// Logical queue id; meaningful only for [`RequestKind::QueueBind`].
    pub qid: u32,
}

impl Request {
    /// A token query.
    pub fn token() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind: RequestKind::Token,
            qid: 0,
        }
    }

    /// A bind request for logical queue `qid`.
    pub fn queue_bind(qid: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind: RequestKind::QueueBind,
            qid,
        }
    }

    pub fn to_bytes(&self) -> [u8; REQUEST_LEN] {
        let mut out = [0u8; REQUEST_LEN];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..8].copy_from_slice(&(self.kind as u32).to_le_bytes());
        out[8..12].copy_from_slice(&self.qid.to_le_bytes());
        out
    }

    /// Decode and validate an incoming request.
    pub fn from_bytes(frame: &[u8]) -> Result<Self, WireError> {
        if frame.len() != REQUEST_LEN {
            return Err(WireError::Truncated {
                context: "request",
                expected: REQUEST_LEN,
                found: frame.len(),
            });
        }
        let version = u32::from_le_bytes(frame[0..4].try_into().unwrap());
        if version != PROTOCOL_VERSION {
            return Err(WireError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                found: version,
            });
        }
        let kind = match u32::from_le_bytes(frame[4..8].try_into().unwrap()) {
            0 => RequestKind::Token,
            1 => RequestKind::QueueBind,
            other => return Err(WireError::UnknownRequestKind(other)),
        };
        let qid = u32::from_le_bytes(frame[8..12].try_into().unwrap());
        Ok(Self { version, kind, qid })
    }
}

/// Fixed-size capability token (16 bytes, opaque beyond size-checking).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenResponse {
    pub token: u64,
    _reserved: u64,
}

impl TokenResponse {
    pub fn new(token: u64) -> Self {
        Self {
            token,
            _reserved: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; TOKEN_RESPONSE_LEN] {
        let mut out = [0u8; TOKEN_RESPONSE_LEN];
        out[0..8].copy_from_slice(&self.token.to_le_bytes());
        out[8..16].copy_from_slice(&self._reserved.to_le_bytes());
        out
    }

    pub fn from_bytes(frame: [u8; TOKEN_RESPONSE_LEN]) -> Self {
        Self {
            token: u64::from_le_bytes(frame[0..8].try_into().unwrap()),
            _reserved: u64::from_le_bytes(frame[8..16].try_into().unwrap()),
        }
    }
}

/// Errors from decoding handshake records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Record shorter (or longer) than its fixed size.
    Truncated {
        context: &'static str,
        expected: usize,
        found: usize,
    },
    /// Peer compiled against a different protocol version.
    VersionMismatch { expected: u32, found: u32 },
    /// Request kind outside the known enumeration.
    UnknownRequestKind(u32),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated {
                context,
                expected,
                found,
            } => write!(f, "truncated {context}: expected {expected} bytes, found {found}"),
            Self::VersionMismatch { expected, found } => {
                write!(f, "protocol version mismatch: expected {expected}, found {found}")
            }
            Self::UnknownRequestKind(kind) => write!(f, "unknown request kind: {kind}"),
        }
    }
}

impl std::error::Error for WireError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        for req in [Request::token(), Request::queue_bind(7)] {
            let decoded = Request::from_bytes(&req.to_bytes()).unwrap();
            assert_eq!(decoded, req);
        }
    }

    #[test]
    fn request_rejects_version_mismatch() {
        let mut frame = Request::queue_bind(0).to_bytes();
        frame[0..4].copy_from_slice(&(PROTOCOL_VERSION + 1).to_le_bytes());
        assert!(matches!(
            Request::from_bytes(&frame),
            Err(WireError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn request_rejects_unknown_kind() {
        let mut frame = Request::token().to_bytes();
        frame[4..8].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            Request::from_bytes(&frame),
            Err(WireError::UnknownRequestKind(9))
        ));
    }

    #[test]
    fn request_rejects_truncation() {
        let frame = Request::token().to_bytes();
        assert!(matches!(
            Request::from_bytes(&frame[..8]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn token_roundtrip() {
        let resp = TokenResponse::new(0xDEAD_BEEF_0042);
        assert_eq!(TokenResponse::from_bytes(resp.to_bytes()), resp);
    }
}
