//! Client-side error taxonomy.

use std::fmt;
use std::io;

use thicket_primitives::{MetricsError, WireError};

/// Errors from the handshake and mapping path.
///
/// The taxonomy keeps three failure families apart: transport failures
/// (transient I/O, retry is the caller's call), protocol violations (a
/// broker/client mismatch; retrying cannot help), and mapping failures
/// (resource exhaustion while establishing the shared regions). An empty
/// server FIFO is never an error; [`crate::Client::acquire`] reports it as
/// `None`.
#[derive(Debug)]
pub enum ClientError {
    /// Caller-supplied argument rejected before any transport activity.
    InvalidArgument(&'static str),
    /// Connect/send/receive failure, carrying the underlying system error.
    Transport(io::Error),
    /// Response carried fewer bytes than its fixed record size.
    ShortResponse { expected: usize, found: usize },
    /// Missing or malformed ancillary data on a queue-bind response.
    ControlData(&'static str),
    /// Malformed handshake record.
    Wire(WireError),
    /// Rejected geometry descriptor (including a version mismatch).
    Metrics(MetricsError),
    /// mmap failed for one of the three shared regions; everything already
    /// established was torn down before this was returned.
    Mapping(io::Error),
}

impl ClientError {
    /// True for the protocol-violation family: the broker and this client
    /// disagree about the protocol, as opposed to a transient I/O problem.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::ShortResponse { .. } | Self::ControlData(_) | Self::Wire(_) | Self::Metrics(_)
        )
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Transport(e) => write!(f, "transport failure: {e}"),
            Self::ShortResponse { expected, found } => {
                write!(f, "short response: expected {expected} bytes, got {found}")
            }
            Self::ControlData(msg) => write!(f, "protocol violation: {msg}"),
            Self::Wire(e) => write!(f, "protocol violation: {e}"),
            Self::Metrics(e) => write!(f, "protocol violation: {e}"),
            Self::Mapping(e) => write!(f, "mapping failure: {e}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) | Self::Mapping(e) => Some(e),
            Self::Wire(e) => Some(e),
            Self::Metrics(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WireError> for ClientError {
    fn from(value: WireError) -> Self {
        Self::Wire(value)
    }
}

impl From<MetricsError> for ClientError {
    fn from(value: MetricsError) -> Self {
        Self::Metrics(value)
    }
}
