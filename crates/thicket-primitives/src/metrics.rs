//! Shared geometry descriptor and per-client state block.
//!
//! # Memory layout
//!
//! ```text
//! +--------------------------------------------------------------+
//! | Buffer pool        buffer_count * buffer_bytes               |
//! |   broker: read-write    client: read-only, fixed address     |
//! +--------------------------------------------------------------+
//! | Server FIFO        server_fifo_size * 4 bytes                |
//! |   broker: read-write    client: read-only                    |
//! +--------------------------------------------------------------+
//! | Client FIFO        client_fifo_size * 4 bytes                |
//! | ClientState        at state_offset (56 bytes)                |
//! |   one read-write mapping covering both                       |
//! +--------------------------------------------------------------+
//! ```
//!
//! [`SharedMetrics`] is authored by the broker, sent once per bind as the
//! payload of the handle-bearing response, and copied into the state block so
//! the client never re-derives geometry after mapping. Every region size is a
//! function of this descriptor and nothing else.

use core::fmt;
use core::mem::size_of;

use crate::fifo::SLOT_BYTES;

/// Current handshake/layout protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Wire length of an encoded [`SharedMetrics`].
pub const METRICS_WIRE_LEN: usize = 48;

/// The buffer pool is backed by huge pages; the client must map it with
/// `MAP_HUGETLB`.
pub const METRICS_FLAG_HUGE_POOL: u32 = 1 << 0;

/// Broker-authored geometry descriptor (48 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedMetrics {
    /// Protocol version; a mismatch aborts the bind.
    pub version: u32,
    /// Feature flags ([`METRICS_FLAG_HUGE_POOL`]).
    pub flags: u32,
    /// Size of one pool buffer in bytes.
    pub buffer_bytes: u64,
    /// Number of buffers in the pool.
    pub buffer_count: u64,
    /// Server FIFO length in slots.
    pub server_fifo_size: u64,
    /// Client FIFO length in slots.
    pub client_fifo_size: u64,
    /// Byte offset of the [`ClientState`] block within the client region.
    pub state_offset: u64,
}

const _: () = assert!(size_of::<SharedMetrics>() == METRICS_WIRE_LEN);

impl SharedMetrics {
    /// Build a descriptor with the state block placed after the client FIFO,
    /// rounded up so the block stays aligned for any FIFO length.
    pub fn new(
        buffer_bytes: u64,
        buffer_count: u64,
        server_fifo_size: u64,
        client_fifo_size: u64,
        flags: u32,
    ) -> Self {
        let fifo_bytes = client_fifo_size * SLOT_BYTES as u64;
        Self {
            version: PROTOCOL_VERSION,
            flags,
            buffer_bytes,
            buffer_count,
            server_fifo_size,
            client_fifo_size,
            state_offset: fifo_bytes.next_multiple_of(align_of::<ClientState>() as u64),
        }
    }

    /// Validate the descriptor against the compiled protocol version and the
    /// id encoding limits.
    pub fn validate(&self) -> Result<(), MetricsError> {
        if self.version != PROTOCOL_VERSION {
            return Err(MetricsError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                found: self.version,
            });
        }
        if self.buffer_bytes == 0 || self.buffer_count == 0 {
            return Err(MetricsError::InvalidGeometry("empty buffer pool"));
        }
        if self.server_fifo_size == 0 || self.client_fifo_size == 0 {
            return Err(MetricsError::InvalidGeometry("zero-length FIFO"));
        }
        if self.buffer_count - 1 > crate::buffer_id::MAX_INDEX as u64 {
            return Err(MetricsError::InvalidGeometry(
                "buffer_count exceeds the id encoding",
            ));
        }
        if self.state_offset < self.client_fifo_size * SLOT_BYTES as u64 {
            return Err(MetricsError::InvalidGeometry(
                "state block overlaps the client FIFO",
            ));
        }
        if self.state_offset % align_of::<ClientState>() as u64 != 0 {
            return Err(MetricsError::InvalidGeometry("misaligned state block"));
        }
        usize::try_from(self.state_offset)
            .ok()
            .and_then(|offset| offset.checked_add(size_of::<ClientState>()))
            .ok_or(MetricsError::InvalidGeometry("client region overflow"))?;
        self.buffer_bytes
            .checked_mul(self.buffer_count)
            .and_then(|v| usize::try_from(v).ok())
            .ok_or(MetricsError::InvalidGeometry("pool size overflow"))?;
        Ok(())
    }

    /// Total pool mapping length.
    #[inline]
    pub fn pool_bytes(&self) -> usize {
        (self.buffer_bytes * self.buffer_count) as usize
    }

    /// Server FIFO mapping length.
    #[inline]
    pub fn server_fifo_bytes(&self) -> usize {
        self.server_fifo_size as usize * SLOT_BYTES
    }

    /// Client FIFO length in bytes (excluding the state block).
    #[inline]
    pub fn client_fifo_bytes(&self) -> usize {
        self.client_fifo_size as usize * SLOT_BYTES
    }

    /// Length of the client region mapping: FIFO plus state block.
    #[inline]
    pub fn client_region_bytes(&self) -> usize {
        self.state_offset as usize + size_of::<ClientState>()
    }

    /// Pool is huge-page backed.
    #[inline]
    pub fn huge_pool(&self) -> bool {
        self.flags & METRICS_FLAG_HUGE_POOL != 0
    }

    /// Encode for the handshake wire (little-endian, fixed size).
    pub fn to_bytes(&self) -> [u8; METRICS_WIRE_LEN] {
        let mut out = [0u8; METRICS_WIRE_LEN];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8..16].copy_from_slice(&self.buffer_bytes.to_le_bytes());
        out[16..24].copy_from_slice(&self.buffer_count.to_le_bytes());
        out[24..32].copy_from_slice(&self.server_fifo_size.to_le_bytes());
        out[32..40].copy_from_slice(&self.client_fifo_size.to_le_bytes());
        out[40..48].copy_from_slice(&self.state_offset.to_le_bytes());
        out
    }

    /// Decode from the handshake wire. Length and version are the caller's
    /// protocol checks; this only requires the fixed size.
    pub fn from_bytes(frame: &[u8]) -> Result<Self, MetricsError> {
        if frame.len() != METRICS_WIRE_LEN {
            return Err(MetricsError::WrongLength {
                expected: METRICS_WIRE_LEN,
                found: frame.len(),
            });
        }
        let u32_at = |i: usize| u32::from_le_bytes(frame[i..i + 4].try_into().unwrap());
        let u64_at = |i: usize| u64::from_le_bytes(frame[i..i + 8].try_into().unwrap());
        Ok(Self {
            version: u32_at(0),
            flags: u32_at(4),
            buffer_bytes: u64_at(8),
            buffer_count: u64_at(16),
            server_fifo_size: u64_at(24),
            client_fifo_size: u64_at(32),
            state_offset: u64_at(40),
        })
    }
}

/// Mutable per-client record, co-located with the client FIFO (56 bytes).
///
/// Owned by exactly one client for the life of a binding; invisible to other
/// clients. The broker zero-initializes the cursors and writes the metrics
/// copy when it creates the binding. Cursors do not survive reconnection.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClientState {
    /// Read cursor into the server FIFO.
    pub server_fifo_index: u32,
    /// Write cursor into the client FIFO.
    pub client_fifo_index: u32,
    /// Authoritative geometry; unmap sizes are re-derived from here.
    pub metrics: SharedMetrics,
}

const _: () = assert!(size_of::<ClientState>() == 56);

/// Errors from validating or decoding a [`SharedMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsError {
    /// Embedded version does not match the compiled protocol version.
    VersionMismatch { expected: u32, found: u32 },
    /// Payload is not exactly [`METRICS_WIRE_LEN`] bytes.
    WrongLength { expected: usize, found: usize },
    /// Geometry that cannot describe a usable binding.
    InvalidGeometry(&'static str),
}

impl fmt::Display for MetricsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VersionMismatch { expected, found } => {
                write!(f, "metrics version mismatch: expected {expected}, found {found}")
            }
            Self::WrongLength { expected, found } => {
                write!(f, "metrics payload length mismatch: expected {expected}, found {found}")
            }
            Self::InvalidGeometry(msg) => write!(f, "invalid metrics geometry: {msg}"),
        }
    }
}

impl std::error::Error for MetricsError {}
