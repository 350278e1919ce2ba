//! Protocol core for the thicket buffer broker.
//!
//! A thicket broker owns a pool of receive buffers in shared memory and hands
//! subsets of it to client processes. This crate defines everything both sides
//! must agree on byte-for-byte:
//!
//! - [`BufferId`]: the 32-bit (index, sentinel) word carried through the FIFOs
//! - [`SharedMetrics`] / [`ClientState`]: the `repr(C)` geometry descriptor and
//!   the per-client mutable state block
//! - [`Request`] / [`TokenResponse`]: the fixed-size handshake records
//! - FIFO cursor arithmetic ([`fifo`])
//!
//! Nothing in here performs I/O or maps memory; the client and broker crates
//! build on these layouts.

pub mod buffer_id;
pub mod fifo;
pub mod metrics;
pub mod wire;

pub use buffer_id::{BufferId, BufferRef, MAX_INDEX};
pub use fifo::{SLOT_BYTES, next_slot};
pub use metrics::{
    ClientState, METRICS_FLAG_HUGE_POOL, METRICS_WIRE_LEN, MetricsError, PROTOCOL_VERSION,
    SharedMetrics,
};
pub use wire::{
    BIND_FD_COUNT, FD_CLIENT_FIFO, FD_POOL, FD_SERVER_FIFO, MAX_CONTROLLER_ID, MAX_QUEUE_ID,
    REQUEST_LEN, Request, RequestKind, TOKEN_RESPONSE_LEN, TokenResponse, WireError,
};
