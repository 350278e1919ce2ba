//! Client runtime for the thicket buffer broker.
//!
//! A [`Client`] performs one handshake over the broker's Unix socket, receives
//! the geometry descriptor plus three shared-memory handles, maps the buffer
//! pool (read-only, at a caller-chosen fixed address), the server FIFO
//! (read-only) and the client FIFO with its state block (read-write), and then
//! exchanges buffer ownership purely through the FIFOs, with no syscalls on
//! the hot path.
//!
//! ```no_run
//! use thicket_client::Client;
//!
//! # fn run(pool_base: *mut u8) -> Result<(), thicket_client::ClientError> {
//! let mut client = Client::open("/run/thicket/controller-0.sock", 0, pool_base)?;
//! while let Some(buf) = client.acquire() {
//!     // ... consume the payload at client.buffer_ptr(buf.index) ...
//!     client.release(buf.encode());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! `acquire`/`release`/`buffer_available` never block; an empty server FIFO is
//! a normal "not ready" result, not an error. One binding is single-threaded
//! by construction (`&mut self`); wrap the client in external synchronization
//! if several threads must share it.

mod client;
mod error;
mod mapping;

pub use client::{Client, ClientStatus};
pub use error::ClientError;
pub use thicket_primitives::{BufferId, BufferRef, SharedMetrics, TokenResponse};
