//! The thicket broker: owns the pinned buffer pool and hands out per-queue
//! shared-memory bindings to local clients.
//!
//! One broker process serves one pool. Clients connect to a Unix socket,
//! send a single fixed-size request, and either receive a capability token
//! or a queue binding: the pool metrics plus three descriptors (pool,
//! server FIFO, client region) in one `SCM_RIGHTS` block. After that the
//! socket goes quiet; it only matters again when either side closes it,
//! which tears the binding down.
//!
//! The control plane is async (one task per connection); the data plane is
//! the FIFO slot traffic in [`binding`], which never touches the runtime.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use thicket_primitives::{
    BIND_FD_COUNT, FD_CLIENT_FIFO, FD_POOL, FD_SERVER_FIFO, MAX_INDEX, METRICS_FLAG_HUGE_POOL,
    REQUEST_LEN, Request, RequestKind, SharedMetrics, TokenResponse, WireError,
};

mod binding;
mod handshake;
mod shm;

pub use binding::QueueHandle;

use binding::Binding;
use shm::Segment;

/// Huge pages on x86-64; pool sizing must respect this when huge-page
/// backing is on.
const HUGE_PAGE_BYTES: u64 = 2 * 1024 * 1024;

// ============================================================================
// Configuration
// ============================================================================

/// Pool and FIFO geometry. Fixed for the life of a broker; every binding it
/// hands out advertises exactly this shape.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Payload bytes per buffer.
    pub buffer_bytes: u64,
    /// Buffers in the pool.
    pub buffer_count: u64,
    /// Server FIFO slots per binding; bounds outstanding handoffs.
    pub server_fifo_size: u64,
    /// Client FIFO slots per binding.
    pub client_fifo_size: u64,
    /// Back the pool with huge pages.
    pub huge_pool: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: 1 << 20,
            buffer_count: 64,
            server_fifo_size: 64,
            client_fifo_size: 64,
            huge_pool: true,
        }
    }
}

impl BrokerConfig {
    fn validate(&self) -> Result<(), BrokerError> {
        if self.buffer_bytes == 0
            || self.buffer_count == 0
            || self.server_fifo_size == 0
            || self.client_fifo_size == 0
        {
            return Err(BrokerError::Config("all geometry fields must be nonzero"));
        }
        if self.buffer_count - 1 > MAX_INDEX as u64 {
            return Err(BrokerError::Config("buffer count exceeds the id space"));
        }
        // A client releases unconditionally; the client FIFO must be able to
        // hold every buffer in the pool so the broker can never be lapped.
        if self.client_fifo_size < self.buffer_count {
            return Err(BrokerError::Config(
                "client FIFO must hold the whole pool",
            ));
        }
        let pool_bytes = self
            .buffer_bytes
            .checked_mul(self.buffer_count)
            .ok_or(BrokerError::Config("pool size overflows"))?;
        if self.huge_pool && pool_bytes % HUGE_PAGE_BYTES != 0 {
            return Err(BrokerError::Config(
                "huge-page pool size must be a multiple of 2 MiB",
            ));
        }
        Ok(())
    }

    fn metrics(&self) -> SharedMetrics {
        let flags = if self.huge_pool {
            METRICS_FLAG_HUGE_POOL
        } else {
            0
        };
        SharedMetrics::new(
            self.buffer_bytes,
            self.buffer_count,
            self.server_fifo_size,
            self.client_fifo_size,
            flags,
        )
    }
}

// ============================================================================
// Broker
// ============================================================================

pub struct Broker {
    listener: UnixListener,
    socket_path: PathBuf,
    pool: Segment,
    metrics: SharedMetrics,
    bindings: Mutex<HashMap<u32, Arc<Mutex<Binding>>>>,
    next_token: AtomicU64,
}

impl Broker {
    /// Allocate the pool and start listening on `socket_path`. A stale
    /// socket file from a previous run is removed first.
    pub fn create(socket_path: impl Into<PathBuf>, config: BrokerConfig) -> Result<Self, BrokerError> {
        config.validate()?;
        let metrics = config.metrics();

        let pool = Segment::create("thicket-pool", metrics.pool_bytes(), config.huge_pool)
            .map_err(BrokerError::Io)?;

        let socket_path = socket_path.into();
        match std::fs::remove_file(&socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(BrokerError::Io(e)),
        }
        let listener = UnixListener::bind(&socket_path).map_err(BrokerError::Io)?;

        tracing::info!(
            socket = %socket_path.display(),
            buffer_count = metrics.buffer_count,
            buffer_bytes = metrics.buffer_bytes,
            huge_pool = metrics.huge_pool(),
            "broker listening"
        );

        Ok(Self {
            listener,
            socket_path,
            pool,
            metrics,
            bindings: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }

    /// Accept loop. Runs until the listener fails; each connection gets its
    /// own task.
    pub async fn run(self: Arc<Self>) -> Result<(), BrokerError> {
        loop {
            let (stream, _) = self.listener.accept().await.map_err(BrokerError::Io)?;
            let broker = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = broker.handle_connection(stream).await {
                    tracing::warn!(error = %e, "connection handling failed");
                }
            });
        }
    }

    /// Handle of the binding currently serving queue `qid`, if any. This is
    /// how producers feed buffers into a queue.
    pub fn queue(&self, qid: u32) -> Option<QueueHandle> {
        self.bindings
            .lock()
            .get(&qid)
            .map(|inner| QueueHandle {
                inner: Arc::clone(inner),
            })
    }

    /// Base address of the broker's own pool mapping.
    pub fn pool_base(&self) -> *mut u8 {
        self.pool.as_mut_ptr()
    }

    /// Total pool size in bytes.
    pub fn pool_bytes(&self) -> usize {
        self.pool.len()
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> Result<(), BrokerError> {
        let mut frame = [0u8; REQUEST_LEN];
        stream
            .read_exact(&mut frame)
            .await
            .map_err(BrokerError::Io)?;
        let request = Request::from_bytes(&frame)?;

        match request.kind {
            RequestKind::Token => {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                stream
                    .write_all(&TokenResponse::new(token).to_bytes())
                    .await
                    .map_err(BrokerError::Io)?;
                tracing::debug!(token, "token issued");
                Ok(())
            }
            RequestKind::QueueBind => self.serve_binding(stream, request.qid).await,
        }
    }

    /// Establish a binding for `qid`, then hold the connection open until
    /// the client goes away; the binding dies with the connection.
    async fn serve_binding(&self, mut stream: UnixStream, qid: u32) -> Result<(), BrokerError> {
        let binding = {
            let mut bindings = self.bindings.lock();
            if bindings.contains_key(&qid) {
                // Closing without a response tells the client the bind was
                // rejected.
                return Err(BrokerError::QueueBusy(qid));
            }
            let binding = Arc::new(Mutex::new(
                Binding::create(qid, self.metrics).map_err(BrokerError::Io)?,
            ));
            bindings.insert(qid, Arc::clone(&binding));
            binding
        };

        let fifo_fds = binding.lock().fifo_fds();
        let mut fds = [0; BIND_FD_COUNT];
        fds[FD_POOL] = self.pool.fd();
        fds[FD_SERVER_FIFO] = fifo_fds[0];
        fds[FD_CLIENT_FIFO] = fifo_fds[1];

        if let Err(e) = handshake::send_bind_response(&stream, &self.metrics, fds).await {
            self.bindings.lock().remove(&qid);
            return Err(BrokerError::Io(e));
        }
        tracing::info!(qid, "queue binding established");

        // The protocol is one-shot: nothing further arrives on this socket.
        // A read returning anything (EOF or stray bytes followed by EOF) is
        // the teardown signal.
        let mut scratch = [0u8; 16];
        loop {
            match stream.read(&mut scratch).await {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(qid, error = %e, "binding socket error");
                    break;
                }
            }
        }

        self.bindings.lock().remove(&qid);
        tracing::info!(qid, "queue binding torn down");
        Ok(())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        std::fs::remove_file(&self.socket_path).ok();
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum BrokerError {
    Io(io::Error),
    Config(&'static str),
    QueueBusy(u32),
    Wire(WireError),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Io(e) => write!(f, "i/o failure: {e}"),
            BrokerError::Config(msg) => write!(f, "invalid configuration: {msg}"),
            BrokerError::QueueBusy(qid) => write!(f, "queue {qid} already bound"),
            BrokerError::Wire(e) => write!(f, "malformed request: {e}"),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BrokerError::Io(e) => Some(e),
            BrokerError::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WireError> for BrokerError {
    fn from(e: WireError) -> Self {
        BrokerError::Wire(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        BrokerConfig::default().validate().unwrap();
    }

    #[test]
    fn odd_client_fifo_is_valid_on_both_sides() {
        // A geometry the broker accepts must also survive the client's
        // descriptor validation, FIFO lengths with no alignment slack
        // included.
        let config = BrokerConfig {
            buffer_bytes: 2048,
            buffer_count: 3,
            server_fifo_size: 4,
            client_fifo_size: 3,
            huge_pool: false,
        };
        config.validate().unwrap();
        config.metrics().validate().unwrap();
    }

    #[test]
    fn config_rejects_undersized_client_fifo() {
        let config = BrokerConfig {
            buffer_bytes: 4096,
            buffer_count: 8,
            server_fifo_size: 8,
            client_fifo_size: 4,
            huge_pool: false,
        };
        assert!(matches!(
            config.validate(),
            Err(BrokerError::Config(_))
        ));
    }

    #[test]
    fn config_rejects_unaligned_huge_pool() {
        let config = BrokerConfig {
            buffer_bytes: 4096,
            buffer_count: 3,
            server_fifo_size: 4,
            client_fifo_size: 4,
            huge_pool: true,
        };
        assert!(matches!(config.validate(), Err(BrokerError::Config(_))));
    }

    #[test]
    fn config_rejects_zero_geometry() {
        let config = BrokerConfig {
            buffer_count: 0,
            huge_pool: false,
            ..BrokerConfig::default()
        };
        assert!(matches!(config.validate(), Err(BrokerError::Config(_))));
    }
}
