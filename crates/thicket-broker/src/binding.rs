//! Per-queue binding state: the two FIFO segments and the broker-side
//! cursors.
//!
//! One binding serves exactly one client connection. The broker is the single
//! writer of the server FIFO and the single consumer of the client FIFO, so
//! within a binding all FIFO traffic is SPSC; the `parking_lot` mutex around
//! a binding only serializes the broker's own callers (the accept path and
//! whatever producer feeds `try_enqueue`).
//!
//! Slot discipline: an occupied slot holds a valid buffer id, an empty slot
//! holds the EMPTY sentinel. The broker may reuse server slot `j` only after
//! the buffer enqueued there has come back through the client FIFO. That is
//! enforced by the enqueue gate (`enqueued - returned < server_fifo_size`)
//! together with clearing server slot `returned % n` right before `returned`
//! is incremented: slot `j` becomes writable for enqueue `j + n` only once
//! `returned >= j + 1`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use thicket_primitives::{BufferId, BufferRef, ClientState, SLOT_BYTES, SharedMetrics, next_slot};

use crate::shm::Segment;

pub(crate) struct Binding {
    qid: u32,
    server_fifo: Segment,
    client_region: Segment,
    metrics: SharedMetrics,
    /// Buffers handed to the client so far.
    enqueued: u64,
    /// Buffers the client has returned so far.
    returned: u64,
    /// Read cursor into the client FIFO.
    client_read: u32,
}

impl Binding {
    /// Allocate the two segments for queue `qid` and seed them: every FIFO
    /// slot set to EMPTY, the state block holding zeroed cursors and a copy
    /// of `metrics`.
    pub(crate) fn create(qid: u32, metrics: SharedMetrics) -> std::io::Result<Self> {
        let server_fifo = Segment::create(
            &format!("thicket-q{qid}-server-fifo"),
            metrics.server_fifo_bytes(),
            false,
        )?;
        let client_region = Segment::create(
            &format!("thicket-q{qid}-client-region"),
            metrics.client_region_bytes(),
            false,
        )?;

        let binding = Self {
            qid,
            server_fifo,
            client_region,
            metrics,
            enqueued: 0,
            returned: 0,
            client_read: 0,
        };

        for slot in 0..metrics.server_fifo_size as u32 {
            binding.server_slot(slot).store(BufferId::EMPTY.raw(), Ordering::Relaxed);
        }
        for slot in 0..metrics.client_fifo_size as u32 {
            binding.client_slot(slot).store(BufferId::EMPTY.raw(), Ordering::Relaxed);
        }
        // SAFETY: create() sized the region to hold the state block at
        // state_offset, and nothing else references it yet.
        unsafe {
            let state = binding
                .client_region
                .as_mut_ptr()
                .add(metrics.state_offset as usize)
                .cast::<ClientState>();
            state.write(ClientState {
                server_fifo_index: 0,
                client_fifo_index: 0,
                metrics,
            });
        }

        Ok(binding)
    }

    /// The three descriptors to transfer, minus the pool (which the broker
    /// owns globally): callers splice in the pool fd at position 0.
    pub(crate) fn fifo_fds(&self) -> [std::os::fd::RawFd; 2] {
        [self.server_fifo.fd(), self.client_region.fd()]
    }

    /// Hand `buffer` to the client. Returns false when the FIFO is at
    /// capacity, i.e. `server_fifo_size` buffers are outstanding.
    pub(crate) fn try_enqueue(&mut self, buffer: BufferRef) -> bool {
        if self.enqueued - self.returned >= self.metrics.server_fifo_size {
            return false;
        }
        let slot = (self.enqueued % self.metrics.server_fifo_size) as u32;
        self.server_slot(slot)
            .store(buffer.encode().raw(), Ordering::Release);
        self.enqueued += 1;
        true
    }

    /// Consume one returned buffer from the client FIFO, if any.
    ///
    /// Consuming also retires the oldest outstanding handoff: the consumed
    /// client slot goes back to EMPTY (the client only ever writes valid ids
    /// there), and server slot `returned % n` goes back to EMPTY before
    /// `returned` advances, opening it for reuse.
    pub(crate) fn poll_released(&mut self) -> Option<BufferId> {
        let slot = self.client_read;
        let id = BufferId::from_raw(self.client_slot(slot).load(Ordering::Acquire));
        if id.is_empty() {
            return None;
        }
        if id.index() as u64 >= self.metrics.buffer_count {
            tracing::warn!(
                qid = self.qid,
                raw = id.raw(),
                "client returned an out-of-range buffer id"
            );
        }
        self.client_slot(slot)
            .store(BufferId::EMPTY.raw(), Ordering::Release);
        self.client_read = next_slot(slot, self.metrics.client_fifo_size);

        let server_slot = (self.returned % self.metrics.server_fifo_size) as u32;
        self.server_slot(server_slot)
            .store(BufferId::EMPTY.raw(), Ordering::Release);
        self.returned += 1;
        Some(id)
    }

    /// Buffers currently held by the client.
    pub(crate) fn outstanding(&self) -> u64 {
        self.enqueued - self.returned
    }

    fn server_slot(&self, index: u32) -> &AtomicU32 {
        debug_assert!((index as u64) < self.metrics.server_fifo_size);
        // SAFETY: index is within the FIFO and slots are u32-aligned in a
        // page-aligned mapping.
        unsafe {
            &*self
                .server_fifo
                .as_mut_ptr()
                .add(index as usize * SLOT_BYTES)
                .cast::<AtomicU32>()
        }
    }

    fn client_slot(&self, index: u32) -> &AtomicU32 {
        debug_assert!((index as u64) < self.metrics.client_fifo_size);
        // SAFETY: same as server_slot; the client FIFO sits at offset 0 of
        // the client region.
        unsafe {
            &*self
                .client_region
                .as_mut_ptr()
                .add(index as usize * SLOT_BYTES)
                .cast::<AtomicU32>()
        }
    }
}

/// Shared handle to a binding, for producers feeding buffers into a queue
/// and reclaiming returns. The lock is per-queue; different queues never
/// contend.
#[derive(Clone)]
pub struct QueueHandle {
    pub(crate) inner: Arc<Mutex<Binding>>,
}

impl QueueHandle {
    /// Hand a buffer to the queue's client. False when the queue is at
    /// capacity.
    pub fn try_enqueue(&self, buffer: BufferRef) -> bool {
        self.inner.lock().try_enqueue(buffer)
    }

    /// Reclaim one returned buffer, if the client has released any.
    pub fn poll_released(&self) -> Option<BufferId> {
        self.inner.lock().poll_released()
    }

    /// Buffers currently held by the client.
    pub fn outstanding(&self) -> u64 {
        self.inner.lock().outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> SharedMetrics {
        SharedMetrics::new(2048, 4, 4, 4, 0)
    }

    #[test]
    fn state_block_seeded() {
        let m = metrics();
        let b = Binding::create(7, m).unwrap();
        let state = unsafe {
            &*b.client_region
                .as_mut_ptr()
                .add(m.state_offset as usize)
                .cast::<ClientState>()
        };
        assert_eq!(state.server_fifo_index, 0);
        assert_eq!(state.client_fifo_index, 0);
        assert_eq!(state.metrics, m);
        // Both FIFOs start fully empty.
        for i in 0..4 {
            assert!(BufferId::from_raw(b.server_slot(i).load(Ordering::Relaxed)).is_empty());
            assert!(BufferId::from_raw(b.client_slot(i).load(Ordering::Relaxed)).is_empty());
        }
    }

    #[test]
    fn enqueue_gate_holds_at_capacity() {
        let mut b = Binding::create(0, metrics()).unwrap();
        for i in 0..4 {
            assert!(b.try_enqueue(BufferRef {
                index: i,
                sentinel: false
            }));
        }
        assert!(!b.try_enqueue(BufferRef {
            index: 0,
            sentinel: false
        }));
        assert_eq!(b.outstanding(), 4);
    }

    #[test]
    fn consuming_a_return_reopens_the_oldest_slot() {
        let mut b = Binding::create(0, metrics()).unwrap();
        for i in 0..4 {
            b.try_enqueue(BufferRef {
                index: i,
                sentinel: false,
            });
        }
        // Simulate the client returning buffer 2 at client slot 0.
        b.client_slot(0).store(
            BufferRef {
                index: 2,
                sentinel: false,
            }
            .encode()
            .raw(),
            Ordering::Release,
        );
        let id = b.poll_released().unwrap();
        assert_eq!(id.decode().index, 2);
        // Server slot 0 (the oldest handoff) is cleared, client slot 0 too.
        assert!(BufferId::from_raw(b.server_slot(0).load(Ordering::Relaxed)).is_empty());
        assert!(BufferId::from_raw(b.client_slot(0).load(Ordering::Relaxed)).is_empty());
        // Room for one more handoff now; recycle the returned buffer.
        assert!(b.try_enqueue(BufferRef {
            index: 2,
            sentinel: false
        }));
        assert!(b.poll_released().is_none());
    }
}
