//! Buffer-identifier codec.
//!
//! A buffer handoff travels through either FIFO as a single 32-bit word:
//! bits 30..0 select a slot in the buffer pool and bit 31 carries the sentinel
//! flag. The sentinel is protocol metadata owned by the data plane (typically
//! "first buffer of a frame"); the broker preserves it losslessly across
//! handoff and otherwise ignores it.
//!
//! The all-ones word is reserved to mean "slot empty". It is the only
//! synchronization signal in the FIFOs, so no valid (index, sentinel) pair may
//! encode to it; [`MAX_INDEX`] stops one short of the index mask to keep the
//! combination (mask, sentinel=1) out of the valid range.

use core::fmt;

/// Sentinel flag bit.
const SENTINEL_BIT: u32 = 1 << 31;

/// Buffer index mask (bits 30..0).
const INDEX_MASK: u32 = SENTINEL_BIT - 1;

/// Largest encodable buffer index.
///
/// `(INDEX_MASK, sentinel = 1)` would collide with [`BufferId::EMPTY`], so the
/// valid index range ends one below the mask.
pub const MAX_INDEX: u32 = INDEX_MASK - 1;

/// Encoded (index, sentinel) word referencing a pool slot.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BufferId(u32);

impl BufferId {
    /// Reserved "no buffer" word. Never equals any valid encoding.
    pub const EMPTY: BufferId = BufferId(u32::MAX);

    /// Encode a pool index and sentinel flag.
    #[inline]
    pub fn encode(index: u32, sentinel: bool) -> Self {
        debug_assert!(index <= MAX_INDEX, "buffer index must fit in 31 bits");
        BufferId((index & INDEX_MASK) | if sentinel { SENTINEL_BIT } else { 0 })
    }

    /// Reinterpret a raw FIFO word.
    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        BufferId(raw)
    }

    /// The raw 32-bit wire encoding.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// True for the reserved empty word.
    #[inline]
    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }

    /// Pool slot index. Total: bounds checking is the pool consumer's concern.
    #[inline]
    pub fn index(self) -> u32 {
        self.0 & INDEX_MASK
    }

    /// Sentinel flag.
    #[inline]
    pub fn sentinel(self) -> bool {
        self.0 & SENTINEL_BIT != 0
    }

    /// Decode into a (index, sentinel) pair. Never fails.
    #[inline]
    pub fn decode(self) -> BufferRef {
        BufferRef {
            index: self.index(),
            sentinel: self.sentinel(),
        }
    }
}

impl fmt::Debug for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "BufferId::EMPTY")
        } else {
            write!(
                f,
                "BufferId {{ index: {}, sentinel: {} }}",
                self.index(),
                self.sentinel()
            )
        }
    }
}

/// A decoded buffer handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRef {
    /// Slot index into the buffer pool.
    pub index: u32,
    /// Frame-boundary marker, meaning defined by the data plane.
    pub sentinel: bool,
}

impl BufferRef {
    /// Encode back into the wire word.
    #[inline]
    pub fn encode(self) -> BufferId {
        BufferId::encode(self.index, self.sentinel)
    }
}
