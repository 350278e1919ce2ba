//! FIFO cursor arithmetic.
//!
//! Each binding carries two single-producer single-consumer circular arrays of
//! buffer-id words: the server FIFO (broker writes, client reads) and the
//! client FIFO (client writes, broker reads). There is no shared head/tail
//! pair and no cross-process atomics beyond plain acquire/release slot
//! accesses: the reserved empty word is the only synchronization signal. Each
//! side keeps its own private cursor and advances it by exactly one slot per
//! successful operation, wrapping at the FIFO length.

/// Size in bytes of one FIFO slot (a raw [`crate::BufferId`] word).
pub const SLOT_BYTES: usize = core::mem::size_of::<u32>();

/// Advance a FIFO cursor by one slot, wrapping at `len`.
#[inline]
pub fn next_slot(index: u32, len: u64) -> u32 {
    if (index as u64) + 1 >= len { 0 } else { index + 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_by_one() {
        assert_eq!(next_slot(0, 4), 1);
        assert_eq!(next_slot(1, 4), 2);
        assert_eq!(next_slot(2, 4), 3);
    }

    #[test]
    fn wraps_at_length() {
        assert_eq!(next_slot(3, 4), 0);
        assert_eq!(next_slot(0, 1), 0);
    }
}
