//! Heap error types.

use std::error::Error;
use std::fmt;

/// Errors reported by the heap's fallible entry points.
///
/// The `Option` returning API collapses every variant into `None`, the same
/// way the C allocation functions collapse them into a null pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapError {
    /// A request for zero bytes. No block is handed out for it.
    ZeroSize,
    /// `count * size` does not fit in a `usize`.
    SizeOverflow,
    /// The memory source refused to extend the arena.
    OutOfMemory {
        /// Number of payload bytes that could not be provided.
        requested: usize,
    },
    /// A [`crate::HeapConfig`] value that the heap cannot work with.
    InvalidConfig {
        /// Which constraint was violated.
        reason: &'static str,
    },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSize => write!(f, "zero sized allocation request"),
            Self::SizeOverflow => write!(f, "allocation size overflows usize"),
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory: could not provide {requested} bytes")
            }
            Self::InvalidConfig { reason } => write!(f, "invalid heap configuration: {reason}"),
        }
    }
}

impl Error for HeapError {}

/// A broken structural invariant found by [`crate::Heap::check_invariants`].
///
/// Offsets are relative to the beginning of the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvariantViolation {
    /// A block size that is not a multiple of the alignment unit.
    Misaligned {
        /// Offset of the block header.
        offset: usize,
        /// The offending size.
        size: usize,
    },
    /// Two free blocks next to each other.
    AdjacentFree {
        /// Offset of the second free block.
        offset: usize,
    },
    /// A block whose back reference does not name the block before it.
    BrokenBackLink {
        /// Offset of the block header.
        offset: usize,
        /// Offset of the actual previous block.
        expected: Option<usize>,
        /// Offset stored in the header.
        found: Option<usize>,
    },
    /// The chain runs past the end of the arena instead of reaching it exactly.
    Overrun {
        /// Offset of the block that crosses the end.
        offset: usize,
        /// Where the block claims to end.
        block_end: usize,
        /// Length of the arena.
        arena_len: usize,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Misaligned { offset, size } => {
                write!(f, "block at {offset:#x} has unaligned size {size}")
            }
            Self::AdjacentFree { offset } => {
                write!(f, "free block at {offset:#x} follows another free block")
            }
            Self::BrokenBackLink {
                offset,
                expected,
                found,
            } => write!(
                f,
                "block at {offset:#x} links back to {found:?}, expected {expected:?}"
            ),
            Self::Overrun {
                offset,
                block_end,
                arena_len,
            } => write!(
                f,
                "block at {offset:#x} ends at {block_end:#x}, arena ends at {arena_len:#x}"
            ),
        }
    }
}

impl Error for InvariantViolation {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            HeapError::OutOfMemory { requested: 64 }.to_string(),
            "out of memory: could not provide 64 bytes"
        );
        assert_eq!(
            InvariantViolation::AdjacentFree { offset: 0x40 }.to_string(),
            "free block at 0x40 follows another free block"
        );
    }
}
