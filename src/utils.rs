//! This file contains all the helper functions for the allocator.
//! This are functions that don't particularly belong to any concrete module of the program.

/// It aligns `to_be_aligned` using `alignment`.
///
/// This method is used to align block sizes to be a multiple of the heap's alignment
/// unit and committed lengths to be a multiple of the computer's page size.
/// `alignment` has to be a power of two.
pub const fn align(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Same as [`align`] but returns `None` instead of wrapping around when
/// `to_be_aligned` is too close to `usize::MAX`.
pub const fn checked_align(to_be_aligned: usize, alignment: usize) -> Option<usize> {
    match to_be_aligned.checked_add(alignment - 1) {
        Some(value) => Some(value & !(alignment - 1)),
        None => None,
    }
}

/// Tells whether `value` is a multiple of `alignment`.
#[inline]
pub const fn is_aligned(value: usize, alignment: usize) -> bool {
    value & (alignment - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_pointer_size() {
        let aligments = vec![(1..8, 8), (9..16, 16), (17..24, 24), (25..32, 32)];

        for (sizes, expected) in aligments {
            for size in sizes {
                assert_eq!(expected, align(size, 8));
            }
        }
    }

    #[test]
    fn align_page_size() {
        // For testing purposes we are assuming the page size is 4096
        let aligments = vec![(1..4096, 4096), (4097..8192, 8192)];

        for (sizes, expected) in aligments {
            for size in sizes {
                assert_eq!(expected, align(size, 4096))
            }
        }
    }

    #[test]
    fn checked_align_detects_overflow() {
        assert_eq!(checked_align(13, 8), Some(16));
        assert_eq!(checked_align(16, 8), Some(16));
        assert_eq!(checked_align(usize::MAX - 3, 8), None);
    }

    #[test]
    fn aligned_values() {
        assert!(is_aligned(0, 8));
        assert!(is_aligned(64, 16));
        assert!(!is_aligned(24, 16));
    }
}
