//! Heap configuration parameters.

use std::mem;

use crate::{block::Header, error::HeapError, utils::{align, is_aligned}};

/// Configuration for a [`crate::Heap`].
///
/// All values are fixed once the heap is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    /// Bytes claimed from the memory source on the first allocation.
    ///
    /// Must be a multiple of [`HeapConfig::alignment`] and leave room for at
    /// least one header and one alignment unit of payload.
    pub initial_size: usize,

    /// Multiplier applied to the total arena size on every growth event.
    ///
    /// A factor of 1 grows the arena by exactly what the failing request needs.
    pub growth_factor: usize,

    /// Alignment unit of every block size and every returned pointer.
    ///
    /// Must be a power of two and at least the machine pointer width.
    pub alignment: usize,
}

impl HeapConfig {
    /// Default initial size: 1 MiB.
    pub const DEFAULT_INITIAL_SIZE: usize = 1024 * 1024;

    /// Default growth factor: the arena doubles on each growth event.
    pub const DEFAULT_GROWTH_FACTOR: usize = 2;

    /// Default alignment: the machine pointer width.
    pub const DEFAULT_ALIGNMENT: usize = mem::size_of::<usize>();

    /// The default configuration.
    pub const DEFAULT: Self = Self {
        initial_size: Self::DEFAULT_INITIAL_SIZE,
        growth_factor: Self::DEFAULT_GROWTH_FACTOR,
        alignment: Self::DEFAULT_ALIGNMENT,
    };

    pub const fn with_initial_size(mut self, initial_size: usize) -> Self {
        self.initial_size = initial_size;
        self
    }

    pub const fn with_growth_factor(mut self, growth_factor: usize) -> Self {
        self.growth_factor = growth_factor;
        self
    }

    pub const fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Bytes taken by a block header, padded so payloads stay aligned.
    #[inline]
    pub const fn header_size(&self) -> usize {
        align(mem::size_of::<Header>(), self.alignment)
    }

    /// Checks every constraint documented on the fields.
    pub const fn validate(&self) -> Result<(), HeapError> {
        if !self.alignment.is_power_of_two() {
            return Err(HeapError::InvalidConfig {
                reason: "alignment must be a power of two",
            });
        }
        if self.alignment < mem::size_of::<usize>() {
            return Err(HeapError::InvalidConfig {
                reason: "alignment must be at least the pointer width",
            });
        }
        if self.growth_factor == 0 {
            return Err(HeapError::InvalidConfig {
                reason: "growth factor must be at least 1",
            });
        }
        if !is_aligned(self.initial_size, self.alignment) {
            return Err(HeapError::InvalidConfig {
                reason: "initial size must be a multiple of the alignment",
            });
        }
        if self.initial_size < self.header_size() + self.alignment {
            return Err(HeapError::InvalidConfig {
                reason: "initial size cannot hold a single block",
            });
        }
        Ok(())
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
