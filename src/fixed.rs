use std::{marker::PhantomData, ptr::NonNull};

use crate::kernel::MemorySource;

/// Alignment of the first byte a [`FixedBuffer`] hands out.
pub const FIXED_BUFFER_ALIGN: usize = 64;

/// A [`MemorySource`] over a caller provided byte slice.
///
/// Extensions are carved from the front of the slice until it runs out, at
/// which point the heap sees an out of memory condition. Useful when there is
/// no operating system to ask for memory, and for tests that need growth to
/// fail at a known point.
///
/// The first byte handed out is aligned to [`FIXED_BUFFER_ALIGN`]; the bytes
/// skipped to get there are lost. A heap with a wider alignment skips a few
/// more bytes at the front of its arena.
#[derive(Debug)]
pub struct FixedBuffer<'a> {
    start: NonNull<u8>,
    capacity: usize,
    len: usize,
    marker: PhantomData<&'a mut [u8]>,
}

// The buffer is a unique borrow of the slice.
unsafe impl Send for FixedBuffer<'_> {}

impl<'a> FixedBuffer<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        let skip = buffer.as_ptr().align_offset(FIXED_BUFFER_ALIGN);
        let capacity = buffer.len().saturating_sub(skip);
        let skip = skip.min(buffer.len());

        // SAFETY: `skip` is at most the slice length, so this is in bounds or
        // one past the end; slices never start at null.
        let start = unsafe { NonNull::new_unchecked(buffer.as_mut_ptr().add(skip)) };

        Self {
            start,
            capacity,
            len: 0,
            marker: PhantomData,
        }
    }

    /// Bytes that can be handed out in total.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes handed out so far.
    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

unsafe impl MemorySource for FixedBuffer<'_> {
    fn extend(&mut self, additional: usize) -> Option<NonNull<u8>> {
        let new_len = self.len.checked_add(additional)?;
        if new_len > self.capacity {
            return None;
        }

        let addr = unsafe { self.start.add(self.len) };
        self.len = new_len;

        Some(addr)
    }

    unsafe fn retract(&mut self, len: usize) {
        self.len = self.len.saturating_sub(len);
    }

    unsafe fn reset(&mut self) {
        self.len = 0;
    }
}
