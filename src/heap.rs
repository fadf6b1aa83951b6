use std::{cmp, ptr::{self, NonNull}};

use crate::{
    arena::Arena,
    block::{BlockRef, MAX_BLOCK_SIZE},
    config::HeapConfig,
    dump::HeapDump,
    error::{HeapError, InvariantViolation},
    freelist::FreeList,
    kernel::{MemorySource, VirtualRegion},
    stats::{self, BlockInfo, HeapStats},
    utils::{checked_align, is_aligned},
};

/// A first-fit heap over a single growable arena.
///
/// Every allocation is a block inside the arena: a small header followed by
/// the payload whose address is returned to the caller. Free blocks are found
/// by walking the chain of blocks in address order, split to size when they
/// are too big, and merged with their free neighbours as soon as they are
/// released, so two free blocks are never next to each other.
///
/// The heap is single threaded: every operation takes `&mut self`. Wrap it in
/// a [`crate::LockedHeap`] to share it between threads or to install it as
/// the global allocator.
///
/// ```
/// use brkheap::Heap;
///
/// let mut heap = Heap::new();
///
/// let ptr = heap.allocate(20).unwrap();
/// unsafe {
///     ptr.as_ptr().write_bytes(7, 20);
///     let ptr = heap.reallocate(ptr.as_ptr(), 400).unwrap();
///     assert_eq!(*ptr.as_ptr().add(19), 7);
///     heap.release(ptr.as_ptr());
/// }
/// ```
pub struct Heap<S = VirtualRegion> {
    arena: Arena<S>,
}

impl Heap<VirtualRegion> {
    /// A heap with the default configuration, backed by a [`VirtualRegion`].
    ///
    /// No memory is claimed until the first allocation.
    pub const fn new() -> Self {
        Self::with_source(VirtualRegion::new())
    }
}

impl Default for Heap<VirtualRegion> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Heap<S> {
    /// A heap with the default configuration over `source`.
    pub const fn with_source(source: S) -> Self {
        Self::from_parts(source, HeapConfig::DEFAULT)
    }

    /// A heap over `source` with a custom configuration.
    pub fn with_config(source: S, config: HeapConfig) -> Result<Self, HeapError> {
        config.validate()?;
        Ok(Self::from_parts(source, config))
    }

    /// Builds a heap from a configuration that was already validated.
    pub(crate) const fn from_parts(source: S, config: HeapConfig) -> Self {
        Self {
            arena: Arena::new(source, config),
        }
    }

    pub const fn config(&self) -> &HeapConfig {
        self.arena.config()
    }

    pub fn source(&self) -> &S {
        self.arena.source()
    }

    /// First byte of the arena, null before the first allocation.
    pub fn begin(&self) -> *mut u8 {
        self.arena.begin()
    }

    /// One past the last byte of the arena, null before the first allocation.
    pub fn end(&self) -> *mut u8 {
        self.arena.end()
    }

    /// Size of the arena in bytes, headers included.
    pub const fn total_size(&self) -> usize {
        self.arena.len()
    }

    /// Tells whether `ptr` looks like a pointer handed out by this heap: it
    /// lies inside the arena where a payload may start. This does not say
    /// whether the block is currently allocated.
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.arena.owns(ptr)
    }

    /// Payload size of the allocation `ptr` points to. This can be more than
    /// what was requested.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this heap.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let block = self.arena.block_of(ptr);
        self.arena.header(block).size()
    }

    /// Snapshot of every block in address order.
    ///
    /// The iterator reads the headers in place and never allocates.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.arena.blocks().map(|block| {
            let header = self.arena.header(block);

            BlockInfo {
                offset: block.offset(),
                address: self.arena.address(block),
                previous: header.previous().map(|previous| self.arena.address(previous)),
                size: header.size(),
                in_use: header.in_use(),
            }
        })
    }

    /// Totals over the whole arena.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            begin: self.begin() as usize,
            end: self.end() as usize,
            total_size: self.total_size(),
            header_size: self.arena.header_size(),
            ..HeapStats::default()
        };

        for block in self.blocks() {
            stats.blocks += 1;

            if block.in_use {
                stats.used_blocks += 1;
                stats.used_bytes += block.size;
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += block.size;
                stats.largest_free = cmp::max(stats.largest_free, block.size);
            }
        }

        stats.fragmentation = self.fragmentation();
        stats
    }

    /// How scattered the free memory is, see [`stats::fragmentation_score`].
    pub fn fragmentation(&self) -> f64 {
        let free = FreeList::new(&self.arena);
        stats::fragmentation_score(free.iter().map(|block| self.arena.header(block).size()))
    }

    /// Printable report of the heap, see [`HeapDump`].
    pub fn dump(&self) -> HeapDump<'_, S> {
        HeapDump::new(self)
    }

    /// Walks the whole chain and checks its structure: sizes aligned, back
    /// references correct, no two free blocks together, and the last block
    /// ending exactly at the end of the arena.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let alignment = self.arena.config().alignment;
        let len = self.arena.len();

        let mut previous: Option<(BlockRef, bool)> = None;
        let mut offset = 0;

        while offset < len {
            let block = BlockRef::at(offset);

            if offset + self.arena.header_size() > len {
                return Err(InvariantViolation::Overrun {
                    offset,
                    block_end: offset + self.arena.header_size(),
                    arena_len: len,
                });
            }

            let header = self.arena.header(block);

            if !is_aligned(header.size(), alignment) {
                return Err(InvariantViolation::Misaligned {
                    offset,
                    size: header.size(),
                });
            }

            let expected = previous.map(|(previous, _)| previous);
            if header.previous() != expected {
                return Err(InvariantViolation::BrokenBackLink {
                    offset,
                    expected: expected.map(BlockRef::offset),
                    found: header.previous().map(BlockRef::offset),
                });
            }

            if header.is_free() && matches!(previous, Some((_, false))) {
                return Err(InvariantViolation::AdjacentFree { offset });
            }

            let block_end = self.arena.block_end(block);
            if block_end > len {
                return Err(InvariantViolation::Overrun {
                    offset,
                    block_end,
                    arena_len: len,
                });
            }

            previous = Some((block, header.in_use()));
            offset = block_end;
        }

        Ok(())
    }

    /// Rounds a request up to the alignment unit.
    fn align_request(&self, size: usize) -> Result<usize, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }

        checked_align(size, self.arena.config().alignment)
            .filter(|aligned| *aligned <= MAX_BLOCK_SIZE)
            .ok_or(HeapError::OutOfMemory { requested: size })
    }

    /// Marks `block` free and merges it with its free neighbours.
    fn free_block(&mut self, block: BlockRef) {
        self.arena.update(block, |header| header.set_in_use(false));

        // Join following block.
        self.arena.join_with_next(block);

        // Join previous block.
        let merged = self.arena.join_with_previous(block);

        log_trace!(
            "released block {:#x}, free block {:#x} now holds {} bytes",
            block.offset(),
            merged.offset(),
            self.arena.header(merged).size()
        );
    }

    /// Tries to resize the in-use `block` to `size` bytes without moving it.
    ///
    /// The block first absorbs its free follower, if any. If the request fits
    /// the block is trimmed to it; otherwise the absorbed space is split off
    /// again, leaving the chain exactly as it was, and `false` is returned.
    fn resize_block(&mut self, block: BlockRef, size: usize) -> Result<bool, HeapError> {
        let aligned = self.align_request(size)?;
        let old_size = self.arena.header(block).size();

        if aligned == old_size {
            return Ok(true);
        }

        // Growing needs the space, shrinking gets room for the header of the rest.
        let joined = self.arena.join_with_next(block);

        if aligned <= joined {
            self.arena.shrink_block(block, aligned);

            log_trace!("resized block {:#x} in place: {} -> {}", block.offset(), old_size, aligned);

            return Ok(true);
        }

        // Shrink block to original size.
        self.arena.shrink_block(block, old_size);

        Ok(false)
    }
}

impl<S: MemorySource> Heap<S> {
    /// First free block that fits `size` (aligned), growing the arena once if
    /// there is none.
    fn find_block(&mut self, size: usize) -> Result<BlockRef, HeapError> {
        if let Some(block) = FreeList::new(&self.arena).find_free_block(size) {
            return Ok(block);
        }

        self.arena.grow(size)?;

        // Growth always leaves a free block big enough at the end, so one
        // retry is all it takes.
        FreeList::new(&self.arena)
            .find_free_block(size)
            .ok_or(HeapError::OutOfMemory { requested: size })
    }

    /// Finds a block for `size` bytes, trims it to size and marks it in use.
    fn get_block(&mut self, size: usize) -> Result<BlockRef, HeapError> {
        let aligned = self.align_request(size)?;
        let block = self.find_block(aligned)?;

        self.arena.shrink_block(block, aligned);
        self.arena.update(block, |header| header.set_in_use(true));

        log_trace!("allocated block {:#x} for {} bytes", block.offset(), size);

        Ok(block)
    }

    /// Allocates at least `size` bytes aligned to [`HeapConfig::alignment`].
    ///
    /// Zero sized requests are rejected with [`HeapError::ZeroSize`].
    pub fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let block = self.get_block(size)?;
        Ok(self.arena.payload(block))
    }

    /// Allocates at least `size` bytes, or returns `None` when `size` is zero
    /// or the memory source is exhausted.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.try_allocate(size).ok()
    }

    /// Allocates `count * size` bytes, all set to zero.
    ///
    /// Fails with [`HeapError::SizeOverflow`] if the product does not fit in
    /// a `usize`.
    pub fn try_zero_allocate(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        let total = count.checked_mul(size).ok_or(HeapError::SizeOverflow)?;
        let block = self.get_block(total)?;

        let payload = self.arena.payload(block);
        let len = self.arena.header(block).size();

        // SAFETY: the whole payload of a block belongs to the arena.
        unsafe { payload.as_ptr().write_bytes(0, len) };

        Ok(payload)
    }

    /// `calloc`: like [`Heap::try_zero_allocate`] with the error dropped.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        self.try_zero_allocate(count, size).ok()
    }

    /// Changes the size of the allocation at `ptr` to `size` bytes.
    ///
    /// - A null `ptr` allocates `size` bytes.
    /// - A `size` of zero releases `ptr` and returns `Ok(None)`.
    /// - Otherwise the block is resized in place when its free neighbour
    ///   allows it, or moved to a new block with its first
    ///   `min(old size, size)` bytes copied over.
    ///
    /// When no new block can be found the error is returned and `ptr` stays
    /// allocated with its contents untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this heap. On success the
    /// old pointer must not be used anymore unless it was returned again.
    pub unsafe fn try_reallocate(
        &mut self,
        ptr: *mut u8,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return self.try_allocate(size).map(Some);
        };

        if size == 0 {
            unsafe { self.release(ptr.as_ptr()) };
            return Ok(None);
        }

        let block = self.checked_block_of(ptr);
        let old_size = self.arena.header(block).size();

        // Try to resize the block.
        if self.resize_block(block, size)? {
            return Ok(Some(ptr));
        }

        // Find new block. If this fails the old one was not touched.
        let new_block = self.get_block(size)?;
        let new_ptr = self.arena.payload(new_block);

        // SAFETY: both payloads are in the arena and different blocks never overlap.
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), cmp::min(old_size, size));
        }

        self.free_block(block);

        log_trace!(
            "moved block {:#x} to {:#x} ({} -> {} bytes)",
            block.offset(),
            new_block.offset(),
            old_size,
            size
        );

        Ok(Some(new_ptr))
    }

    /// `realloc`: like [`Heap::try_reallocate`] but `None` covers both the
    /// released and the failed case.
    ///
    /// # Safety
    ///
    /// See [`Heap::try_reallocate`].
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
        unsafe { self.try_reallocate(ptr, size).ok().flatten() }
    }

    /// Gives the allocation at `ptr` back to the heap. A null `ptr` is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this heap. Releasing the
    /// same pointer twice is undefined behaviour.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        let block = self.checked_block_of(ptr);
        self.free_block(block);
    }

    /// Forgets every block and gives the arena back to the memory source. The
    /// next allocation starts a new arena.
    ///
    /// Every pointer handed out before becomes dangling.
    pub fn reset(&mut self) {
        log_debug!("resetting heap of {} bytes", self.total_size());
        self.arena.reset();
    }

    /// Block of a caller pointer. Debug builds check that the pointer is
    /// plausible and currently allocated.
    fn checked_block_of(&self, ptr: NonNull<u8>) -> BlockRef {
        debug_assert!(self.owns(ptr.as_ptr()), "{ptr:p} was not allocated by this heap");

        let block = self.arena.block_of(ptr);
        debug_assert!(self.arena.header(block).in_use(), "{ptr:p} is not allocated");

        block
    }
}
