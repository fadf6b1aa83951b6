use std::{cmp, ptr::NonNull};

use crate::{
    block::{BlockRef, Header},
    config::HeapConfig,
    error::HeapError,
    kernel::MemorySource,
    utils::{align, checked_align, is_aligned},
};

/// The contiguous memory region managed by the heap.
///
/// Every byte between `begin` and `end` belongs to exactly one block, either
/// to its header or to its payload:
///
/// ```text
///  begin                                                               end
///    |                                                                   |
///    +--------+---------+--------+------------------+--------+-----------+
///    | Header | Payload | Header |     Payload      | Header |  Payload  |
///    +--------+---------+--------+------------------+--------+-----------+
///    ^ BlockRef(0)      ^ BlockRef(h + s0)          ^ ...
/// ```
///
/// Blocks are addressed by their offset from `begin`, see [`BlockRef`]. The
/// region starts empty (`begin` is null) and is claimed from the
/// [`MemorySource`] on the first growth.
pub(crate) struct Arena<S> {
    /// Where the memory comes from.
    source: S,
    /// First byte of the arena. `None` until the first growth.
    base: Option<NonNull<u8>>,
    /// Total size of the arena in bytes.
    len: usize,
    config: HeapConfig,
}

// The arena exclusively owns the memory `base` points into.
unsafe impl<S: Send> Send for Arena<S> {}

impl<S> Arena<S> {
    pub const fn new(source: S, config: HeapConfig) -> Self {
        Self {
            source,
            base: None,
            len: 0,
            config,
        }
    }

    #[inline]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    #[inline]
    pub const fn header_size(&self) -> usize {
        self.config.header_size()
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First byte of the arena or null if nothing was claimed yet.
    #[inline]
    pub fn begin(&self) -> *mut u8 {
        self.base.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    /// One past the last byte of the arena or null if nothing was claimed yet.
    #[inline]
    pub fn end(&self) -> *mut u8 {
        self.begin().wrapping_add(self.len)
    }

    #[inline]
    pub fn source(&self) -> &S {
        &self.source
    }

    #[inline]
    fn header_ptr(&self, block: BlockRef) -> *mut Header {
        debug_assert!(block.offset() + self.header_size() <= self.len);
        self.begin().wrapping_add(block.offset()).cast()
    }

    /// Reads the header of `block`.
    #[inline]
    pub fn header(&self, block: BlockRef) -> Header {
        // SAFETY: every `BlockRef` the heap creates points at a header inside
        // the arena, and header offsets are multiples of the alignment.
        unsafe { self.header_ptr(block).read() }
    }

    #[inline]
    pub fn write_header(&mut self, block: BlockRef, header: Header) {
        unsafe { self.header_ptr(block).write(header) }
    }

    /// Applies `f` to the header of `block` in place.
    #[inline]
    pub fn update(&mut self, block: BlockRef, f: impl FnOnce(&mut Header)) {
        let mut header = self.header(block);
        f(&mut header);
        self.write_header(block, header);
    }

    /// Address of the header of `block`.
    #[inline]
    pub fn address(&self, block: BlockRef) -> usize {
        self.begin() as usize + block.offset()
    }

    /// Pointer to the payload of `block`, the one given to callers.
    #[inline]
    pub fn payload(&self, block: BlockRef) -> NonNull<u8> {
        let ptr = self.begin().wrapping_add(block.offset() + self.header_size());
        // SAFETY: the arena is not empty when a block exists, so `begin` is not null.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Inverse of [`Arena::payload`]: the block a caller pointer belongs to.
    #[inline]
    pub fn block_of(&self, ptr: NonNull<u8>) -> BlockRef {
        BlockRef::at(ptr.as_ptr() as usize - self.begin() as usize - self.header_size())
    }

    /// Cheap sanity check for caller pointers: inside the arena and at a
    /// position where a payload could start.
    pub fn owns(&self, ptr: *const u8) -> bool {
        let Some(base) = self.base else {
            return false;
        };

        let start = base.as_ptr() as usize + self.header_size();
        let addr = ptr as usize;

        addr >= start
            && addr < base.as_ptr() as usize + self.len
            && is_aligned(addr - start, self.config.alignment)
    }

    /// Offset right after the payload of `block`.
    #[inline]
    pub fn block_end(&self, block: BlockRef) -> usize {
        block.offset() + self.header_size() + self.header(block).size()
    }

    /// The block that starts where `block` ends, if `block` is not the last one.
    #[inline]
    pub fn next(&self, block: BlockRef) -> Option<BlockRef> {
        let end = self.block_end(block);
        (end < self.len).then(|| BlockRef::at(end))
    }

    #[inline]
    pub fn previous(&self, block: BlockRef) -> Option<BlockRef> {
        self.header(block).previous()
    }

    #[inline]
    pub fn first(&self) -> Option<BlockRef> {
        (!self.is_empty()).then_some(BlockRef::FIRST)
    }

    /// Iterates over every block in address order.
    pub fn blocks(&self) -> Blocks<'_, S> {
        Blocks {
            arena: self,
            current: self.first(),
        }
    }

    /// Finds the last block of the arena by walking the whole chain.
    pub fn last(&self) -> Option<BlockRef> {
        self.blocks().last()
    }
}

impl<S: MemorySource> Arena<S> {
    /// Grows the arena so that a block of `size` payload bytes (already
    /// aligned) fits in it.
    ///
    /// The first growth claims [`HeapConfig::initial_size`] bytes (or more, if
    /// the request is bigger) and turns them into one free block. Later growths
    /// ask for enough bytes to multiply the arena by
    /// [`HeapConfig::growth_factor`], again at least what the request needs.
    /// The new bytes extend the last block when it is free, or become a new
    /// free block otherwise.
    ///
    /// On failure no header is touched and the bytes taken from the source,
    /// if any, are given back.
    pub fn grow(&mut self, size: usize) -> Result<(), HeapError> {
        let header_size = self.header_size();
        let alignment = self.config.alignment;
        let out_of_memory = HeapError::OutOfMemory { requested: size };

        let needed = size
            .checked_add(header_size)
            .and_then(|needed| checked_align(needed, alignment))
            .ok_or(out_of_memory)?;

        let Some(base) = self.base else {
            let initial = cmp::max(self.config.initial_size, needed);
            let addr = self.claim(initial).ok_or(out_of_memory)?;

            self.base = Some(addr);
            self.len = initial;
            self.write_header(BlockRef::FIRST, Header::free(initial - header_size, None));

            log_debug!("arena created at {:p} with {} bytes", addr, initial);

            return Ok(());
        };

        let additional = cmp::max(
            self.len.saturating_mul(self.config.growth_factor - 1),
            needed,
        );
        let last = self.last().ok_or(out_of_memory)?;

        let Some(addr) = self.source.extend(additional) else {
            log_warn!("could not grow the arena by {} bytes", additional);
            return Err(out_of_memory);
        };

        let old_end = self.len;
        if addr.as_ptr() as usize != base.as_ptr() as usize + old_end {
            log_warn!(
                "memory source returned {:p}, not contiguous with the arena end {:p}",
                addr,
                self.end()
            );
            // SAFETY: the bytes were never part of the arena.
            unsafe { self.source.retract(additional) };
            return Err(out_of_memory);
        }

        self.len += additional;

        if self.header(last).is_free() {
            self.update(last, |header| header.set_size(header.size() + additional));
        } else {
            let block = BlockRef::at(old_end);
            self.write_header(block, Header::free(additional - header_size, Some(last)));
        }

        log_debug!("arena grown by {} bytes to {} bytes", additional, self.len);

        Ok(())
    }

    /// Claims the first `len` bytes of the arena and returns where it starts.
    ///
    /// If the source hands out a start that is not aligned, the missing bytes
    /// are claimed right behind the region and the arena is shifted up by
    /// that much. Everything claimed is given back when that fails.
    fn claim(&mut self, len: usize) -> Option<NonNull<u8>> {
        let alignment = self.config.alignment;

        let Some(addr) = self.source.extend(len) else {
            log_warn!("could not claim an initial arena of {} bytes", len);
            return None;
        };

        let start = addr.as_ptr() as usize;
        let pad = align(start, alignment) - start;
        if pad == 0 {
            return Some(addr);
        }

        let tail = self.source.extend(pad);
        if tail.is_some_and(|tail| tail.as_ptr() as usize == start + len) {
            log_debug!("skipped {} bytes to align the arena to {}", pad, alignment);

            // SAFETY: `pad < alignment <= len`, inside what was just claimed.
            return Some(unsafe { addr.add(pad) });
        }

        // SAFETY: nothing was written to these bytes yet.
        unsafe {
            if tail.is_some() {
                self.source.retract(pad);
            }
            self.source.retract(len);
        }

        log_warn!("memory source returned {:p}, cannot align it to {}", addr, alignment);

        None
    }

    /// Gives all the memory back to the source. The arena is empty afterwards.
    pub fn reset(&mut self) {
        // SAFETY: the arena is the only user of the source, and after this
        // call it has no blocks left to touch.
        unsafe { self.source.reset() };
        self.base = None;
        self.len = 0;
    }
}

/// Iterator over the blocks of an [`Arena`] in address order.
pub(crate) struct Blocks<'a, S> {
    arena: &'a Arena<S>,
    current: Option<BlockRef>,
}

impl<S> Iterator for Blocks<'_, S> {
    type Item = BlockRef;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current?;
        self.current = self.arena.next(block);

        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::FixedBuffer;

    const CONFIG: HeapConfig = HeapConfig::DEFAULT.with_initial_size(256);
    const WIDE: HeapConfig = HeapConfig::DEFAULT.with_initial_size(1024).with_alignment(128);

    #[repr(C, align(256))]
    struct Aligned([u8; 4096]);

    /// Hands out the first extension from one buffer and every later one
    /// from another, so growth is never contiguous.
    struct Scattered<'a> {
        first: FixedBuffer<'a>,
        rest: FixedBuffer<'a>,
    }

    unsafe impl MemorySource for Scattered<'_> {
        fn extend(&mut self, additional: usize) -> Option<NonNull<u8>> {
            if self.first.is_empty() {
                self.first.extend(additional)
            } else {
                self.rest.extend(additional)
            }
        }

        unsafe fn retract(&mut self, len: usize) {
            unsafe {
                if self.rest.is_empty() {
                    self.first.retract(len)
                } else {
                    self.rest.retract(len)
                }
            }
        }

        unsafe fn reset(&mut self) {
            unsafe {
                self.first.reset();
                self.rest.reset();
            }
        }
    }

    #[test]
    fn empty_arena_has_no_blocks() {
        let mut memory = [0u8; 64];
        let arena = Arena::new(FixedBuffer::new(&mut memory), CONFIG);

        assert!(arena.begin().is_null());
        assert!(arena.first().is_none());
        assert_eq!(arena.blocks().count(), 0);
        assert!(!arena.owns(std::ptr::null()));
    }

    #[test]
    fn first_growth_creates_one_free_block() {
        let mut memory = [0u8; 1024];
        let mut arena = Arena::new(FixedBuffer::new(&mut memory), CONFIG);
        let header = arena.header_size();

        arena.grow(8).unwrap();

        assert_eq!(arena.len(), 256);
        let blocks: Vec<_> = arena.blocks().collect();
        assert_eq!(blocks, vec![BlockRef::FIRST]);
        assert_eq!(arena.header(BlockRef::FIRST), Header::free(256 - header, None));
        assert_eq!(arena.end() as usize - arena.begin() as usize, 256);
    }

    #[test]
    fn first_growth_fits_big_requests() {
        let mut memory = [0u8; 2048];
        let mut arena = Arena::new(FixedBuffer::new(&mut memory), CONFIG);

        arena.grow(1000).unwrap();

        assert_eq!(arena.len(), 1000 + arena.header_size());
        assert_eq!(arena.header(BlockRef::FIRST).size(), 1000);
    }

    #[test]
    fn growth_extends_free_last_block() {
        let mut memory = [0u8; 1024];
        let mut arena = Arena::new(FixedBuffer::new(&mut memory), CONFIG);
        let header = arena.header_size();

        arena.grow(8).unwrap();
        arena.grow(8).unwrap();

        assert_eq!(arena.len(), 512);
        assert_eq!(arena.blocks().count(), 1);
        assert_eq!(arena.header(BlockRef::FIRST).size(), 512 - header);
    }

    #[test]
    fn growth_appends_block_after_used_one() {
        let mut memory = [0u8; 1024];
        let mut arena = Arena::new(FixedBuffer::new(&mut memory), CONFIG);
        let header = arena.header_size();

        arena.grow(8).unwrap();
        arena.update(BlockRef::FIRST, |h| h.set_in_use(true));
        arena.grow(8).unwrap();

        let blocks: Vec<_> = arena.blocks().collect();
        assert_eq!(blocks, vec![BlockRef::FIRST, BlockRef::at(256)]);

        let new = arena.header(BlockRef::at(256));
        assert!(new.is_free());
        assert_eq!(new.size(), 256 - header);
        assert_eq!(new.previous(), Some(BlockRef::FIRST));
        assert_eq!(arena.last(), Some(BlockRef::at(256)));
    }

    #[test]
    fn failed_growth_changes_nothing() {
        let mut memory = [0u8; 400];
        let mut arena = Arena::new(FixedBuffer::new(&mut memory), CONFIG);

        arena.grow(8).unwrap();
        let before = arena.header(BlockRef::FIRST);

        assert_eq!(
            arena.grow(8),
            Err(HeapError::OutOfMemory { requested: 8 })
        );
        assert_eq!(arena.len(), 256);
        assert_eq!(arena.header(BlockRef::FIRST), before);
    }

    #[test]
    fn payload_round_trip() {
        let mut memory = [0u8; 1024];
        let mut arena = Arena::new(FixedBuffer::new(&mut memory), CONFIG);
        arena.grow(8).unwrap();

        let payload = arena.payload(BlockRef::FIRST);
        assert!(arena.owns(payload.as_ptr()));
        assert!(!arena.owns(arena.begin()));
        assert!(!arena.owns(arena.end()));
        assert_eq!(arena.block_of(payload), BlockRef::FIRST);
        assert_eq!(
            payload.as_ptr() as usize - arena.address(BlockRef::FIRST),
            arena.header_size()
        );
    }

    #[test]
    fn misaligned_start_is_padded() {
        for skew in [0, 64, 128, 192] {
            let mut memory = Aligned([0; 4096]);
            let mut arena = Arena::new(FixedBuffer::new(&mut memory.0[skew..]), WIDE);
            let pad = (128 - skew % 128) % 128;

            arena.grow(8).unwrap();

            assert_eq!(arena.begin() as usize % 128, 0, "skew {skew}");
            assert_eq!(arena.len(), 1024);
            assert_eq!(arena.source().len(), 1024 + pad);

            arena.grow(8).unwrap();
            assert_eq!(arena.len(), 2048);
            assert_eq!(arena.blocks().count(), 1);
            assert_eq!(arena.source().len(), 2048 + pad);
        }
    }

    #[test]
    fn unaligned_claim_without_room_gives_everything_back() {
        let mut memory = Aligned([0; 4096]);
        let mut arena = Arena::new(FixedBuffer::new(&mut memory.0[64..64 + 1024]), WIDE);

        for _ in 0..3 {
            assert_eq!(arena.grow(8), Err(HeapError::OutOfMemory { requested: 8 }));
            assert!(arena.begin().is_null());
            assert!(arena.source().is_empty());
        }
    }

    #[test]
    fn non_contiguous_growth_gives_bytes_back() {
        let mut first = [0u8; 512];
        let mut rest = [0u8; 512];
        let source = Scattered {
            first: FixedBuffer::new(&mut first),
            rest: FixedBuffer::new(&mut rest),
        };
        let mut arena = Arena::new(source, CONFIG);

        arena.grow(8).unwrap();
        let before = arena.header(BlockRef::FIRST);

        assert_eq!(arena.grow(8), Err(HeapError::OutOfMemory { requested: 8 }));
        assert!(arena.source().rest.is_empty());
        assert_eq!(arena.source().first.len(), 256);
        assert_eq!(arena.len(), 256);
        assert_eq!(arena.header(BlockRef::FIRST), before);
    }
}
