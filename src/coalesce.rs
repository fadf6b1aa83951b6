//! Splitting and merging of neighbouring blocks.
//!
//! These are the only operations, together with [`Arena::grow`], that change
//! the shape of the block chain. All of them keep the chain tiling the arena
//! and keep every back reference pointing at the block right before.

use crate::{arena::Arena, block::{BlockRef, Header}};

impl<S> Arena<S> {
    /// Shrinks `block` to `size` bytes (aligned, not bigger than the current
    /// size) and turns the rest into a new free block.
    ///
    /// ```text
    /// +--------+--------------------------+      +--------+------+--------+-------+
    /// | Header |         Payload          |  ->  | Header | size | Header | rest  |
    /// +--------+--------------------------+      +--------+------+--------+-------+
    /// ```
    ///
    /// Nothing happens if the rest is too small to hold a header and at least
    /// one alignment unit. Returns the resulting size of `block`.
    pub fn shrink_block(&mut self, block: BlockRef, size: usize) -> usize {
        let header_size = self.header_size();
        let old_size = self.header(block).size();

        // If there is no space to add an additional header don't shrink.
        if size + header_size >= old_size {
            return old_size;
        }

        self.update(block, |header| header.set_size(size));

        let rest = BlockRef::at(block.offset() + header_size + size);
        self.write_header(rest, Header::free(old_size - header_size - size, Some(block)));

        if let Some(following) = self.next(rest) {
            self.update(following, |header| header.set_previous(Some(rest)));
        }

        log_trace!(
            "split block {:#x}: {} -> {} + {}",
            block.offset(),
            old_size,
            size,
            old_size - header_size - size
        );

        size
    }

    /// Absorbs the block after `block` if there is one and it is free.
    ///
    /// `block` itself may be free or in use; its flag is kept. Returns the
    /// resulting size of `block`.
    pub fn join_with_next(&mut self, block: BlockRef) -> usize {
        let size = self.header(block).size();

        let Some(next) = self.next(block) else {
            return size;
        };

        let next_header = self.header(next);
        if next_header.in_use() {
            return size;
        }

        let joined = size + self.header_size() + next_header.size();
        self.update(block, |header| header.set_size(joined));

        // Update the back reference of the block that now follows.
        if let Some(following) = self.next(block) {
            self.update(following, |header| header.set_previous(Some(block)));
        }

        log_trace!("joined block {:#x} with {:#x}", block.offset(), next.offset());

        joined
    }

    /// Merges a free `block` into the block before it if that one is free as
    /// well. Returns the block that now covers `block`'s memory.
    pub fn join_with_previous(&mut self, block: BlockRef) -> BlockRef {
        match self.previous(block) {
            Some(previous) if self.header(previous).is_free() => {
                self.join_with_next(previous);
                previous
            }
            _ => block,
        }
    }
}
