use crate::{arena::{Arena, Blocks}, block::BlockRef};

/// View over the free [`BlockRef`]s of an [`Arena`].
///
/// There is no separate structure to keep in sync: the free list is just the
/// subsequence of blocks whose in-use flag is clear, found by walking the
/// chain in address order.
///
/// ```text
///
///      Free block                    Next free block
///
///          +-------------------------------+
///          |                               |
/// +--------|-+    +-------+    +-------+   |  +------+    +-------+
/// |   Free   | -> | Block | -> | Block | -> | Free | -> | Block |
/// +----------+    +-------+    +-------+      +------+    +-------+
///
/// ```
pub(crate) struct FreeList<'a, S> {
    arena: &'a Arena<S>,
}

impl<'a, S> FreeList<'a, S> {
    pub fn new(arena: &'a Arena<S>) -> Self {
        Self { arena }
    }

    /// Free blocks in address order.
    pub fn iter(&self) -> FreeBlocks<'a, S> {
        FreeBlocks {
            arena: self.arena,
            blocks: self.arena.blocks(),
        }
    }

    /// Returns the first free block, in address order, that can hold `size`
    /// bytes (already aligned).
    ///
    /// This is the first-fit algorithm: there is no size index to keep
    /// consistent and low addresses get reused first, at the cost of a linear
    /// walk.
    pub fn find_free_block(&self, size: usize) -> Option<BlockRef> {
        self.iter()
            .find(|block| self.arena.header(*block).size() >= size)
    }
}

pub(crate) struct FreeBlocks<'a, S> {
    arena: &'a Arena<S>,
    blocks: Blocks<'a, S>,
}

impl<S> Iterator for FreeBlocks<'_, S> {
    type Item = BlockRef;

    fn next(&mut self) -> Option<Self::Item> {
        let arena = self.arena;
        self.blocks.find(|block| arena.header(*block).is_free())
    }
}
