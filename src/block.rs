/// Most significant bit of the size word. Set while the block is handed out to a caller.
pub(crate) const IN_USE_BIT: usize = 1 << (usize::BITS - 1);

/// Mask that extracts the payload size from the size word.
pub(crate) const SIZE_MASK: usize = !IN_USE_BIT;

/// Largest payload a single block can describe.
pub(crate) const MAX_BLOCK_SIZE: usize = SIZE_MASK;

/// Stored in [`Header::previous`] by the first block of the arena.
const NO_BLOCK: usize = usize::MAX;

/// Position of a block inside the arena: the byte offset of its header from
/// the arena's beginning. Blocks never store machine pointers to each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockRef(usize);

impl BlockRef {
    /// The block that starts the arena.
    pub const FIRST: Self = Self(0);

    #[inline]
    pub const fn at(offset: usize) -> Self {
        Self(offset)
    }

    #[inline]
    pub const fn offset(self) -> usize {
        self.0
    }
}

/// This is the structure of a block header. The payload handed to the user
/// starts right after it.
///
/// ```text
/// +---------------------+ <------+
/// |      previous       |        |
/// +---------------------+        | -> Header
/// | in_use (1b) | size  |        |
/// +---------------------+ <------+ <-- pointer returned to the user
/// |       Content       |        |
/// |         ...         |        | -> `size` bytes of payload
/// |         ...         |        |
/// +---------------------+ <------+ <-- header of the next block
/// ```
///
/// There is no `next` field: the next header always starts `size` bytes after
/// the payload, so blocks tile the arena and the chain is walked by offset
/// arithmetic. The in-use flag lives in the most significant bit of the size
/// word, which is only ever touched through the accessors below.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Header {
    previous: usize,
    size: usize,
}

impl Header {
    /// Header of a free block.
    #[inline]
    pub const fn free(size: usize, previous: Option<BlockRef>) -> Self {
        Self {
            previous: match previous {
                Some(block) => block.offset(),
                None => NO_BLOCK,
            },
            size: size & SIZE_MASK,
        }
    }

    /// Payload size in bytes.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size & SIZE_MASK
    }

    #[inline]
    pub const fn in_use(&self) -> bool {
        self.size & IN_USE_BIT != 0
    }

    #[inline]
    pub const fn is_free(&self) -> bool {
        !self.in_use()
    }

    /// Replaces the size keeping the in-use flag.
    #[inline]
    pub fn set_size(&mut self, size: usize) {
        debug_assert!(size <= MAX_BLOCK_SIZE, "block size {size} overflows the size word");
        self.size = (self.size & IN_USE_BIT) | (size & SIZE_MASK);
    }

    #[inline]
    pub fn set_in_use(&mut self, in_use: bool) {
        if in_use {
            self.size |= IN_USE_BIT;
        } else {
            self.size &= SIZE_MASK;
        }
    }

    #[inline]
    pub const fn previous(&self) -> Option<BlockRef> {
        match self.previous {
            NO_BLOCK => None,
            offset => Some(BlockRef(offset)),
        }
    }

    #[inline]
    pub fn set_previous(&mut self, previous: Option<BlockRef>) {
        self.previous = previous.map_or(NO_BLOCK, BlockRef::offset);
    }
}
