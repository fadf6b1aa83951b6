//! # brkheap
//!
//! A first-fit heap allocator that manages its own memory arena instead of
//! delegating to the platform allocator.
//!
//! The arena is one contiguous region that is split into blocks. Each block is
//! a small header followed by the payload handed out to the caller, and the
//! blocks tile the arena completely:
//!
//! ```text
//!   begin                                                           end
//!     |                                                               |
//!     +--------+-------+--------+--------------+--------+-------------+
//!     | Header | used  | Header |     free     | Header |    used     |
//!     +--------+-------+--------+--------------+--------+-------------+
//!              ^
//!              +-- pointer returned by `allocate`
//! ```
//!
//! - **Allocation** walks the blocks in address order and takes the first free
//!   one that is big enough, splitting off whatever it does not need.
//! - **Release** marks the block free and merges it with free neighbours on
//!   both sides, so two free blocks are never next to each other.
//! - **Reallocation** first tries to grow or shrink the block in place by
//!   borrowing from a free neighbour, and only moves the data when that fails.
//! - **Growth** asks the [`MemorySource`] for more memory when no free block
//!   fits, multiplying the arena by [`HeapConfig::growth_factor`].
//!
//! ## Quick Start
//!
//! ```rust
//! use brkheap::Heap;
//!
//! let mut heap = Heap::new();
//!
//! let a = heap.allocate(20).unwrap();
//! let b = heap.zero_allocate(10, 4).unwrap();
//!
//! unsafe {
//!     let a = heap.reallocate(a.as_ptr(), 64).unwrap();
//!     heap.release(a.as_ptr());
//!     heap.release(b.as_ptr());
//! }
//!
//! assert_eq!(heap.stats().used_blocks, 0);
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   brkheap
//!   ├── heap      - Heap: allocate / zero_allocate / reallocate / release
//!   ├── locked    - LockedHeap: the heap behind a lock, GlobalAlloc
//!   ├── arena     - the managed region and its growth (internal)
//!   ├── block     - block header layout (internal)
//!   ├── freelist  - first-fit search over free blocks (internal)
//!   ├── coalesce  - splitting and merging of blocks (internal)
//!   ├── kernel    - MemorySource, VirtualRegion, ProgramBreak
//!   ├── fixed     - FixedBuffer memory source
//!   ├── stats     - block snapshots, totals, fragmentation score
//!   └── dump      - non-allocating heap reports
//! ```
//!
//! ## Limitations
//!
//! - [`Heap`] is single threaded; use [`LockedHeap`] to share it.
//! - The arena never shrinks while the heap is alive.
//! - Releasing a pointer twice, or one this heap did not hand out, is
//!   undefined behaviour. Debug builds catch the obvious cases.

#[macro_use]
mod macros;

mod arena;
mod block;
mod coalesce;
mod config;
mod dump;
mod error;
mod fixed;
mod freelist;
mod heap;
mod kernel;
mod locked;
mod stats;
mod utils;

pub use config::HeapConfig;
pub use dump::{HeapDump, print_all_blocks, print_heap};
pub use error::{HeapError, InvariantViolation};
pub use fixed::{FIXED_BUFFER_ALIGN, FixedBuffer};
pub use heap::Heap;
#[cfg(target_os = "linux")]
pub use kernel::ProgramBreak;
pub use kernel::{DEFAULT_RESERVATION, MemorySource, VirtualRegion};
pub use locked::LockedHeap;
pub use stats::{BlockInfo, HeapStats, fragmentation_score};
