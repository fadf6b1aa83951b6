use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use spin::{Mutex, MutexGuard};

use crate::{
    config::HeapConfig,
    error::HeapError,
    heap::Heap,
    kernel::{MemorySource, VirtualRegion},
};

/// A [`Heap`] behind a spin lock.
///
/// The heap itself has no synchronization at all; this wrapper puts a single
/// lock around every operation so the heap can be shared between threads and
/// installed as the global allocator. A spin lock is used because it never
/// allocates, not even under contention.
///
/// ```no_run
/// use brkheap::LockedHeap;
///
/// #[global_allocator]
/// static ALLOCATOR: LockedHeap = LockedHeap::global();
///
/// fn main() {
///     let v = vec![1, 2, 3];
///     assert_eq!(v.len(), 3);
/// }
/// ```
///
/// Build without the `log` feature when installing it as the global
/// allocator together with a logger that allocates.
pub struct LockedHeap<S = VirtualRegion> {
    inner: Mutex<Heap<S>>,
}

impl LockedHeap<VirtualRegion> {
    /// A locked heap with the default configuration.
    pub const fn new() -> Self {
        Self::from_heap(Heap::new())
    }

    /// A locked heap suitable for `#[global_allocator]`.
    ///
    /// Blocks are aligned to 16 bytes, which covers every primitive type on
    /// common targets. [`GlobalAlloc`] requests with a stricter alignment
    /// fail with a null pointer.
    pub const fn global() -> Self {
        let config = HeapConfig::DEFAULT.with_alignment(16);
        assert!(config.validate().is_ok());

        Self::from_heap(Heap::from_parts(VirtualRegion::new(), config))
    }
}

impl Default for LockedHeap<VirtualRegion> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> LockedHeap<S> {
    pub const fn from_heap(heap: Heap<S>) -> Self {
        Self {
            inner: Mutex::new(heap),
        }
    }

    /// A locked heap over `source` with a custom configuration.
    pub fn with_config(source: S, config: HeapConfig) -> Result<Self, HeapError> {
        Heap::with_config(source, config).map(Self::from_heap)
    }

    /// Locks the heap, mainly for introspection.
    pub fn lock(&self) -> MutexGuard<'_, Heap<S>> {
        self.inner.lock()
    }

    pub fn into_inner(self) -> Heap<S> {
        self.inner.into_inner()
    }
}

impl<S: MemorySource> LockedHeap<S> {
    /// See [`Heap::allocate`].
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.lock().allocate(size)
    }

    /// See [`Heap::zero_allocate`].
    pub fn zero_allocate(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        self.lock().zero_allocate(count, size)
    }

    /// See [`Heap::reallocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this heap.
    pub unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
        unsafe { self.lock().reallocate(ptr, size) }
    }

    /// See [`Heap::release`].
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this heap.
    pub unsafe fn release(&self, ptr: *mut u8) {
        unsafe { self.lock().release(ptr) }
    }

    fn supports(&self, layout: Layout) -> bool {
        layout.align() <= self.lock().config().alignment
    }
}

unsafe impl<S: MemorySource + Send> GlobalAlloc for LockedHeap<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if !self.supports(layout) {
            return ptr::null_mut();
        }

        self.allocate(layout.size()).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if !self.supports(layout) {
            return ptr::null_mut();
        }

        self.zero_allocate(1, layout.size()).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.release(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if !self.supports(layout) {
            return ptr::null_mut();
        }

        unsafe { self.reallocate(ptr, new_size) }.map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn global_alloc_respects_layout() {
        let heap = LockedHeap::global();

        unsafe {
            let layout = Layout::from_size_align(24, 16).unwrap();
            let ptr = heap.alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % 16, 0);

            let grown = heap.realloc(ptr, layout, 100);
            assert!(!grown.is_null());
            assert_eq!(grown as usize % 16, 0);
            heap.dealloc(grown, Layout::from_size_align(100, 16).unwrap());

            let strict = Layout::from_size_align(24, 64).unwrap();
            assert!(heap.alloc(strict).is_null());
        }

        assert_eq!(heap.lock().check_invariants(), Ok(()));
    }

    #[test]
    fn alloc_zeroed_is_zeroed() {
        let heap = LockedHeap::new();

        unsafe {
            let layout = Layout::array::<u64>(32).unwrap();
            let dirty = heap.alloc(layout);
            dirty.write_bytes(0xEE, layout.size());
            heap.dealloc(dirty, layout);

            let clean = heap.alloc_zeroed(layout);
            assert_eq!(clean, dirty);
            assert!(std::slice::from_raw_parts(clean, layout.size()).iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn shared_between_threads() {
        let heap = Arc::new(LockedHeap::new());

        let handles: Vec<_> = (0..4u8)
            .map(|id| {
                let heap = Arc::clone(&heap);

                thread::spawn(move || {
                    for round in 0..200usize {
                        let size = 8 + (round * 37 + id as usize * 11) % 300;
                        let ptr = heap.allocate(size).unwrap();

                        unsafe {
                            ptr.as_ptr().write_bytes(id, size);
                            let ptr = heap.reallocate(ptr.as_ptr(), size * 2).unwrap();
                            let bytes = std::slice::from_raw_parts(ptr.as_ptr(), size);
                            assert!(bytes.iter().all(|b| *b == id));
                            heap.release(ptr.as_ptr());
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let heap = heap.lock();
        assert_eq!(heap.check_invariants(), Ok(()));
        assert_eq!(heap.stats().used_blocks, 0);
    }
}
