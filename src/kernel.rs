use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::utils::{align, checked_align};

/// Virtual memory page size of the computer. This is usually 4096.
/// This value should be a constant, but we can't do that since we
/// don't know the value at compile time.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Address space reserved by [`VirtualRegion::new`]: 1 GiB.
pub const DEFAULT_RESERVATION: usize = 1 << 30;

/// Where the heap gets its memory from.
///
/// The arena only ever asks for *more* memory through a single incremental
/// extension primitive, in the spirit of `sbrk(2)`. Every successful call must
/// return memory that starts exactly where the previous extension ended; the
/// heap treats anything else as a failed growth.
///
/// # Safety
///
/// Implementors must guarantee that the bytes returned by [`extend`] are
/// readable and writable, are not used by anyone else, and stay valid until
/// [`reset`] is called or the source is dropped.
///
/// [`extend`]: MemorySource::extend
/// [`reset`]: MemorySource::reset
pub unsafe trait MemorySource {
    /// Extends the memory handed out so far by `additional` bytes and returns
    /// the start of the new bytes, or `None` if the environment cannot
    /// provide them.
    fn extend(&mut self, additional: usize) -> Option<NonNull<u8>>;

    /// Gives back the last `len` bytes handed out by [`MemorySource::extend`],
    /// so the next extension starts where they did. Several extensions are
    /// given back in reverse order.
    ///
    /// # Safety
    ///
    /// `len` must not exceed what is currently handed out, and nothing may
    /// access the given back bytes afterwards.
    unsafe fn retract(&mut self, len: usize);

    /// Gives back everything obtained through [`MemorySource::extend`]. The
    /// next extension starts a brand new region.
    ///
    /// # Safety
    ///
    /// Nothing may access memory previously returned by this source.
    unsafe fn reset(&mut self);
}

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. The heap itself has nothing to do with the concrete
/// implementations / APIs offered by each kernel.
trait PlatformMemory {
    /// Reserves `len` bytes of address space without backing them. It returns
    /// a pointer to the reservation or `None` if the underlying syscall fails.
    unsafe fn reserve(len: usize) -> Option<NonNull<u8>>;

    /// Makes `len` bytes starting at `addr` readable and writable. `addr` must
    /// be page aligned and inside a reservation.
    unsafe fn commit(addr: *mut u8, len: usize) -> bool;

    /// Returns the reservation of size `len` starting from `addr` back to the kernel.
    unsafe fn release(addr: *mut u8, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;
}

/// Wrapper to calculate the computer's page size.
#[inline]
pub(crate) fn page_size() -> usize {
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = unsafe { VirtualRegion::page_size() };
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

/// A contiguous range of virtual address space that is reserved once and
/// committed page by page as the heap grows.
///
/// This gives the heap `sbrk`-like contiguous growth without touching the
/// process break, so any number of heaps can live in the same process. The
/// reservation is only made on the first extension, and it is released when
/// the region is dropped or reset.
///
/// ```text
///  base                 base + len        committed            capacity
///   |                        |                |                     |
///   +------------------------+----------------+---------------------+
///   |     handed to heap     | committed, idle|  reserved (no access)|
///   +------------------------+----------------+---------------------+
/// ```
#[derive(Debug)]
pub struct VirtualRegion {
    /// Start of the reservation, `None` until the first extension.
    base: Option<NonNull<u8>>,
    /// Requested reservation size.
    capacity: usize,
    /// Actual reservation size (capacity rounded to pages).
    reserved: usize,
    /// Bytes made readable and writable so far (page multiple).
    committed: usize,
    /// Bytes handed out through [`MemorySource::extend`].
    len: usize,
}

// The region exclusively owns its mapping, so moving it across threads is fine.
unsafe impl Send for VirtualRegion {}

impl VirtualRegion {
    /// A region that reserves [`DEFAULT_RESERVATION`] bytes.
    pub const fn new() -> Self {
        Self::with_capacity(DEFAULT_RESERVATION)
    }

    /// A region that can never grow beyond `capacity` bytes.
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            base: None,
            capacity,
            reserved: 0,
            committed: 0,
            len: 0,
        }
    }

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

    fn base_or_reserve(&mut self) -> Option<NonNull<u8>> {
        if let Some(base) = self.base {
            return Some(base);
        }

        let reserved = checked_align(self.capacity.max(1), page_size())?;
        let base = unsafe { Self::reserve(reserved)? };

        log_debug!("reserved {} bytes of address space at {:p}", reserved, base);

        self.base = Some(base);
        self.reserved = reserved;
        Some(base)
    }
}

impl Default for VirtualRegion {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl MemorySource for VirtualRegion {
    fn extend(&mut self, additional: usize) -> Option<NonNull<u8>> {
        let new_len = self.len.checked_add(additional)?;
        if new_len > self.capacity {
            return None;
        }

        let base = self.base_or_reserve()?;

        if new_len > self.committed {
            let target = align(new_len, page_size()).min(self.reserved);

            unsafe {
                if !Self::commit(base.as_ptr().add(self.committed), target - self.committed) {
                    return None;
                }
            }

            self.committed = target;
        }

        let start = unsafe { base.add(self.len) };
        self.len = new_len;

        Some(start)
    }

    unsafe fn retract(&mut self, len: usize) {
        // Pages stay committed and get handed out again by the next extension.
        self.len = self.len.saturating_sub(len);
    }

    unsafe fn reset(&mut self) {
        if let Some(base) = self.base.take() {
            unsafe { Self::release(base.as_ptr(), self.reserved) };
        }

        self.reserved = 0;
        self.committed = 0;
        self.len = 0;
    }
}

impl Drop for VirtualRegion {
    fn drop(&mut self) {
        unsafe { self.reset() };
    }
}

#[cfg(unix)]
mod unix {
    use super::{PlatformMemory, VirtualRegion};

    use libc::{mmap, mprotect, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for VirtualRegion {
        unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // No access until committed.
            const PROT: c_int = libc::PROT_NONE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn commit(addr: *mut u8, len: usize) -> bool {
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;

            unsafe { mprotect(addr as *mut c_void, len as size_t, PROT) == 0 }
        }

        unsafe fn release(addr: *mut u8, len: usize) {
            unsafe {
                munmap(addr as *mut c_void, len as size_t);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{PlatformMemory, VirtualRegion};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for VirtualRegion {
        unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let addr = Memory::VirtualAlloc(None, len, Memory::MEM_RESERVE, Memory::PAGE_NOACCESS);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn commit(addr: *mut u8, len: usize) -> bool {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            unsafe {
                let committed = Memory::VirtualAlloc(
                    Some(addr as *const c_void),
                    len,
                    Memory::MEM_COMMIT,
                    protection,
                );

                !committed.is_null()
            }
        }

        unsafe fn release(addr: *mut u8, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

/// The classic program break, moved with `sbrk(2)`.
///
/// Only one heap per process should use this source. If some other code moves
/// the break between two extensions the new memory is not contiguous with the
/// arena and the heap refuses to grow into it.
#[cfg(target_os = "linux")]
#[derive(Debug, Default)]
pub struct ProgramBreak {
    /// Break value right before the first extension.
    start: Option<NonNull<u8>>,
    /// Bytes obtained since `start`.
    len: usize,
}

// SAFETY: the program break is process wide, there is no thread-local state.
#[cfg(target_os = "linux")]
unsafe impl Send for ProgramBreak {}

#[cfg(target_os = "linux")]
impl ProgramBreak {
    pub const fn new() -> Self {
        Self {
            start: None,
            len: 0,
        }
    }
}

#[cfg(target_os = "linux")]
unsafe impl MemorySource for ProgramBreak {
    fn extend(&mut self, additional: usize) -> Option<NonNull<u8>> {
        let increment = libc::intptr_t::try_from(additional).ok()?;

        let addr = unsafe { libc::sbrk(increment) };
        if addr == usize::MAX as *mut libc::c_void {
            return None;
        }

        let addr = NonNull::new(addr.cast::<u8>())?;
        self.start.get_or_insert(addr);
        self.len += additional;

        Some(addr)
    }

    unsafe fn retract(&mut self, len: usize) {
        let Some(start) = self.start else {
            return;
        };
        let Ok(decrement) = libc::intptr_t::try_from(len) else {
            return;
        };

        // Same as reset: only the top of the break can be given back.
        unsafe {
            let current = libc::sbrk(0).cast::<u8>();
            if len <= self.len && current == start.as_ptr().add(self.len) {
                libc::sbrk(-decrement);
                self.len -= len;
            }
        }
    }

    unsafe fn reset(&mut self) {
        let Some(start) = self.start.take() else {
            return;
        };

        // We can only move the break back if nobody moved it after us.
        unsafe {
            let current = libc::sbrk(0).cast::<u8>();
            if current == start.as_ptr().add(self.len) {
                libc::brk(start.as_ptr().cast());
            }
        }

        self.len = 0;
    }
}
