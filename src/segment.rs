use std::ptr::NonNull;
use std::sync::OnceLock;

use log::debug;

use crate::heap::HeapError;
use crate::utils::align;

/// Default size of the reserved heap segment: 20 MiB.
pub(crate) const MAX_HEAP: usize = 20 * (1 << 20);

/// Abstraction over the low level memory syscalls. The allocator itself
/// has nothing to do with the concrete APIs offered by each platform.
trait PlatformMemory {
    /// Requests a zero-filled memory region of `len` bytes. Returns the
    /// region's base address, or `None` if the underlying call fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the region of `len` bytes starting at `addr` to the platform.
    unsafe fn return_memory(addr: *mut u8, len: usize);

    /// The platform's virtual memory page size in bytes.
    unsafe fn page_size() -> usize;
}

/// The heap region manager.
///
/// The whole address range the heap can ever occupy is reserved in one
/// piece up front, and [`Segment::sbrk`] then hands it out in increments,
/// exactly like a program break that only moves up:
///
/// ```text
///  lo                      brk                                capacity
///  +------------------------+----------------------------------+
///  |     heap in use        |        reserved, untouched       |
///  +------------------------+----------------------------------+
///                           ^
///                sbrk(n) returns this address
///                and advances brk by n
/// ```
///
/// Reserving up front is what keeps the heap contiguous: every sbrk
/// return is exactly one past the previous high watermark. The reserved
/// tail is never read or written until sbrk reaches it, and both platform
/// providers hand the region over zero-filled.
pub(crate) struct Segment {
    base: NonNull<u8>,
    capacity: usize,
    brk: usize,
}

impl Segment {
    /// Reserves the default [`MAX_HEAP`] segment.
    pub fn new() -> Result<Self, HeapError> {
        Self::with_capacity(MAX_HEAP)
    }

    /// Reserves a segment of at least `bytes` bytes, rounded up to the
    /// platform page size. Small capacities are how the tests force the
    /// out-of-memory paths.
    pub fn with_capacity(bytes: usize) -> Result<Self, HeapError> {
        let capacity = align(bytes, page_size());
        let base =
            unsafe { Self::request_memory(capacity) }.ok_or(HeapError::ReserveFailed)?;

        Ok(Self {
            base,
            capacity,
            brk: 0,
        })
    }

    /// Extends the in-use region by `incr` bytes and returns the old
    /// break, i.e. the first byte of the fresh area. Refuses with `None`
    /// once the reservation is exhausted; the break never moves down.
    pub fn sbrk(&mut self, incr: usize) -> Option<NonNull<u8>> {
        if incr > self.capacity - self.brk {
            debug!(
                "sbrk refused: {incr} bytes requested, {} of {} left",
                self.capacity - self.brk,
                self.capacity
            );
            return None;
        }

        let old = self.brk;
        self.brk += incr;

        unsafe { Some(NonNull::new_unchecked(self.base.as_ptr().add(old))) }
    }

    /// Low watermark: the first byte of the heap.
    pub fn lo(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// High watermark: one past the last byte handed out by [`Self::sbrk`].
    pub fn hi(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.brk) }
    }

    /// Bytes obtained from the platform so far.
    pub fn len(&self) -> usize {
        self.brk
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe { Self::return_memory(self.base.as_ptr(), self.capacity) }
    }
}

/// Cached wrapper around [`PlatformMemory::page_size`].
pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(|| unsafe { Segment::page_size() })
}

#[cfg(unix)]
mod unix {
    use std::os::raw::{c_int, c_void};
    use std::ptr::NonNull;

    use libc::{mmap, munmap, off_t, size_t};

    use super::{PlatformMemory, Segment};

    impl PlatformMemory for Segment {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Anonymous private mapping, read-write, kernel-chosen address.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                match mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) {
                    libc::MAP_FAILED => None,
                    addr => Some(NonNull::new_unchecked(addr).cast::<u8>()),
                }
            }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) {
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
    use std::mem::MaybeUninit;
    use std::os::raw::c_void;
    use std::ptr::NonNull;

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{PlatformMemory, Segment};

    impl PlatformMemory for Segment {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            let protection = Memory::PAGE_READWRITE;
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: *mut u8, _len: usize) {
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
