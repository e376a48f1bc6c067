//! Abstraction over the two OS memory primitives the allocator consumes:
//! heap extension (grow the data segment, memory is never given back) and
//! anonymous page mapping (page-aligned, zero-filled, returned on unmap).
//! The engine does not care which kernel APIs provide these contracts.

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{align::ALIGNMENT, Pointer};

/// The two primitives plus the page size query. One implementation per
/// backing: real system calls for Unix, the process allocator for Miri and
/// unit tests, where system calls are either unavailable or would make
/// parallel tests step on the shared program break.
trait PlatformSpecificMemory {
    /// Grows the data segment and returns a 16-aligned chunk of exactly
    /// `length` bytes, zero-filled. Fails only on address space exhaustion,
    /// leaving the segment end unchanged.
    unsafe fn acquire_heap_chunk(length: usize) -> Pointer<u8>;

    /// Gives a heap chunk back. The data segment cannot shrink, so this is
    /// a no-op on real platforms; the mock releases the chunk so teardown
    /// leaves no leaks behind.
    unsafe fn reclaim_heap_chunk(address: NonNull<u8>, length: usize);

    /// Maps `length` bytes of fresh anonymous memory. Page-aligned,
    /// zero-filled, writable.
    unsafe fn request_pages(length: usize) -> Pointer<u8>;

    /// Returns previously mapped pages to the kernel.
    unsafe fn return_pages(address: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;
}

/// Zero sized dispatch type; exactly one of the modules below implements
/// the trait for it.
pub(crate) struct Platform;

/// Cached page size. Only known at runtime, queried once.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

#[inline]
pub(crate) fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);

    if cached != 0 {
        return cached;
    }

    let size = unsafe { Platform::page_size() };
    PAGE_SIZE.store(size, Ordering::Relaxed);

    size
}

#[inline]
pub(crate) unsafe fn acquire_heap_chunk(length: usize) -> Pointer<u8> {
    Platform::acquire_heap_chunk(length)
}

#[inline]
pub(crate) unsafe fn reclaim_heap_chunk(address: NonNull<u8>, length: usize) {
    Platform::reclaim_heap_chunk(address, length)
}

#[inline]
pub(crate) unsafe fn request_pages(length: usize) -> Pointer<u8> {
    Platform::request_pages(length)
}

#[inline]
pub(crate) unsafe fn return_pages(address: NonNull<u8>, length: usize) {
    Platform::return_pages(address, length)
}

#[cfg(all(unix, not(any(miri, test))))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformSpecificMemory, ALIGNMENT};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn acquire_heap_chunk(length: usize) -> Pointer<u8> {
            // The initial program break is not guaranteed to be 16-aligned,
            // so pad the extension and hand back the first aligned address.
            let current = libc::sbrk(0);
            if current as isize == -1 {
                return None;
            }

            let padding = (current as *mut u8).align_offset(ALIGNMENT);
            let increment = length.checked_add(padding)?;
            if increment > libc::intptr_t::MAX as usize {
                return None;
            }

            let previous = libc::sbrk(increment as libc::intptr_t);
            if previous as isize == -1 {
                return None;
            }

            Some(NonNull::new_unchecked((previous as *mut u8).add(padding)))
        }

        unsafe fn reclaim_heap_chunk(_address: NonNull<u8>, _length: usize) {
            // The data segment only ever grows.
        }

        unsafe fn request_pages(length: usize) -> Pointer<u8> {
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        unsafe fn return_pages(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // The region is still mapped and still ours; nothing sane
                // to do beyond making some noise.
                log::warn!("munmap of {length} bytes at {address:p} failed");
            }
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGE_SIZE) as usize
        }
    }
}

#[cfg(any(miri, test))]
mod mock {
    //! Backing for unit tests and Miri: the process allocator stands in for
    //! the kernel. Chunks are zeroed to match the contracts above, and
    //! everything is released through `reclaim_heap_chunk`/`return_pages`,
    //! which lets Miri verify the allocator never loses a region.

    use std::{alloc, ptr::NonNull};

    use super::{Platform, PlatformSpecificMemory, ALIGNMENT};
    use crate::Pointer;

    const MOCK_PAGE_SIZE: usize = 4096;

    fn chunk_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, ALIGNMENT).unwrap()
    }

    fn pages_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, MOCK_PAGE_SIZE).unwrap()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn acquire_heap_chunk(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc_zeroed(chunk_layout(length)))
        }

        unsafe fn reclaim_heap_chunk(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), chunk_layout(length));
        }

        unsafe fn request_pages(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc_zeroed(pages_layout(length)))
        }

        unsafe fn return_pages(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), pages_layout(length));
        }

        unsafe fn page_size() -> usize {
            MOCK_PAGE_SIZE
        }
    }
}

#[cfg(not(any(unix, miri, test)))]
compile_error!("hybralloc needs a Unix-style heap extension primitive (sbrk)");
