//! The process-global heap and a C-shaped surface over it: free functions
//! returning raw pointers, null on failure, null tolerated on the way in.
//! This is the drop-in face of the allocator; [`crate::Hybralloc`] is the
//! same machinery as an owned value.

use std::ptr::{self, NonNull};

use crate::{allocator::Hybralloc, platform, stats::HeapStats};

static GLOBAL: Hybralloc = Hybralloc::new();

/// The heap instance behind the free functions in this module.
pub fn global() -> &'static Hybralloc {
    &GLOBAL
}

/// Warms up the allocator (page size query). Idempotent, and optional:
/// every operation initializes lazily on first use.
pub fn init() {
    platform::page_size();
}

/// Allocates `size` bytes aligned to 16, or returns null. `allocate(0)` is
/// null with [`crate::last_error`] set to invalid size.
pub fn allocate(size: usize) -> *mut u8 {
    to_raw(GLOBAL.allocate(size))
}

/// Overflow-checked `count * size` bytes, zero-filled.
pub fn allocate_zeroed(count: usize, size: usize) -> *mut u8 {
    to_raw(GLOBAL.allocate_zeroed(count, size))
}

/// `aligned_alloc` semantics: power-of-two `align`, `size` a multiple of
/// it.
pub fn allocate_aligned(align: usize, size: usize) -> *mut u8 {
    to_raw(GLOBAL.allocate_aligned(align, size))
}

/// Frees a pointer obtained from this module. Null is a silent no-op;
/// anything the heap never handed out terminates the process.
///
/// # Safety
///
/// `pointer` must be null or a live allocation of the global heap.
pub unsafe fn deallocate(pointer: *mut u8) {
    if let Some(pointer) = NonNull::new(pointer) {
        GLOBAL.deallocate(pointer);
    }
}

/// Classic realloc ladder: null allocates, zero size deallocates and
/// returns null, otherwise the data moves (or does not) and the returned
/// pointer replaces the old one. On failure the old pointer stays valid.
///
/// # Safety
///
/// `pointer` must be null or a live allocation of the global heap.
pub unsafe fn reallocate(pointer: *mut u8, size: usize) -> *mut u8 {
    match NonNull::new(pointer) {
        None => allocate(size),
        Some(pointer) => to_raw(GLOBAL.reallocate(pointer, size)),
    }
}

/// Actual payload size behind `pointer`; 0 for null.
///
/// # Safety
///
/// `pointer` must be null or a live allocation of the global heap.
pub unsafe fn usable_size(pointer: *mut u8) -> usize {
    match NonNull::new(pointer) {
        None => 0,
        Some(pointer) => GLOBAL.usable_size(pointer),
    }
}

/// Snapshot of the global heap's statistics.
pub fn stats() -> HeapStats {
    GLOBAL.stats()
}

fn to_raw(pointer: Option<NonNull<u8>>) -> *mut u8 {
    pointer.map(NonNull::as_ptr).unwrap_or(ptr::null_mut())
}
