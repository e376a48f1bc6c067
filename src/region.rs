use std::{
    mem,
    ptr::NonNull,
    sync::{Mutex, PoisonError},
};

use crate::{align::ALIGNMENT, header::Header, list::LinkedList, platform, Pointer};

/// Region header size in bytes. Blocks start this far into every OS chunk.
pub(crate) const REGION_HEADER_SIZE: usize = mem::size_of::<Header<Region>>();

const _: () = assert!(REGION_HEADER_SIZE == 48);
const _: () = assert!(REGION_HEADER_SIZE % ALIGNMENT == 0);

/// How a region was obtained from the operating system. Decides its whole
/// lifecycle: mapped regions are unmapped when their single block is
/// deallocated, heap-extension regions stay until process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegionOrigin {
    HeapExtension,
    PageMap,
}

/// Region specific data. The complete record is [`Header<Region>`], written
/// intrusively at the first bytes of the chunk itself and linked into the
/// registry, so tracking a region costs no allocation.
#[repr(C)]
pub(crate) struct Region {
    /// Total chunk length in bytes, including this header. This is the exact
    /// value a page-map region is unmapped with.
    pub len: usize,
    /// Bytes after the region header that have been carved into blocks.
    /// Physical block walks stop here; for heap-extension regions the tail
    /// past this point is the not-yet-carved extension pool. Mutated only
    /// under the heap mutex.
    pub used: usize,
    pub origin: RegionOrigin,
}

impl Header<Region> {
    /// Address of the first block header in this region.
    #[inline]
    pub unsafe fn blocks_start(region: NonNull<Self>) -> NonNull<u8> {
        Header::content_address_of(region)
    }

    /// One past the last carved byte. Blocks cover exactly
    /// `blocks_start..carved_end`.
    #[inline]
    pub unsafe fn carved_end(region: NonNull<Self>) -> usize {
        Self::blocks_start(region).as_ptr() as usize + region.as_ref().data.used
    }

    /// Whether `address` falls anywhere inside this chunk.
    #[inline]
    pub unsafe fn contains(region: NonNull<Self>, address: usize) -> bool {
        let start = region.as_ptr() as usize;
        address >= start && address < start + region.as_ref().data.len
    }
}

/// Length to request from the page-map primitive for a block of `total`
/// bytes (header plus payload): the region header on top, rounded up to
/// whole pages. Mapped regions are single tenant, so no extra page is ever
/// needed for a trailing block.
pub(crate) unsafe fn mapped_length(total: usize) -> usize {
    let length = REGION_HEADER_SIZE + total;
    let page = platform::page_size();

    page * ((length + page - 1) / page)
}

/// Ordered record of every chunk acquired from the OS. Pointer validation
/// and mapped-region release both go through here; the registry has its own
/// mutex and sits last in the `heap -> pool -> region` lock order.
pub(crate) struct RegionRegistry {
    regions: Mutex<LinkedList<Region>>,
}

impl RegionRegistry {
    pub const fn new() -> Self {
        Self {
            regions: Mutex::new(LinkedList::new()),
        }
    }

    /// Writes a region header at `address` and links it into the registry.
    /// The header must be fully initialized before the region becomes
    /// findable, so `used` is part of registration.
    ///
    /// # Safety
    ///
    /// `address` must be the 16-aligned base of a chunk of at least `len`
    /// bytes owned by the allocator.
    pub unsafe fn register(
        &self,
        address: NonNull<u8>,
        len: usize,
        used: usize,
        origin: RegionOrigin,
    ) -> NonNull<Header<Region>> {
        let mut regions = self.lock();
        regions.append(Region { len, used, origin }, address)
    }

    /// Unlinks `region`. The caller releases the memory afterwards; a region
    /// must leave the registry before its pages are returned.
    pub unsafe fn unregister(&self, region: NonNull<Header<Region>>) {
        self.lock().remove(region);
    }

    /// Region containing `address`, if any. A pointer is valid for the
    /// allocator exactly when this returns `Some`.
    pub unsafe fn find(&self, address: usize) -> Pointer<Header<Region>> {
        let regions = self.lock();

        for region in regions.iter() {
            if Header::<Region>::contains(region, address) {
                return Some(region);
            }
        }

        None
    }

    /// Number of registered regions per origin: `(heap_extension, page_map)`.
    pub fn counts(&self) -> (usize, usize) {
        let regions = self.lock();
        let mut heap = 0;
        let mut mapped = 0;

        unsafe {
            for region in regions.iter() {
                match region.as_ref().data.origin {
                    RegionOrigin::HeapExtension => heap += 1,
                    RegionOrigin::PageMap => mapped += 1,
                }
            }
        }

        (heap, mapped)
    }

    /// Unlinks and returns the first region record. Used by teardown to
    /// drain the registry without allocating.
    pub unsafe fn pop(&self) -> Option<(NonNull<u8>, usize, RegionOrigin)> {
        let mut regions = self.lock();
        let region = regions.first()?;
        regions.remove(region);

        Some((
            region.cast(),
            region.as_ref().data.len,
            region.as_ref().data.origin,
        ))
    }

    /// Runs `f` with the region list held. Used by the consistency checker,
    /// which needs a stable view of all regions at once.
    pub fn with_regions<R>(&self, f: impl FnOnce(&LinkedList<Region>) -> R) -> R {
        f(&self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinkedList<Region>> {
        // Registry mutations never panic midway, so a poisoned lock still
        // guards a consistent list.
        self.regions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(4096))]
    struct Chunk([u8; 4096]);

    #[test]
    fn mapped_length_rounds_to_pages() {
        unsafe {
            let page = platform::page_size();
            assert_eq!(mapped_length(page - REGION_HEADER_SIZE), page);
            assert_eq!(mapped_length(page), 2 * page);
            assert_eq!(mapped_length(128 * 1024), 128 * 1024 + page);
        }
    }

    #[test]
    fn register_find_unregister() {
        let mut first = Box::new(Chunk([0; 4096]));
        let mut second = Box::new(Chunk([0; 4096]));

        unsafe {
            let registry = RegionRegistry::new();

            let first_base = NonNull::new_unchecked(first.0.as_mut_ptr());
            let second_base = NonNull::new_unchecked(second.0.as_mut_ptr());

            let a = registry.register(first_base, 4096, 0, RegionOrigin::HeapExtension);
            let b = registry.register(second_base, 4096, 4096 - REGION_HEADER_SIZE, RegionOrigin::PageMap);

            assert_eq!(registry.counts(), (1, 1));

            let inside_a = first_base.as_ptr() as usize + 100;
            let inside_b = second_base.as_ptr() as usize + 4095;
            assert_eq!(registry.find(inside_a), Some(a));
            assert_eq!(registry.find(inside_b), Some(b));

            // One past the end belongs to no region.
            assert_eq!(registry.find(first_base.as_ptr() as usize + 4096), None);

            registry.unregister(b);
            assert_eq!(registry.find(inside_b), None);
            assert_eq!(registry.counts(), (1, 0));

            let (base, len, origin) = registry.pop().unwrap();
            assert_eq!(base, first_base);
            assert_eq!(len, 4096);
            assert_eq!(origin, RegionOrigin::HeapExtension);
            assert!(registry.pop().is_none());
        }
    }
}
