//! Hybrid memory sourcing. Small requests are carved out of 64 KiB heap
//! extension chunks to amortize the system call; large requests (or small
//! ones while the heap is badly fragmented) get their own page mapping.

use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Mutex, PoisonError,
    },
};

use crate::{
    error::{self, AllocError},
    header::Header,
    platform,
    region::{mapped_length, Region, RegionOrigin, RegionRegistry, REGION_HEADER_SIZE},
    stats::HeapCounters,
    Pointer,
};

/// Requests whose total footprint (header plus effective payload) reaches
/// this many bytes bypass the free list and go straight to the page-map
/// primitive.
pub(crate) const MMAP_THRESHOLD: usize = 128 * 1024;

/// Minimum heap extension. Sub-requests are carved from the remainder until
/// the chunk is exhausted.
pub(crate) const EXTENSION_CHUNK: usize = 64 * 1024;

/// Cumulative acquisition failures after which the emergency flag latches.
const EMERGENCY_FAILURE_LIMIT: u32 = 10;

/// Free-to-total ratio above which small requests may be routed to the
/// page-map path instead of fragmenting the heap further.
const FRAGMENTATION_BYPASS: f64 = 0.30;

/// Memory handed to the engine: where the block header goes, how many bytes
/// (header plus payload) belong to the block, and the region it came from.
pub(crate) struct Acquired {
    pub address: NonNull<u8>,
    pub len: usize,
    pub region: NonNull<Header<Region>>,
}

/// Unconsumed tail of the most recent heap extension chunk.
struct ExtensionPool {
    cursor: Pointer<u8>,
    remaining: usize,
    region: Pointer<Header<Region>>,
}

pub(crate) struct MemorySource {
    pool: Mutex<ExtensionPool>,
    extend_failures: AtomicU32,
    map_failures: AtomicU32,
    emergency: AtomicBool,
}

impl MemorySource {
    pub const fn new() -> Self {
        Self {
            pool: Mutex::new(ExtensionPool {
                cursor: None,
                remaining: 0,
                region: None,
            }),
            extend_failures: AtomicU32::new(0),
            map_failures: AtomicU32::new(0),
            emergency: AtomicBool::new(false),
        }
    }

    /// Acquires `total` bytes (block header plus aligned payload) from the
    /// extension pool, extending the heap by at least [`EXTENSION_CHUNK`]
    /// when the pool runs dry. A tail too small for the request is
    /// abandoned; the carved extent bookkeeping means nothing ever walks
    /// into it.
    ///
    /// # Safety
    ///
    /// `total` must be a multiple of 16 and below [`MMAP_THRESHOLD`].
    pub unsafe fn acquire_small(
        &self,
        registry: &RegionRegistry,
        total: usize,
    ) -> Option<Acquired> {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);

        if pool.remaining >= total {
            let address = pool.cursor?;
            let region = pool.region?;

            pool.cursor = Some(NonNull::new_unchecked(address.as_ptr().add(total)));
            pool.remaining -= total;

            return Some(Acquired {
                address,
                len: total,
                region,
            });
        }

        let chunk = (REGION_HEADER_SIZE + total).max(EXTENSION_CHUNK);

        let Some(base) = platform::acquire_heap_chunk(chunk) else {
            drop(pool);
            self.note_failure(&self.extend_failures, "heap extension");
            return None;
        };

        log::trace!("extended heap by {chunk} bytes at {base:p}");

        let region = registry.register(base, chunk, 0, RegionOrigin::HeapExtension);
        let address = Header::<Region>::blocks_start(region);

        pool.cursor = Some(NonNull::new_unchecked(address.as_ptr().add(total)));
        pool.remaining = chunk - REGION_HEADER_SIZE - total;
        pool.region = Some(region);

        Some(Acquired {
            address,
            len: total,
            region,
        })
    }

    /// Maps a fresh region able to hold `total` bytes after the region
    /// header, rounded up to whole pages. The caller initializes the block
    /// header and then registers the region; a region must never be
    /// findable before its first header exists.
    pub unsafe fn acquire_mapped(&self, total: usize) -> Option<(NonNull<u8>, usize)> {
        let length = mapped_length(total);

        let Some(base) = platform::request_pages(length) else {
            self.note_failure(&self.map_failures, "page map");
            return None;
        };

        log::trace!("mapped {length} byte region at {base:p}");

        Some((base, length))
    }

    /// Degraded-mode routing: once the free list holds more than 30% of all
    /// heap bytes, carving yet another block out of it (or extending the
    /// heap further) only deepens fragmentation, so small requests may take
    /// the page-map path instead.
    pub fn should_bypass_heap(&self, counters: &HeapCounters) -> bool {
        counters.total_free > 0 && counters.fragmentation() > FRAGMENTATION_BYPASS
    }

    pub fn failures(&self) -> (u32, u32) {
        (
            self.extend_failures.load(Ordering::Relaxed),
            self.map_failures.load(Ordering::Relaxed),
        )
    }

    pub fn emergency(&self) -> bool {
        self.emergency.load(Ordering::Relaxed)
    }

    /// Forgets the current pool tail. Only teardown calls this, right
    /// before the chunk backing the pool is reclaimed.
    pub fn reset_pool(&self) {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        pool.cursor = None;
        pool.remaining = 0;
        pool.region = None;
    }

    fn note_failure(&self, counter: &AtomicU32, what: &str) {
        error::set_last_error(AllocError::OutOfMemory);
        counter.fetch_add(1, Ordering::Relaxed);

        let (extend, map) = self.failures();
        let total = extend + map;
        log::warn!("{what} acquisition failed ({total} failures so far)");

        if total >= EMERGENCY_FAILURE_LIMIT && !self.emergency.swap(true, Ordering::Relaxed) {
            log::error!("entering emergency mode after {total} acquisition failures");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragmentation_bypass_threshold() {
        let source = MemorySource::new();
        let mut counters = HeapCounters::new();

        // Empty heap: no bypass.
        assert!(!source.should_bypass_heap(&counters));

        // 25% free: below the threshold.
        counters.record_alloc(768);
        counters.free_added(256);
        assert!(!source.should_bypass_heap(&counters));

        // 40% free: bypass.
        counters.free_added(256);
        assert!(source.should_bypass_heap(&counters));
    }

    #[test]
    fn pool_carves_adjacent_spans() {
        let source = MemorySource::new();
        let registry = RegionRegistry::new();

        unsafe {
            let first = source.acquire_small(&registry, 96).unwrap();
            let second = source.acquire_small(&registry, 160).unwrap();

            // Both came from the same chunk and sit back to back.
            assert_eq!(first.region, second.region);
            assert_eq!(first.len, 96);
            assert_eq!(
                second.address.as_ptr() as usize,
                first.address.as_ptr() as usize + 96
            );

            // The chunk was registered with the extension origin.
            assert_eq!(registry.counts(), (1, 0));

            // Return the mock chunk so the test leaks nothing.
            source.reset_pool();
            let (base, len, origin) = registry.pop().unwrap();
            assert_eq!(origin, RegionOrigin::HeapExtension);
            assert_eq!(len, EXTENSION_CHUNK);
            platform::reclaim_heap_chunk(base, len);
        }
    }
}
