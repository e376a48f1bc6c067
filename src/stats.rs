use std::fmt;

/// Point-in-time snapshot of the heap, taken under the heap mutex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Payload bytes currently lent out to callers.
    pub total_allocated: usize,
    /// Payload bytes sitting in the free list.
    pub total_free: usize,
    /// High water mark of `total_allocated`.
    pub peak_allocated: usize,
    /// Number of live allocations.
    pub allocation_count: usize,
    /// Length of the free list.
    pub free_blocks: usize,
    /// Registered heap-extension regions. These live until process exit.
    pub heap_regions: usize,
    /// Registered page-map regions. One per live large allocation.
    pub mapped_regions: usize,
    /// Failed heap-extension acquisitions since startup.
    pub extend_failures: u32,
    /// Failed page-map acquisitions since startup.
    pub map_failures: u32,
    /// Set once acquisition failures pass the emergency threshold. Only
    /// ever used for logging.
    pub emergency: bool,
}

impl HeapStats {
    /// Share of heap bytes that are free, as a percentage. High values mean
    /// the free list is fragmented relative to what is actually in use.
    pub fn fragmentation_pct(&self) -> f64 {
        let total = self.total_allocated + self.total_free;

        if total == 0 {
            return 0.0;
        }

        self.total_free as f64 / total as f64 * 100.0
    }
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "heap statistics:")?;
        writeln!(f, "  total allocated: {} bytes", self.total_allocated)?;
        writeln!(f, "  total free:      {} bytes", self.total_free)?;
        writeln!(f, "  peak allocated:  {} bytes", self.peak_allocated)?;
        writeln!(f, "  allocations:     {}", self.allocation_count)?;
        writeln!(f, "  free blocks:     {}", self.free_blocks)?;
        writeln!(
            f,
            "  regions:         {} heap, {} mapped",
            self.heap_regions, self.mapped_regions
        )?;
        writeln!(f, "  fragmentation:   {:.2}%", self.fragmentation_pct())?;
        writeln!(
            f,
            "  failures:        {} extend, {} mmap{}",
            self.extend_failures,
            self.map_failures,
            if self.emergency { " (emergency)" } else { "" }
        )
    }
}

/// Live counters kept inside the heap mutex. [`HeapStats`] is assembled
/// from these plus the registry and source counters.
pub(crate) struct HeapCounters {
    pub total_allocated: usize,
    pub total_free: usize,
    pub peak_allocated: usize,
    pub allocation_count: usize,
}

impl HeapCounters {
    pub const fn new() -> Self {
        Self {
            total_allocated: 0,
            total_free: 0,
            peak_allocated: 0,
            allocation_count: 0,
        }
    }

    pub fn record_alloc(&mut self, size: usize) {
        self.total_allocated += size;
        self.allocation_count += 1;
        self.peak_allocated = self.peak_allocated.max(self.total_allocated);
    }

    pub fn record_free(&mut self, size: usize) {
        self.total_allocated -= size;
        self.allocation_count -= 1;
    }

    /// An in-place reallocation changed the payload size without changing
    /// the allocation count.
    pub fn record_resize(&mut self, old_size: usize, new_size: usize) {
        self.total_allocated = self.total_allocated - old_size + new_size;
        self.peak_allocated = self.peak_allocated.max(self.total_allocated);
    }

    pub fn free_added(&mut self, size: usize) {
        self.total_free += size;
    }

    pub fn free_removed(&mut self, size: usize) {
        self.total_free -= size;
    }

    /// Free share in `0.0..=1.0`, the degraded-mode routing input.
    pub fn fragmentation(&self) -> f64 {
        let total = self.total_allocated + self.total_free;

        if total == 0 {
            return 0.0;
        }

        self.total_free as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_alloc_lifecycle() {
        let mut counters = HeapCounters::new();

        counters.record_alloc(64);
        counters.record_alloc(128);
        assert_eq!(counters.total_allocated, 192);
        assert_eq!(counters.allocation_count, 2);
        assert_eq!(counters.peak_allocated, 192);

        counters.record_free(64);
        assert_eq!(counters.total_allocated, 128);
        assert_eq!(counters.peak_allocated, 192);

        counters.record_resize(128, 256);
        assert_eq!(counters.total_allocated, 256);
        assert_eq!(counters.allocation_count, 1);
        assert_eq!(counters.peak_allocated, 256);
    }

    #[test]
    fn fragmentation_ratio() {
        let mut counters = HeapCounters::new();
        assert_eq!(counters.fragmentation(), 0.0);

        counters.record_alloc(700);
        counters.free_added(300);
        assert!((counters.fragmentation() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn snapshot_display() {
        let stats = HeapStats {
            total_allocated: 300,
            total_free: 100,
            ..Default::default()
        };

        let rendered = stats.to_string();
        assert!(rendered.contains("total allocated: 300 bytes"));
        assert!(rendered.contains("fragmentation:   25.00%"));
    }
}
