//! End-to-end pass over the real OS primitives (sbrk, mmap) through the
//! global API. Everything lives in one test function so the shared program
//! break is only ever grown from one place at a time.

use hybralloc as heap;

#[test]
fn global_heap_end_to_end() {
    heap::init();

    unsafe {
        // Heap-extension path.
        let a = heap::allocate(100);
        assert!(!a.is_null());
        assert_eq!(a as usize % 16, 0);
        a.write_bytes(0x5A, 100);

        let usable = heap::usable_size(a);
        assert!(usable >= 100);
        assert_eq!(usable % 16, 0);
        assert!(usable - 100 < 16);

        let b = heap::allocate_zeroed(16, 64);
        assert!(!b.is_null());
        for offset in 0..1024 {
            assert_eq!(*b.add(offset), 0);
        }

        let c = heap::allocate_aligned(256, 512);
        assert!(!c.is_null());
        assert_eq!(c as usize % 256, 0);
        c.write_bytes(0x7E, 512);

        // Page-map path: a dedicated region appears and disappears.
        let before = heap::stats();
        let big = heap::allocate(256 * 1024);
        assert!(!big.is_null());
        big.write_bytes(0x33, 256 * 1024);
        assert_eq!(heap::stats().mapped_regions, before.mapped_regions + 1);

        heap::deallocate(big);
        assert_eq!(heap::stats().mapped_regions, before.mapped_regions);

        // Growth preserves the prefix.
        let grown = heap::reallocate(a, 4096);
        assert!(!grown.is_null());
        for offset in 0..100 {
            assert_eq!(*grown.add(offset), 0x5A);
        }

        heap::deallocate(grown);
        heap::deallocate(b);
        heap::deallocate(c);
    }

    let stats = heap::stats();
    assert_eq!(stats.total_allocated, 0);
    assert_eq!(stats.allocation_count, 0);
    heap::global().check_consistency().unwrap();

    // Four threads churning pseudo-random sizes against the real heap.
    std::thread::scope(|scope| {
        for seed in 0..4u64 {
            scope.spawn(move || {
                let mut state = seed.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);

                for _ in 0..500 {
                    state = state
                        .wrapping_mul(6364136223846793005)
                        .wrapping_add(1442695040888963407);
                    let size = ((state >> 33) % 2048 + 1) as usize;

                    unsafe {
                        let pointer = heap::allocate(size);
                        assert!(!pointer.is_null());

                        pointer.write_bytes((state >> 56) as u8, size);
                        assert_eq!(*pointer, (state >> 56) as u8);
                        assert_eq!(*pointer.add(size - 1), (state >> 56) as u8);

                        heap::deallocate(pointer);
                    }
                }
            });
        }
    });

    assert_eq!(heap::stats().total_allocated, 0);
    heap::global().check_consistency().unwrap();
}
