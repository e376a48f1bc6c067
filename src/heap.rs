//! The heap engine: everything that runs under the heap mutex. Owns the
//! free list and the live counters; the surrounding [`crate::allocator`]
//! decides locking and talks to the OS source.

use std::{fmt, ptr::NonNull};

use crate::{
    block::{Block, BlockStatus, BLOCK_HEADER_SIZE, FOOTER_SIZE, MIN_BLOCK_SIZE},
    error::{self, AllocError},
    freelist::FreeList,
    header::Header,
    region::{Region, RegionRegistry},
    source::Acquired,
    stats::HeapCounters,
    Pointer,
};

pub(crate) struct Heap {
    free_blocks: FreeList,
    pub(crate) counters: HeapCounters,
}

impl Heap {
    pub const fn new() -> Self {
        Self {
            free_blocks: FreeList::new(),
            counters: HeapCounters::new(),
        }
    }

    /// Number of blocks currently in the free list.
    #[inline]
    pub fn free_block_count(&self) -> usize {
        self.free_blocks.len()
    }

    /// First-fit over the free list.
    pub unsafe fn find_fit(&self, size: usize) -> Pointer<Header<Block>> {
        self.free_blocks.find_fit(size)
    }

    /// Claims a free block for an allocation of `size` payload bytes:
    /// unlink, split off the excess if it can host a block of its own, mark
    /// allocated, count.
    pub unsafe fn take(&mut self, block: NonNull<Header<Block>>, size: usize) {
        self.remove_free(block);
        self.split_excess(block, size);
        self.counters.record_alloc(block.as_ref().size());
    }

    /// Turns memory fresh from the OS source into an allocated block,
    /// extending the owning region's carved extent. Split handling matches
    /// [`Self::take`]: if the source handed us more than needed, the excess
    /// becomes a free block.
    pub unsafe fn adopt(&mut self, acquired: Acquired, size: usize) -> NonNull<Header<Block>> {
        let Acquired {
            address,
            len,
            mut region,
        } = acquired;

        let block = Header::<Block>::write_new(address, len - BLOCK_HEADER_SIZE, 0);
        region.as_mut().data.used += len;

        self.split_excess(block, size);
        self.counters.record_alloc(block.as_ref().size());

        block
    }

    /// Frees an allocated block: count, coalesce with free physical
    /// neighbors, insert the merged block at the head of the free list.
    pub unsafe fn release(
        &mut self,
        block: NonNull<Header<Block>>,
        region: NonNull<Header<Region>>,
    ) {
        self.counters.record_free(block.as_ref().size());
        let merged = self.coalesce(block, region);
        self.insert_free(merged);
    }

    /// In-place growth: absorb the physically next block if it is free and
    /// the combined payload reaches `needed` bytes. Excess beyond `needed`
    /// is split back off. Returns whether the absorption happened; the
    /// caller accounts for the size change.
    pub unsafe fn try_absorb_next(
        &mut self,
        block: NonNull<Header<Block>>,
        region: NonNull<Header<Region>>,
        needed: usize,
    ) -> bool {
        let Some(next) = Header::<Block>::next_physical(block, region) else {
            return false;
        };

        self.verify_neighbor(next, region);

        if !next.as_ref().is_free() || block.as_ref().size() + next.as_ref().total_size() < needed
        {
            return false;
        }

        self.remove_free(next);
        Header::<Block>::set_size(block, block.as_ref().size() + next.as_ref().total_size());
        self.split_excess(block, needed);

        true
    }

    /// In-place shrink: carve the tail beyond `new_size` into a free block.
    /// The caller must have checked the splittable threshold and accounts
    /// for the size change.
    pub unsafe fn shrink_in_place(
        &mut self,
        mut block: NonNull<Header<Block>>,
        region: NonNull<Header<Region>>,
        new_size: usize,
    ) {
        let remainder_size = block.as_ref().size() - new_size - BLOCK_HEADER_SIZE;

        // No boundary tag here: the last 8 bytes of the retained payload
        // still belong to the caller, and tags of allocated blocks are
        // never trusted. The tag is written when the block is freed.
        block.as_mut().data.size = new_size;

        let remainder_address =
            NonNull::new_unchecked(Header::content_address_of(block).as_ptr().add(new_size));
        let remainder = Header::<Block>::write_new(remainder_address, remainder_size, 0);

        // The block after the remainder may itself be free; merge so no two
        // adjacent free blocks survive. Backwards is a no-op since `block`
        // is allocated.
        let merged = self.coalesce(remainder, region);
        self.insert_free(merged);
    }

    pub unsafe fn insert_free(&mut self, block: NonNull<Header<Block>>) {
        self.free_blocks.insert(block);
        self.counters.free_added(block.as_ref().size());
    }

    pub unsafe fn remove_free(&mut self, block: NonNull<Header<Block>>) {
        self.counters.free_removed(block.as_ref().size());
        self.free_blocks.remove(block);
    }

    /// Splits `block` when the payload beyond `size` is large enough to
    /// host a block of its own (header plus minimum payload). The remainder
    /// becomes a free block inserted at the list head.
    unsafe fn split_excess(&mut self, block: NonNull<Header<Block>>, size: usize) {
        if block.as_ref().size() < size + BLOCK_HEADER_SIZE + MIN_BLOCK_SIZE {
            return;
        }

        let remainder_size = block.as_ref().size() - size - BLOCK_HEADER_SIZE;
        Header::<Block>::set_size(block, size);

        let remainder_address =
            NonNull::new_unchecked(Header::content_address_of(block).as_ptr().add(size));
        let remainder = Header::<Block>::write_new(remainder_address, remainder_size, 1);

        self.insert_free(remainder);
    }

    /// Immediate coalescing. Merges the physically next block if free, then
    /// lets a free physical predecessor swallow the result, so at most
    /// three blocks collapse into one. Returns the header of the merged
    /// block (the address changes when the predecessor wins).
    unsafe fn coalesce(
        &mut self,
        mut block: NonNull<Header<Block>>,
        region: NonNull<Header<Region>>,
    ) -> NonNull<Header<Block>> {
        if let Some(next) = Header::<Block>::next_physical(block, region) {
            self.verify_neighbor(next, region);

            if next.as_ref().is_free() {
                self.remove_free(next);
                Header::<Block>::set_size(block, block.as_ref().size() + next.as_ref().total_size());
            }
        }

        if let Some(prev) = Header::<Block>::prev_physical_free(block, region) {
            self.remove_free(prev);
            Header::<Block>::set_size(prev, prev.as_ref().size() + block.as_ref().total_size());
            block = prev;
        }

        block
    }

    /// A physical neighbor lives in allocator-owned metadata; if its header
    /// does not validate, someone wrote past the end of their allocation.
    unsafe fn verify_neighbor(
        &self,
        block: NonNull<Header<Block>>,
        region: NonNull<Header<Region>>,
    ) {
        if Header::<Block>::verify(block, region) != BlockStatus::Valid {
            error::report_fatal(
                AllocError::Corruption,
                block.as_ptr().cast(),
                "neighboring block header failed integrity check",
            );
        }
    }

    /// Payload sizes of the blocks currently free, in list order.
    #[cfg(test)]
    pub(crate) unsafe fn free_sizes(&self) -> Vec<usize> {
        let mut sizes = Vec::new();

        for block in self.free_blocks.iter() {
            sizes.push(block.as_ref().size());
        }

        sizes
    }

    /// Full structural audit, meant for tests and debugging: walks every
    /// region block by block and the free list link by link, then checks
    /// that the two views agree with each other and with the counters.
    pub unsafe fn check_consistency(
        &self,
        registry: &RegionRegistry,
    ) -> Result<(), ConsistencyError> {
        let mut physical_free_blocks = 0usize;
        let mut physical_free_bytes = 0usize;

        registry.with_regions(|regions| unsafe {
            for region in regions.iter() {
                let mut address = Header::<Region>::blocks_start(region).as_ptr() as usize;
                let end = Header::<Region>::carved_end(region);
                let mut previous_free = false;

                while address < end {
                    let block = NonNull::new_unchecked(address as *mut Header<Block>);

                    if Header::<Block>::verify(block, region) != BlockStatus::Valid {
                        return Err(ConsistencyError::BadHeader { address });
                    }

                    if block.as_ref().is_free() {
                        if previous_free {
                            return Err(ConsistencyError::AdjacentFreeBlocks { address });
                        }

                        let tag = ((address + BLOCK_HEADER_SIZE + block.as_ref().size()
                            - FOOTER_SIZE) as *const usize)
                            .read();
                        if tag != block.as_ref().size() {
                            return Err(ConsistencyError::BadHeader { address });
                        }

                        physical_free_blocks += 1;
                        physical_free_bytes += block.as_ref().size();
                    }

                    previous_free = block.as_ref().is_free();
                    address += block.as_ref().total_size();
                }
            }

            Ok(())
        })?;

        let mut listed = 0usize;
        let mut previous: Pointer<Header<Block>> = None;

        for node in self.free_blocks.iter() {
            if node.as_ref().prev != previous {
                return Err(ConsistencyError::BrokenLinks {
                    address: node.as_ptr() as usize,
                });
            }

            listed += 1;
            previous = Some(node);
        }

        if listed != physical_free_blocks {
            return Err(ConsistencyError::FreeListMismatch {
                listed,
                physical: physical_free_blocks,
            });
        }

        if physical_free_bytes != self.counters.total_free {
            return Err(ConsistencyError::FreeAccountingMismatch {
                physical: physical_free_bytes,
                counted: self.counters.total_free,
            });
        }

        Ok(())
    }
}

/// Violation found by [`Heap::check_consistency`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyError {
    /// A header along a physical walk failed validation, or a free block's
    /// boundary tag disagrees with its size.
    BadHeader { address: usize },
    /// Two physically adjacent free blocks survived coalescing.
    AdjacentFreeBlocks { address: usize },
    /// The free list and the physical walk disagree on how many free
    /// blocks exist.
    FreeListMismatch { listed: usize, physical: usize },
    /// The free byte counter disagrees with the blocks actually free.
    FreeAccountingMismatch { physical: usize, counted: usize },
    /// A node's backward link does not point at its predecessor.
    BrokenLinks { address: usize },
}

impl fmt::Display for ConsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadHeader { address } => {
                write!(f, "invalid block header at {address:#x}")
            }
            Self::AdjacentFreeBlocks { address } => {
                write!(f, "uncoalesced adjacent free blocks at {address:#x}")
            }
            Self::FreeListMismatch { listed, physical } => {
                write!(f, "free list has {listed} entries, physical walk found {physical}")
            }
            Self::FreeAccountingMismatch { physical, counted } => {
                write!(f, "{physical} bytes physically free, counters say {counted}")
            }
            Self::BrokenLinks { address } => {
                write!(f, "broken free list back link at {address:#x}")
            }
        }
    }
}

impl std::error::Error for ConsistencyError {}
