use std::ptr::NonNull;

use crate::{
    align::{is_aligned, ALIGNMENT},
    block::{Block, MAGIC, MIN_BLOCK_SIZE},
    error::{self, AllocError},
    header::Header,
    list::{Iter, LinkedList},
    Pointer,
};

/// The free list: one process-global doubly linked list of free blocks,
/// linked through the header fields that go stale while a block is
/// allocated. Insertion is at the head, removal by node, both O(1); no
/// ordering by size or address is maintained.
pub(crate) struct FreeList {
    blocks: LinkedList<Block>,
}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            blocks: LinkedList::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Marks `block` free, refreshes its boundary tag and links it at the
    /// head of the list.
    ///
    /// # Safety
    ///
    /// `block` must be a valid, unlinked block header.
    pub unsafe fn insert(&mut self, mut block: NonNull<Header<Block>>) {
        block.as_mut().data.is_free = 1;
        Header::<Block>::write_footer(block);
        self.blocks.push_front(block);
    }

    /// Unlinks `block` and marks it allocated.
    ///
    /// # Safety
    ///
    /// `block` must be linked in this list.
    pub unsafe fn remove(&mut self, mut block: NonNull<Header<Block>>) {
        self.blocks.remove(block);
        block.as_mut().data.is_free = 0;
    }

    /// First-fit search: the first block with `size >= wanted`, in list
    /// order (ties go to the most recently inserted). Every node visited is
    /// integrity-checked; a bad node means something scribbled over a free
    /// block header, which is fatal.
    pub unsafe fn find_fit(&self, wanted: usize) -> Pointer<Header<Block>> {
        for block in self.blocks.iter() {
            self.check_node(block);

            if block.as_ref().size() >= wanted {
                return Some(block);
            }
        }

        None
    }

    /// Iterator over the free block headers.
    ///
    /// # Safety
    ///
    /// The list must not be mutated while iterating.
    pub unsafe fn iter(&self) -> Iter<Block> {
        self.blocks.iter()
    }

    /// The subset of [`Header::verify`] that needs no region context. Free
    /// list nodes live in allocator-owned memory, so a mismatch here is
    /// corruption, not a user error.
    unsafe fn check_node(&self, block: NonNull<Header<Block>>) {
        let address = block.as_ptr() as usize;
        let data = &block.as_ref().data;

        let intact = is_aligned(address)
            && data.magic == MAGIC
            && data.size >= MIN_BLOCK_SIZE
            && data.size % ALIGNMENT == 0
            && data.is_free == 1;

        if !intact {
            error::report_fatal(
                AllocError::Corruption,
                block.as_ptr().cast(),
                "free list entry failed integrity check",
            );
        }
    }
}
