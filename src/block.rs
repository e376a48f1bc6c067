use std::{mem, ptr::NonNull};

use crate::{
    align::{is_aligned, ALIGNMENT},
    header::Header,
    region::Region,
    Pointer,
};

/// Sentinel stored in every header while the block belongs to the heap.
/// Corruption detection compares against this exact value, so it is part of
/// the on-heap format.
pub(crate) const MAGIC: u32 = 0xDEAD_BEEF;

/// Smallest payload a block can have. Big enough for the boundary tag and
/// keeps all block arithmetic in multiples of [`ALIGNMENT`].
pub(crate) const MIN_BLOCK_SIZE: usize = 16;

/// Size of the boundary tag written at the end of every payload.
pub(crate) const FOOTER_SIZE: usize = mem::size_of::<usize>();

/// Block header size in bytes. The user payload starts exactly this many
/// bytes past the header address.
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<Header<Block>>();

// The 32-byte header is part of the on-heap format, not an implementation
// accident. `Header<Block>` is `next` + `prev` + `Block`, all repr(C).
const _: () = assert!(BLOCK_HEADER_SIZE == 32);
const _: () = assert!(BLOCK_HEADER_SIZE % ALIGNMENT == 0);

/// Block specific data. The complete on-heap header is [`Header<Block>`]:
/// the two list links (meaningful only while the block sits in the free
/// list) followed by these fields.
///
/// ```text
/// +--------------------------+
/// | next free block (8)      | <-+ valid while is_free == 1,
/// +--------------------------+   | stale otherwise
/// | prev free block (8)      | <-+
/// +--------------------------+
/// | payload size (8)         |
/// +--------------------------+
/// | is_free (4) | magic (4)  |
/// +--------------------------+ <- user pointer
/// |        payload           |
/// |          ...             |
/// | boundary tag (last 8)    | <- payload size again, trusted only
/// +--------------------------+    while the block is free
/// ```
#[repr(C)]
pub(crate) struct Block {
    /// Payload bytes, excluding the header. Always a multiple of 16 and at
    /// least [`MIN_BLOCK_SIZE`].
    pub size: usize,
    /// 0 = allocated, 1 = free. Anything else means the header was
    /// overwritten.
    pub is_free: u32,
    /// Must equal [`MAGIC`].
    pub magic: u32,
}

/// Answer of [`Header::<Block>::verify`]. One state per way a header can go
/// bad, mirroring the fatal error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockStatus {
    Valid,
    CorruptMagic,
    InvalidSize,
    Misaligned,
    InvalidFreeState,
    OutOfBounds,
}

impl Header<Block> {
    /// Writes a fresh header (links cleared, magic set) plus its boundary
    /// tag at `address`.
    ///
    /// # Safety
    ///
    /// `address` must be 16-aligned and have room for the header and `size`
    /// payload bytes. `size` must be a multiple of 16, at least
    /// [`MIN_BLOCK_SIZE`].
    pub unsafe fn write_new(address: NonNull<u8>, size: usize, is_free: u32) -> NonNull<Self> {
        let header = address.as_ptr() as *mut Self;

        header.write(Header {
            next: None,
            prev: None,
            data: Block {
                size,
                is_free,
                magic: MAGIC,
            },
        });

        let block = NonNull::new_unchecked(header);
        Self::write_footer(block);

        block
    }

    /// Changes the payload size and rewrites the boundary tag to match.
    pub unsafe fn set_size(mut block: NonNull<Self>, size: usize) {
        block.as_mut().data.size = size;
        Self::write_footer(block);
    }

    /// Writes the boundary tag: the payload size, duplicated in the last 8
    /// payload bytes. Allocated blocks hand those bytes to the user, so the
    /// tag is only load-bearing while the block is free.
    pub unsafe fn write_footer(block: NonNull<Self>) {
        let size = block.as_ref().data.size;
        let footer = Self::content_address_of(block)
            .as_ptr()
            .add(size - FOOTER_SIZE) as *mut usize;
        footer.write(size);
    }

    /// Constant-time integrity check of a header against its region. Called
    /// on every deallocate, every reallocate and every free list traversal
    /// step.
    pub unsafe fn verify(block: NonNull<Self>, region: NonNull<Header<Region>>) -> BlockStatus {
        let address = block.as_ptr() as usize;
        let start = Header::<Region>::blocks_start(region).as_ptr() as usize;
        let end = Header::<Region>::carved_end(region);

        if !is_aligned(address) {
            return BlockStatus::Misaligned;
        }

        if address < start || address + BLOCK_HEADER_SIZE > end {
            return BlockStatus::OutOfBounds;
        }

        let data = &block.as_ref().data;

        if data.magic != MAGIC {
            return BlockStatus::CorruptMagic;
        }

        if data.size < MIN_BLOCK_SIZE || data.size % ALIGNMENT != 0 {
            return BlockStatus::InvalidSize;
        }

        if data.is_free > 1 {
            return BlockStatus::InvalidFreeState;
        }

        if address + BLOCK_HEADER_SIZE + data.size > end {
            return BlockStatus::OutOfBounds;
        }

        BlockStatus::Valid
    }

    /// Header of the physically next block, or `None` when this block ends
    /// at the carved boundary of its region. The returned header is not
    /// validated.
    pub unsafe fn next_physical(
        block: NonNull<Self>,
        region: NonNull<Header<Region>>,
    ) -> Pointer<Self> {
        let next = block.as_ptr() as usize + block.as_ref().total_size();

        if next >= Header::<Region>::carved_end(region) {
            return None;
        }

        Some(NonNull::new_unchecked(next as *mut Self))
    }

    /// Header of the physically previous block, located through its boundary
    /// tag, but only when that block is provably free. An allocated
    /// neighbor's tag sits in user-owned payload and may contain anything,
    /// so the candidate it names is believed only if every header check
    /// passes and the size echo plus the adjacency arithmetic line up.
    pub unsafe fn prev_physical_free(
        block: NonNull<Self>,
        region: NonNull<Header<Region>>,
    ) -> Pointer<Self> {
        let address = block.as_ptr() as usize;
        let start = Header::<Region>::blocks_start(region).as_ptr() as usize;

        if address == start {
            return None;
        }

        let tag = ((address - FOOTER_SIZE) as *const usize).read();

        if tag < MIN_BLOCK_SIZE || tag % ALIGNMENT != 0 {
            return None;
        }

        let candidate_address = match address.checked_sub(BLOCK_HEADER_SIZE + tag) {
            Some(candidate) if candidate >= start => candidate,
            _ => return None,
        };

        let candidate = NonNull::new_unchecked(candidate_address as *mut Self);

        if Self::verify(candidate, region) != BlockStatus::Valid {
            return None;
        }

        let data = &candidate.as_ref().data;
        if data.is_free != 1 || data.size != tag {
            return None;
        }

        Some(candidate)
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.data.is_free == 1
    }

    /// Payload size, excluding [`BLOCK_HEADER_SIZE`].
    #[inline]
    pub fn size(&self) -> usize {
        self.data.size
    }

    /// Full physical extent: header plus payload.
    #[inline]
    pub fn total_size(&self) -> usize {
        BLOCK_HEADER_SIZE + self.data.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{Region, RegionOrigin, REGION_HEADER_SIZE};

    #[repr(align(4096))]
    struct Arena([u8; 4096]);

    unsafe fn fake_region(arena: &mut Arena, used: usize) -> NonNull<Header<Region>> {
        let header = arena.0.as_mut_ptr() as *mut Header<Region>;
        header.write(Header {
            next: None,
            prev: None,
            data: Region {
                len: 4096,
                used,
                origin: RegionOrigin::HeapExtension,
            },
        });
        NonNull::new_unchecked(header)
    }

    #[test]
    fn header_layout_is_pinned() {
        assert_eq!(BLOCK_HEADER_SIZE, 32);
        assert_eq!(mem::align_of::<Header<Block>>(), 16);
    }

    #[test]
    fn verify_states() {
        let mut arena = Arena([0; 4096]);

        unsafe {
            let region = fake_region(&mut arena, 128);
            let start = Header::<Region>::blocks_start(region);

            let block = Header::<Block>::write_new(start, 64, 0);
            assert_eq!(Header::<Block>::verify(block, region), BlockStatus::Valid);

            (*block.as_ptr()).data.magic = 0xCCCC_CCCC;
            assert_eq!(
                Header::<Block>::verify(block, region),
                BlockStatus::CorruptMagic
            );
            (*block.as_ptr()).data.magic = MAGIC;

            (*block.as_ptr()).data.size = 63;
            assert_eq!(
                Header::<Block>::verify(block, region),
                BlockStatus::InvalidSize
            );
            (*block.as_ptr()).data.size = 64;

            (*block.as_ptr()).data.is_free = 7;
            assert_eq!(
                Header::<Block>::verify(block, region),
                BlockStatus::InvalidFreeState
            );
            (*block.as_ptr()).data.is_free = 0;

            // A block whose extent runs past the carved boundary.
            (*block.as_ptr()).data.size = 512;
            assert_eq!(
                Header::<Block>::verify(block, region),
                BlockStatus::OutOfBounds
            );
            (*block.as_ptr()).data.size = 64;

            let misaligned =
                NonNull::new_unchecked(start.as_ptr().add(8)).cast::<Header<Block>>();
            assert_eq!(
                Header::<Block>::verify(misaligned, region),
                BlockStatus::Misaligned
            );
        }
    }

    #[test]
    fn physical_navigation() {
        let mut arena = Arena([0; 4096]);

        unsafe {
            // Two adjacent blocks: 64 bytes free, 128 bytes allocated.
            let region = fake_region(&mut arena, (BLOCK_HEADER_SIZE + 64) + (BLOCK_HEADER_SIZE + 128));
            let start = Header::<Region>::blocks_start(region);

            let first = Header::<Block>::write_new(start, 64, 1);
            let second_address =
                NonNull::new_unchecked(start.as_ptr().add(BLOCK_HEADER_SIZE + 64));
            let second = Header::<Block>::write_new(second_address, 128, 0);

            assert_eq!(Header::<Block>::next_physical(first, region), Some(second));
            assert_eq!(Header::<Block>::next_physical(second, region), None);

            // Backward navigation trusts the tag because `first` is free.
            assert_eq!(
                Header::<Block>::prev_physical_free(second, region),
                Some(first)
            );
            assert_eq!(Header::<Block>::prev_physical_free(first, region), None);

            // An allocated previous block is never returned, even with an
            // intact tag.
            (*first.as_ptr()).data.is_free = 0;
            assert_eq!(Header::<Block>::prev_physical_free(second, region), None);

            // A clobbered tag (user data) is rejected outright.
            (*first.as_ptr()).data.is_free = 1;
            let tag = second.as_ptr().cast::<u8>().offset(-(FOOTER_SIZE as isize)) as *mut usize;
            tag.write(0xCCCC_CCCC_CCCC_CCCC);
            assert_eq!(Header::<Block>::prev_physical_free(second, region), None);
        }
    }

    #[test]
    fn region_header_size_is_pinned() {
        assert_eq!(REGION_HEADER_SIZE, 48);
    }
}
