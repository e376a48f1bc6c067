use crate::block::MIN_BLOCK_SIZE;

/// Alignment of every block header and every pointer handed to callers, in
/// bytes. All sizes the allocator works with internally are multiples of
/// this.
pub(crate) const ALIGNMENT: usize = 16;

/// Rounds `size` up to the next multiple of [`ALIGNMENT`].
///
/// # Examples
///
/// ```rust,ignore
/// assert_eq!(align_up(1), 16);
/// assert_eq!(align_up(16), 16);
/// assert_eq!(align_up(17), 32);
/// ```
#[inline]
pub(crate) fn align_up(size: usize) -> usize {
    (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Payload size actually reserved for a user request of `size` bytes. Never
/// less than [`MIN_BLOCK_SIZE`] so that a freed block can always hold its
/// boundary tag.
#[inline]
pub(crate) fn effective_size(size: usize) -> usize {
    align_up(size).max(MIN_BLOCK_SIZE)
}

/// Whether `address` satisfies the allocator-wide [`ALIGNMENT`].
#[inline]
pub(crate) fn is_aligned(address: usize) -> bool {
    address % ALIGNMENT == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_contract() {
        // For any s > 0: aligned % 16 == 0, aligned >= s, aligned - s < 16.
        for size in 1..=4096 {
            let aligned = align_up(size);
            assert_eq!(aligned % ALIGNMENT, 0);
            assert!(aligned >= size);
            assert!(aligned - size < ALIGNMENT);
        }
    }

    #[test]
    fn effective_size_has_a_floor() {
        assert_eq!(effective_size(1), MIN_BLOCK_SIZE);
        assert_eq!(effective_size(MIN_BLOCK_SIZE), MIN_BLOCK_SIZE);
        assert_eq!(effective_size(MIN_BLOCK_SIZE + 1), MIN_BLOCK_SIZE + ALIGNMENT);
        assert_eq!(effective_size(1024), 1024);
    }

    #[test]
    fn pointer_alignment() {
        assert!(is_aligned(0));
        assert!(is_aligned(0x7fc4676a5060));
        assert!(!is_aligned(0x7fc4676a5058));
    }
}
