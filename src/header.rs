use std::ptr::NonNull;

use crate::list::Node;

/// Every piece of on-heap metadata we keep doubles as a linked list node: a
/// block header links into the free list, a region header links into the
/// region registry. This alias exists so code that talks about headers does
/// not have to think about list nodes.
pub(crate) type Header<T> = Node<T>;

impl<T> Header<T> {
    /// Returns the header located right before `address`.
    ///
    /// ```text
    /// +-------------+
    /// |  Header<T>  | <- Returned pointer.
    /// +-------------+
    /// |   Content   | <- Given address.
    /// +-------------+
    /// ```
    ///
    /// # Safety
    ///
    /// `address` must point exactly one `Header<T>` past a valid header.
    /// Deallocation hands us addresses we previously gave out, so as long as
    /// the caller keeps that contract this is sound.
    #[inline]
    pub unsafe fn from_content_address(address: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().cast::<Self>().offset(-1))
    }

    /// Returns the first address after the header, where its content starts.
    ///
    /// Written as an associated function instead of a method so that no
    /// intermediate `&self` is created for pure address arithmetic, which
    /// keeps Miri's aliasing checks happy.
    #[inline]
    pub unsafe fn content_address_of(header: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(header.as_ptr().offset(1)).cast()
    }
}
