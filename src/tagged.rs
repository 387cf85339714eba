//! Node pointers bundled with an external reference count.
//!
//! A [`TaggedPtr`] is read, copied and compare-and-swapped as one 128-bit
//! unit, so the address and its count can never be observed torn.
//! The count occupies the upper half and the address the lower half of the
//! underlying word.

use core::fmt;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering;

use portable_atomic::AtomicU128;

////////////////////////////////////////////////////////////////////////////////////////////////////
// TaggedPtr
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A (possibly null) node address paired with the number of working
/// references that have been handed out through the slot it was loaded from.
pub(crate) struct TaggedPtr<T> {
    ptr: *mut T,
    count: u32,
}

/********** impl inherent *************************************************************************/

impl<T> TaggedPtr<T> {
    /// Creates a new `null` pointer with a zero count.
    #[inline]
    pub const fn null() -> Self {
        Self { ptr: ptr::null_mut(), count: 0 }
    }

    /// Creates a new tagged pointer to `ptr` with the given external `count`.
    #[inline]
    pub fn new(ptr: NonNull<T>, count: u32) -> Self {
        Self { ptr: ptr.as_ptr(), count }
    }

    #[inline]
    pub fn as_ptr(self) -> *mut T {
        self.ptr
    }

    #[inline]
    pub fn as_non_null(self) -> Option<NonNull<T>> {
        NonNull::new(self.ptr)
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.ptr.is_null()
    }

    /// Returns the external reference count.
    #[inline]
    pub fn count(self) -> u32 {
        self.count
    }

    /// Returns a copy with the external count increased by one.
    ///
    /// The count wraps around on overflow, the reference counting arithmetic
    /// stays consistent modulo 2^32.
    #[inline]
    pub fn incremented(self) -> Self {
        Self { ptr: self.ptr, count: self.count.wrapping_add(1) }
    }

    #[inline]
    fn into_bits(self) -> u128 {
        (self.ptr.expose_provenance() as u64 as u128) | ((self.count as u128) << 64)
    }

    #[inline]
    fn from_bits(bits: u128) -> Self {
        Self {
            ptr: ptr::with_exposed_provenance_mut(bits as u64 as usize),
            count: (bits >> 64) as u32,
        }
    }
}

/********** impl Clone ****************************************************************************/

impl<T> Clone for TaggedPtr<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

/********** impl Copy *****************************************************************************/

impl<T> Copy for TaggedPtr<T> {}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for TaggedPtr<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaggedPtr").field("ptr", &self.ptr).field("count", &self.count).finish()
    }
}

/********** impl PartialEq ************************************************************************/

impl<T> PartialEq for TaggedPtr<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr && self.count == other.count
    }
}

/********** impl Eq *******************************************************************************/

impl<T> Eq for TaggedPtr<T> {}

////////////////////////////////////////////////////////////////////////////////////////////////////
// AtomicTaggedPtr
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An atomic [`TaggedPtr`] slot.
///
/// Like the `Atomic` pointer types of most reclamation schemes, this type
/// does not implement [`Drop`]; the data structure owning the slot is
/// responsible for freeing whatever it points to.
pub(crate) struct AtomicTaggedPtr<T> {
    inner: AtomicU128,
    _marker: PhantomData<*mut T>,
}

/********** impl inherent (const) *****************************************************************/

impl<T> AtomicTaggedPtr<T> {
    /// Creates a new `null` slot.
    #[inline]
    pub const fn null() -> Self {
        Self { inner: AtomicU128::new(0), _marker: PhantomData }
    }
}

/********** impl inherent *************************************************************************/

impl<T> AtomicTaggedPtr<T> {
    #[inline]
    pub fn new(tagged: TaggedPtr<T>) -> Self {
        Self { inner: AtomicU128::new(tagged.into_bits()), _marker: PhantomData }
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> TaggedPtr<T> {
        TaggedPtr::from_bits(self.inner.load(order))
    }

    /// Returns the current value through an exclusive reference, which
    /// requires no synchronization.
    #[inline]
    pub fn get_mut(&mut self) -> TaggedPtr<T> {
        TaggedPtr::from_bits(*self.inner.get_mut())
    }

    /// Stores `new` if the slot (address **and** count) still equals
    /// `current`.
    ///
    /// On failure, the value actually found in the slot is returned.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: TaggedPtr<T>,
        new: TaggedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedPtr<T>, TaggedPtr<T>> {
        self.inner
            .compare_exchange(current.into_bits(), new.into_bits(), success, failure)
            .map(TaggedPtr::from_bits)
            .map_err(TaggedPtr::from_bits)
    }

    /// Like [`compare_exchange`][AtomicTaggedPtr::compare_exchange], but may
    /// fail spuriously.
    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: TaggedPtr<T>,
        new: TaggedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedPtr<T>, TaggedPtr<T>> {
        self.inner
            .compare_exchange_weak(current.into_bits(), new.into_bits(), success, failure)
            .map(TaggedPtr::from_bits)
            .map_err(TaggedPtr::from_bits)
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for AtomicTaggedPtr<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.load(Ordering::Relaxed), f)
    }
}
