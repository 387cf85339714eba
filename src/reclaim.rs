//! Split reference counting.
//!
//! The total number of references to a node is split in two parts:
//!
//! - the *external* count, stored alongside the node's address in every
//!   [`TaggedPtr`] slot through which other threads may reach it, and
//! - the *internal* count, stored inside the node and accumulating the
//!   credits of threads that are done with the node.
//!
//! Every thread bumps the external count of a slot before de-referencing the
//! pointer it loaded from it, and later settles that reference either by
//! decrementing the internal count ([`release_ref`]) or, if it was the thread
//! that unlinked the node from the slot, by folding the external count into
//! the internal one ([`free_external_counter`]).
//! A node additionally tracks how many slots may still hand out references to
//! it (`external_counters`) and is freed once both numbers reach zero.
//!
//! Nothing outside of this module touches the counters or frees a node that
//! has ever been published.

use core::mem;
use core::ptr::NonNull;
use core::sync::atomic::{
    AtomicU64,
    Ordering::{AcqRel, Acquire, Relaxed},
};

use crossbeam_utils::Backoff;

use crate::tagged::{AtomicTaggedPtr, TaggedPtr};

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        use std::alloc::{self as heap, Layout};
        use std::boxed::Box;
    } else {
        use alloc::alloc::{self as heap, Layout};
        use alloc::boxed::Box;
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Counted (trait)
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A node type whose lifetime is governed by split reference counting.
///
/// # Safety
///
/// Implementors must always return the same [`RefCount`] and must only be
/// allocated through [`try_alloc`], since reclamation frees them as a `Box`.
pub(crate) unsafe trait Counted: Sized {
    /// Returns the node's reference counters.
    fn ref_count(&self) -> &RefCount;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RefCount
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The internal half of a node's split reference count, together with the
/// number of slots that may still hand out external references.
///
/// Both values are packed into one word, so every update and the subsequent
/// check for zero happen as one atomic step.
pub(crate) struct RefCount {
    inner: AtomicU64,
}

/********** impl inherent *************************************************************************/

impl RefCount {
    /// Creates a new counter for a node that is referenced from
    /// `external_counters` distinct slots.
    #[inline]
    pub const fn new(external_counters: u32) -> Self {
        Self { inner: AtomicU64::new(Counts { internal: 0, external_counters }.into_bits()) }
    }

    #[inline]
    fn update(&self, func: impl Fn(Counts) -> Counts) -> Counts {
        let backoff = Backoff::new();
        let mut curr = self.inner.load(Relaxed);
        loop {
            let new = func(Counts::from_bits(curr));
            // AcqRel: all of this thread's accesses to the node must happen before it is freed
            // by whichever thread brings the counts down to zero.
            match self.inner.compare_exchange_weak(curr, new.into_bits(), AcqRel, Relaxed) {
                Ok(_) => return new,
                Err(actual) => {
                    curr = actual;
                    backoff.spin();
                }
            }
        }
    }

    #[cfg(test)]
    fn load(&self) -> Counts {
        Counts::from_bits(self.inner.load(Relaxed))
    }

    /// Overwrites both counters, for setting up nodes in tests.
    #[cfg(test)]
    pub fn store(&self, internal: i32, external_counters: u32) {
        self.inner.store(Counts { internal, external_counters }.into_bits(), Relaxed);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Counts
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A decoded [`RefCount`] value.
///
/// The internal count is signed: threads that lose a race may settle their
/// references before the unlinking thread has folded in the external count.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Counts {
    internal: i32,
    external_counters: u32,
}

/********** impl inherent *************************************************************************/

impl Counts {
    #[inline]
    fn is_zero(self) -> bool {
        self.internal == 0 && self.external_counters == 0
    }

    #[inline]
    const fn into_bits(self) -> u64 {
        (self.internal as u32 as u64) | ((self.external_counters as u64) << 32)
    }

    #[inline]
    const fn from_bits(bits: u64) -> Self {
        Self { internal: bits as u32 as i32, external_counters: (bits >> 32) as u32 }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// protocol
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Increases the external count of `slot`, starting from the `observed`
/// value, and returns the value that is now stored in the slot.
///
/// The retry loop runs until the increment succeeds, since other readers may
/// bump the same slot concurrently.
/// Afterwards, the caller holds one deferred reference to the returned node,
/// which it must later settle with either [`release_ref`] or
/// [`free_external_counter`].
/// A `null` slot hands out no references and is returned unchanged.
#[inline]
pub(crate) fn increase_external<T>(
    slot: &AtomicTaggedPtr<T>,
    observed: TaggedPtr<T>,
) -> TaggedPtr<T> {
    let backoff = Backoff::new();
    let mut curr = observed;
    loop {
        if curr.is_null() {
            return curr;
        }

        let new = curr.incremented();
        match slot.compare_exchange_weak(curr, new, Acquire, Relaxed) {
            Ok(_) => return new,
            Err(actual) => {
                curr = actual;
                backoff.spin();
            }
        }
    }
}

/// Settles one deferred reference to `node` that was acquired through
/// [`increase_external`] by a thread which did *not* unlink the node from
/// the slot it was read from.
///
/// # Safety
///
/// The caller must hold an unsettled reference to `node` and must not access
/// the node afterwards.
#[inline]
pub(crate) unsafe fn release_ref<N: Counted>(node: NonNull<N>) {
    let counts = node.as_ref().ref_count().update(|counts| Counts {
        internal: counts.internal.wrapping_sub(1),
        ..counts
    });

    if counts.is_zero() {
        reclaim(node);
    }
}

/// Retires the external counter of the slot from which `old` was unlinked.
///
/// The external count is transferred into the node's internal count, minus
/// two: one for the reference the slot itself held and one for the calling
/// thread's own increment, which is settled by this call as well.
///
/// # Safety
///
/// `old` must be the exact value the calling thread removed from a slot
/// (including all increments made before the removal), it must not be null
/// and the node must not be accessed by the caller afterwards.
#[inline]
pub(crate) unsafe fn free_external_counter<N: Counted>(old: TaggedPtr<N>) {
    debug_assert!(!old.is_null(), "external counter of a null slot");
    let node = NonNull::new_unchecked(old.as_ptr());
    let count_increase = (old.count() as i32).wrapping_sub(2);

    let counts = node.as_ref().ref_count().update(|counts| Counts {
        internal: counts.internal.wrapping_add(count_increase),
        external_counters: counts.external_counters - 1,
    });

    if counts.is_zero() {
        reclaim(node);
    }
}

#[inline]
unsafe fn reclaim<N: Counted>(node: NonNull<N>) {
    tracing::trace!(node = ?node, "reclaiming node");
    dealloc(node);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// allocation
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Moves `value` into a new heap allocation.
///
/// Allocation failures are not handled here: the value is handed back to the
/// caller instead.
/// Zero-sized values are never actually allocated.
#[inline]
pub(crate) fn try_alloc<T>(value: T) -> Result<NonNull<T>, T> {
    let layout = Layout::new::<T>();
    let ptr = if layout.size() == 0 {
        NonNull::dangling()
    } else {
        // safety: the layout has a non-zero size
        match NonNull::new(unsafe { heap::alloc(layout) }.cast::<T>()) {
            Some(ptr) => ptr,
            None => return Err(value),
        }
    };

    // safety: the pointer is valid for writes and properly aligned
    unsafe { ptr.as_ptr().write(value) };
    Ok(ptr)
}

/// Moves the value out of an allocation created by [`try_alloc`] and frees
/// the allocation.
///
/// # Safety
///
/// `ptr` must have been returned by [`try_alloc`] and must not be used
/// afterwards.
#[inline]
pub(crate) unsafe fn into_inner<T>(ptr: NonNull<T>) -> T {
    *Box::from_raw(ptr.as_ptr())
}

/// Drops and frees an allocation created by [`try_alloc`].
///
/// # Safety
///
/// `ptr` must have been returned by [`try_alloc`] and no other thread may
/// hold a reference to it, i.e. it was either never published or the caller
/// has exclusive access to the whole data structure.
#[inline]
pub(crate) unsafe fn dealloc<T>(ptr: NonNull<T>) {
    mem::drop(Box::from_raw(ptr.as_ptr()));
}

/// Aborts the process after a failed allocation for a `T`, like `Box::new`
/// does.
#[cold]
pub(crate) fn handle_alloc_error<T>() -> ! {
    heap::handle_alloc_error(Layout::new::<T>())
}
