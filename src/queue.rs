//! A lock-free FIFO queue.

use core::fmt;
use core::iter::FromIterator;
use core::ptr::{self, NonNull};
use core::sync::atomic::{
    AtomicPtr,
    Ordering::{self, AcqRel, Acquire, Relaxed},
};

use crossbeam_utils::{Backoff, CachePadded};

use crate::error::AllocError;
use crate::reclaim::{self, Counted, RefCount};
use crate::tagged::{AtomicTaggedPtr, TaggedPtr};

////////////////////////////////////////////////////////////////////////////////////////////////////
// Queue
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A concurrent unbounded lock-free multi-producer/multi-consumer FIFO queue.
///
/// The queue always contains at least one node, a dummy whose payload slot is
/// still empty and which is referenced by `tail`.
/// Producers store their element into the dummy's slot and then append a new
/// empty node as the next dummy, so `head` and `tail` referencing the same
/// node means the queue is empty.
/// Both anchors carry an external reference count and nodes are reclaimed
/// through split reference counting once neither anchor nor any thread can
/// reach them any longer.
///
/// A producer that finds the current dummy already claimed by another
/// producer helps that producer by appending a node and advancing `tail`
/// before retrying, so no producer ever has to wait for a stalled one.
///
/// # Examples
///
/// ```
/// use conquer_split::Queue;
///
/// let queue = Queue::new();
/// queue.push(1);
/// queue.push(2);
///
/// assert_eq!(queue.pop(), Some(1));
/// assert_eq!(queue.pop(), Some(2));
/// assert_eq!(queue.pop(), None);
/// ```
pub struct Queue<T> {
    head: CachePadded<AtomicTaggedPtr<Node<T>>>,
    tail: CachePadded<AtomicTaggedPtr<Node<T>>>,
}

/********** impl Send + Sync **********************************************************************/

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

/********** impl inherent *************************************************************************/

impl<T> Queue<T> {
    /// Creates a new empty queue.
    ///
    /// # Aborts
    ///
    /// Aborts the process if no memory can be allocated for the initial dummy
    /// node.
    #[inline]
    pub fn new() -> Self {
        let dummy = match Self::alloc_node() {
            Some(dummy) => dummy,
            None => reclaim::handle_alloc_error::<Node<T>>(),
        };

        let anchor = TaggedPtr::new(dummy, 1);
        Self {
            head: CachePadded::new(AtomicTaggedPtr::new(anchor)),
            tail: CachePadded::new(AtomicTaggedPtr::new(anchor)),
        }
    }

    /// Returns `true` if the queue was empty at the time of the call.
    ///
    /// With concurrent pushes or pops, the result may already be outdated
    /// when it is returned.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Acquire).as_ptr() == self.tail.load(Acquire).as_ptr()
    }

    /// Pushes `elem` to the back of the queue.
    ///
    /// # Aborts
    ///
    /// Aborts the process if no memory can be allocated for the element or
    /// its node, as [`Box::new`] does.
    #[inline]
    pub fn push(&self, elem: T) {
        if self.try_push(elem).is_err() {
            reclaim::handle_alloc_error::<Node<T>>();
        }
    }

    /// Pushes `elem` to the back of the queue or returns it inside an
    /// [`AllocError`] if no memory can be allocated for the element or its
    /// node.
    pub fn try_push(&self, elem: T) -> Result<(), AllocError<T>> {
        let data = reclaim::try_alloc(elem).map_err(Self::alloc_failed)?;
        let mut new_next = match Self::alloc_node() {
            Some(node) => TaggedPtr::new(node, 1),
            // safety: `data` was never published
            None => return Err(Self::alloc_failed(unsafe { reclaim::into_inner(data) })),
        };

        let backoff = Backoff::new();
        let mut old_tail = self.tail.load(Relaxed);
        loop {
            old_tail = reclaim::increase_external(&*self.tail, old_tail);
            // safety: tail is never null and the increased external count keeps the node alive
            let tail = unsafe { &*old_tail.as_ptr() };

            if tail.try_claim(data) {
                let next = match tail.try_append(new_next) {
                    Ok(()) => new_next,
                    Err(appended) => {
                        // another producer has already appended a node on our behalf
                        // safety: the node was never published
                        unsafe { reclaim::dealloc(NonNull::new_unchecked(new_next.as_ptr())) };
                        appended
                    }
                };

                self.set_new_tail(old_tail, next);
                return Ok(());
            }

            // the node was claimed by another producer, help it append the next dummy before
            // retrying with the same element
            let (next, appended) = match tail.try_append(new_next) {
                Ok(()) => (new_next, true),
                Err(next) => (next, false),
            };

            self.set_new_tail(old_tail, next);

            if appended {
                new_next = match Self::alloc_node() {
                    Some(node) => TaggedPtr::new(node, 1),
                    // safety: `data` was never published
                    None => return Err(Self::alloc_failed(unsafe { reclaim::into_inner(data) })),
                };
            }

            old_tail = self.tail.load(Relaxed);
            backoff.spin();
        }
    }

    /// Pops the element from the front of the queue or returns `None` if the
    /// queue is empty.
    pub fn pop(&self) -> Option<T> {
        let backoff = Backoff::new();
        let mut old_head = self.head.load(Relaxed);
        loop {
            old_head = reclaim::increase_external(&*self.head, old_head);
            // safety: head is never null
            let node = unsafe { NonNull::new_unchecked(old_head.as_ptr()) };

            if node.as_ptr() == self.tail.load(Acquire).as_ptr() {
                // safety: the reference acquired above has not yet been settled
                unsafe { reclaim::release_ref(node) };
                return None;
            }

            // safety: the increased external count keeps the node alive and since it is no
            // longer the tail, its next pointer is set
            let next = unsafe { node.as_ref() }.next.load(Acquire);
            match self.head.compare_exchange(old_head, next, AcqRel, Relaxed) {
                Ok(_) => unsafe {
                    // safety: only the thread that unlinked the node may take its element, the
                    // node must be settled afterwards
                    let data = node.as_ref().data.swap(Node::<T>::taken(), Acquire);
                    reclaim::free_external_counter(old_head);

                    debug_assert!(!data.is_null(), "unlinked a node without an element");
                    return NonNull::new(data).map(|data| reclaim::into_inner(data));
                },
                Err(actual) => {
                    // safety: the reference acquired above has not yet been settled
                    unsafe { reclaim::release_ref(node) };
                    old_head = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Advances `tail` from the node referenced by `old_tail` to `new_tail`,
    /// unless another thread has already done so, and settles the calling
    /// thread's reference to the old tail node.
    #[inline]
    fn set_new_tail(&self, mut old_tail: TaggedPtr<Node<T>>, new_tail: TaggedPtr<Node<T>>) {
        let curr = old_tail.as_ptr();
        while let Err(actual) = self.tail.compare_exchange_weak(old_tail, new_tail, AcqRel, Relaxed)
        {
            old_tail = actual;
            if actual.as_ptr() != curr {
                break;
            }
        }

        // safety: the tail node was kept alive by the reference acquired by the calling thread,
        // which is settled exactly once here
        unsafe {
            if old_tail.as_ptr() == curr {
                reclaim::free_external_counter(old_tail);
            } else {
                reclaim::release_ref(NonNull::new_unchecked(curr));
            }
        }
    }

    #[inline]
    fn alloc_node() -> Option<NonNull<Node<T>>> {
        reclaim::try_alloc(Node::new()).ok()
    }

    #[cold]
    fn alloc_failed(elem: T) -> AllocError<T> {
        tracing::warn!("failed to allocate queue element");
        AllocError(elem)
    }
}

/********** impl Default **************************************************************************/

impl<T> Default for Queue<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for Queue<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Queue").field("head", &*self.head).field("tail", &*self.tail).finish()
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        let mut remaining = 0usize;
        let mut curr = self.head.get_mut().as_non_null();
        while let Some(mut node) = curr {
            // safety: exclusive access to the queue means all references to its nodes have been
            // settled, the chain from head to tail contains all nodes that are not yet freed
            unsafe {
                let node_mut = node.as_mut();
                curr = node_mut.next.get_mut().as_non_null();
                if node_mut.has_elem() {
                    remaining += 1;
                }

                reclaim::dealloc(node);
            }
        }

        if remaining > 0 {
            tracing::debug!(remaining, "dropped queue with remaining elements");
        }
    }
}

/********** impl Extend ***************************************************************************/

impl<T> Extend<T> for Queue<T> {
    #[inline]
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for elem in iter {
            self.push(elem);
        }
    }
}

/********** impl FromIterator *********************************************************************/

impl<T> FromIterator<T> for Queue<T> {
    #[inline]
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut queue = Self::new();
        queue.extend(iter);
        queue
    }
}

/********** impl IntoIterator *********************************************************************/

impl<T> IntoIterator for Queue<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        IntoIter { queue: self }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// IntoIter
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An owning iterator over the elements of a [`Queue`], yielding them in FIFO
/// order.
#[derive(Debug)]
pub struct IntoIter<T> {
    queue: Queue<T>,
}

/********** impl Iterator *************************************************************************/

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.queue.pop()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Node
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The sentinel marking a node whose element has been taken.
///
/// A producer may still hold a reference to a node that has already been
/// dequeued, so the payload slot must never return to `null`.
static TAKEN: u8 = 0;

struct Node<T> {
    /// The node's (boxed) element, which is stored by exactly one producer and
    /// taken by exactly one consumer.
    data: AtomicPtr<T>,
    /// The node's counters, both the head side (`head` or the predecessor's
    /// `next`) and `tail` reference a queue node.
    ref_count: RefCount,
    next: AtomicTaggedPtr<Node<T>>,
}

/********** impl inherent *************************************************************************/

impl<T> Node<T> {
    const ACQ_REL: (Ordering, Ordering) = (AcqRel, Acquire);

    /// Creates a new empty node to serve as the queue's dummy.
    #[inline]
    fn new() -> Self {
        Self {
            data: AtomicPtr::new(ptr::null_mut()),
            ref_count: RefCount::new(2),
            next: AtomicTaggedPtr::null(),
        }
    }

    #[inline]
    fn taken() -> *mut T {
        ptr::addr_of!(TAKEN) as *mut T
    }

    #[inline]
    fn has_elem(&mut self) -> bool {
        let data = *self.data.get_mut();
        !data.is_null() && data != Self::taken()
    }

    /// Attempts to store `data` in the node's empty payload slot.
    #[inline]
    fn try_claim(&self, data: NonNull<T>) -> bool {
        let (success, failure) = Self::ACQ_REL;
        self.data.compare_exchange(ptr::null_mut(), data.as_ptr(), success, failure).is_ok()
    }

    /// Attempts to append `next` as the node's successor, returning the
    /// already appended successor on failure.
    #[inline]
    fn try_append(&self, next: TaggedPtr<Node<T>>) -> Result<(), TaggedPtr<Node<T>>> {
        let (success, failure) = Self::ACQ_REL;
        self.next.compare_exchange(TaggedPtr::null(), next, success, failure).map(|_| ())
    }
}

/********** impl Counted **************************************************************************/

unsafe impl<T> Counted for Node<T> {
    #[inline]
    fn ref_count(&self) -> &RefCount {
        &self.ref_count
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for Node<T> {
    #[inline]
    fn drop(&mut self) {
        if self.has_elem() {
            // safety: an element still stored in a node being dropped was never popped
            unsafe { reclaim::dealloc(NonNull::new_unchecked(*self.data.get_mut())) };
        }
    }
}
