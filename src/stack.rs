//! A lock-free LIFO stack.

use core::fmt;
use core::iter::FromIterator;
use core::mem::ManuallyDrop;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering::{self, AcqRel, Acquire, Relaxed, Release};

use crossbeam_utils::Backoff;

use crate::error::AllocError;
use crate::reclaim::{self, Counted, RefCount};
use crate::tagged::{AtomicTaggedPtr, TaggedPtr};

////////////////////////////////////////////////////////////////////////////////////////////////////
// Stack
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A concurrent unbounded lock-free multi-producer/multi-consumer LIFO stack.
///
/// The implementation is a Treiber stack, whose nodes are reclaimed through
/// split reference counting: every thread announces its intent to
/// de-reference the current head by increasing the head's external count
/// and a popped node is freed by whichever thread settles the last
/// outstanding reference to it, without any deferred garbage lists.
///
/// # Examples
///
/// ```
/// use conquer_split::Stack;
///
/// let stack = Stack::new();
/// stack.push(1);
/// stack.push(2);
///
/// assert_eq!(stack.pop(), Some(2));
/// assert_eq!(stack.pop(), Some(1));
/// assert_eq!(stack.pop(), None);
/// ```
pub struct Stack<T> {
    head: AtomicTaggedPtr<Node<T>>,
}

/********** impl Send + Sync **********************************************************************/

unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

/********** impl inherent *************************************************************************/

impl<T> Stack<T> {
    const POP_CAS: (Ordering, Ordering) = (AcqRel, Relaxed);

    /// Creates a new empty stack.
    #[inline]
    pub const fn new() -> Self {
        Self { head: AtomicTaggedPtr::null() }
    }

    /// Returns `true` if the stack was empty at the time of the call.
    ///
    /// With concurrent pushes or pops, the result may already be outdated
    /// when it is returned.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Acquire).is_null()
    }

    /// Pushes `elem` to the top of the stack.
    ///
    /// # Aborts
    ///
    /// Aborts the process if no memory can be allocated for the new node, as
    /// [`Box::new`] does.
    #[inline]
    pub fn push(&self, elem: T) {
        match reclaim::try_alloc(Node::new(elem)) {
            Ok(node) => self.push_node(node),
            Err(_) => reclaim::handle_alloc_error::<Node<T>>(),
        }
    }

    /// Pushes `elem` to the top of the stack or returns it inside an
    /// [`AllocError`] if no memory can be allocated for the new node.
    #[inline]
    pub fn try_push(&self, elem: T) -> Result<(), AllocError<T>> {
        match reclaim::try_alloc(Node::new(elem)) {
            Ok(node) => {
                self.push_node(node);
                Ok(())
            }
            Err(node) => {
                tracing::warn!("failed to allocate stack node");
                Err(AllocError(node.into_elem()))
            }
        }
    }

    /// Pops the element from the top of the stack or returns `None` if the
    /// stack is empty.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        let backoff = Backoff::new();
        let mut head = self.head.load(Relaxed);
        loop {
            head = reclaim::increase_external(&self.head, head);
            let node = head.as_non_null()?;
            // safety: the increased external count keeps the node alive and `next` is never
            // changed once a node is published
            let next = unsafe { node.as_ref().next };

            let (success, failure) = Self::POP_CAS;
            match self.head.compare_exchange(head, next, success, failure) {
                Ok(_) => unsafe {
                    // safety: only the thread that unlinked the node may take its element, which
                    // is never dropped as part of the node
                    let elem = ptr::read(&*node.as_ref().elem);
                    reclaim::free_external_counter(head);
                    return Some(elem);
                },
                Err(actual) => {
                    // safety: the reference to the node has not yet been settled
                    unsafe { reclaim::release_ref(node) };
                    head = actual;
                    backoff.spin();
                }
            }
        }
    }

    #[inline]
    fn push_node(&self, node: NonNull<Node<T>>) {
        let backoff = Backoff::new();
        let new_head = TaggedPtr::new(node, 1);
        let mut head = self.head.load(Relaxed);
        loop {
            // safety: the node only becomes visible to other threads if the subsequent CAS
            // succeeds, until then this thread has exclusive access
            unsafe { (*node.as_ptr()).next = head };
            match self.head.compare_exchange_weak(head, new_head, Release, Relaxed) {
                Ok(_) => return,
                Err(actual) => {
                    head = actual;
                    backoff.spin();
                }
            }
        }
    }
}

/********** impl Default **************************************************************************/

impl<T> Default for Stack<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for Stack<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stack").field("head", &self.head).finish()
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        let mut remaining = 0usize;
        let mut curr = self.head.get_mut().as_non_null();
        while let Some(node) = curr {
            // safety: exclusive access to the stack means all references to its nodes have been
            // settled, every node still linked contains an element
            unsafe {
                curr = node.as_ref().next.as_non_null();
                ManuallyDrop::drop(&mut (*node.as_ptr()).elem);
                reclaim::dealloc(node);
            }
            remaining += 1;
        }

        if remaining > 0 {
            tracing::debug!(remaining, "dropped stack with remaining elements");
        }
    }
}

/********** impl Extend ***************************************************************************/

impl<T> Extend<T> for Stack<T> {
    #[inline]
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for elem in iter {
            self.push(elem);
        }
    }
}

/********** impl FromIterator *********************************************************************/

impl<T> FromIterator<T> for Stack<T> {
    #[inline]
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut stack = Self::new();
        stack.extend(iter);
        stack
    }
}

/********** impl IntoIterator *********************************************************************/

impl<T> IntoIterator for Stack<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        IntoIter { stack: self }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// IntoIter
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An owning iterator over the elements of a [`Stack`], yielding them in
/// LIFO order.
#[derive(Debug)]
pub struct IntoIter<T> {
    stack: Stack<T>,
}

/********** impl Iterator *************************************************************************/

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.stack.pop()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Node
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A node type for storing a [`Stack`]'s individual elements.
struct Node<T> {
    /// The node's element, which is moved out by the thread popping the node
    /// and never dropped as part of the node itself.
    elem: ManuallyDrop<T>,
    /// The node's counters, only the head slot references a stack node.
    ref_count: RefCount,
    /// The node's next pointer, set once before the node is published.
    next: TaggedPtr<Node<T>>,
}

/********** impl inherent *************************************************************************/

impl<T> Node<T> {
    #[inline]
    fn new(elem: T) -> Self {
        Self { elem: ManuallyDrop::new(elem), ref_count: RefCount::new(1), next: TaggedPtr::null() }
    }

    #[inline]
    fn into_elem(self) -> T {
        ManuallyDrop::into_inner(self.elem)
    }
}

/********** impl Counted **************************************************************************/

unsafe impl<T> Counted for Node<T> {
    #[inline]
    fn ref_count(&self) -> &RefCount {
        &self.ref_count
    }
}
