//! Lock-free concurrent containers that reclaim their own nodes through split
//! reference counting.
//!
//! # Memory Reclamation without a Garbage Collector
//!
//! A lock-free container can not simply free a node once it has unlinked it:
//! other threads may have loaded a pointer to the same node just before and
//! might be about to de-reference it.
//! Schemes like hazard pointers or epoch based reclamation solve this by
//! deferring the de-allocation through a separate (thread-local or global)
//! registry.
//!
//! The containers in this crate instead track all references to a node
//! directly, without any additional infrastructure:
//!
//! - Every shared pointer slot (e.g. the head of a stack) stores a counter
//!   alongside the node's address and both are updated as one atomic unit.
//!   Before de-referencing a pointer loaded from such a slot, a thread
//!   increases this *external* count.
//! - Each node stores an *internal* count, into which threads that are done
//!   with the node deposit their (negative) credits, and the number of slots
//!   that may still hand out references to it.
//! - When a node is unlinked from a slot, the slot's external count is folded
//!   into the node's internal count.
//!   A node is freed by whichever thread brings both numbers down to zero.
//!
//! No operation ever blocks, but individual threads may have to retry their
//! operations under contention, i.e. all operations are lock-free, but not
//! wait-free.
//!
//! # Containers
//!
//! - [`Stack`]: a multi-producer/multi-consumer LIFO stack (Treiber stack)
//! - [`Queue`]: a multi-producer/multi-consumer FIFO queue with a permanent
//!   dummy node
//!
//! Both containers can be used from any number of threads, e.g. by wrapping
//! them in an [`Arc`](std::sync::Arc):
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! use conquer_split::Queue;
//!
//! let queue = Arc::new(Queue::new());
//! let handles: Vec<_> = (0..4)
//!     .map(|id| {
//!         let queue = Arc::clone(&queue);
//!         thread::spawn(move || queue.push(id))
//!     })
//!     .collect();
//!
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//!
//! let mut popped: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
//! popped.sort();
//! assert_eq!(popped, [0, 1, 2, 3]);
//! ```
//!
//! # Features
//!
//! The `std` feature is enabled by default and must be disabled for use in
//! `no_std` crates, which still require the `alloc` crate.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]

#[cfg(not(feature = "std"))]
extern crate alloc;

mod error;
#[cfg(test)]
mod failing_alloc;
mod reclaim;
mod tagged;

pub mod queue;
pub mod stack;

pub use crate::error::AllocError;
pub use crate::queue::Queue;
pub use crate::stack::Stack;
