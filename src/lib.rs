//! Lock-free concurrent containers: a hash map, a LIFO stack, and a FIFO
//! queue, all built on singly-linked nodes whose pointers are updated by
//! compare-and-swap.
//!
//! # The hash map
//!
//! [`HashMap`] keeps its entries in one hash-sorted linked list, cut into
//! buckets by sentinel "fence" nodes and routed through a directory of
//! `2^B` bucket pointers. The common write path — inserting a new entry or
//! updating an existing one — never takes an exclusive lock: it holds the
//! target bucket's reader/writer lock in *shared* mode and commits with a
//! single CAS, either on a chain pointer (insert) or on the entry's value
//! pointer (update). Removal and the split/merge reshaping that keeps
//! buckets short take the bucket's lock exclusively; growing and shrinking
//! the directory, and iteration, take the map's lock exclusively.
//!
//! Keys are hashed with SipHash-2-4 under two secret per-map subkeys via
//! the [`Key`] trait; each built-in key kind perturbs the subkeys so that,
//! for example, `16u8`, `16i8`, and `16u16` never collide by construction,
//! and a string never collides with its own bytes. Custom key types
//! implement [`Key`] directly.
//!
//! # A note on guards
//!
//! Reclaiming memory that another thread may still be reading is deferred
//! through [`crossbeam_epoch`]: operations take a [`Guard`] created by the
//! container's `guard()` method, and the references they return stay valid
//! until that guard is dropped — even for values that have since been
//! removed or replaced. The flip side is that a long-lived guard delays
//! reclamation of everything unlinked since it was pinned, so pin guards
//! for operations, not for program phases. [`HashMap::pin`] bundles a map
//! reference with a guard when threading one through calls is inconvenient.
//!
//! # The stack and the queue
//!
//! [`Stack`] and [`Queue`] share the same singly-linked node primitive and
//! the same reclamation discipline. Both are unbounded and never block:
//! contended operations retry their CAS. An empty container returns `None`
//! rather than an error.
//!
//! ```
//! use lockfree::{HashMap, Queue, Stack};
//!
//! let map = HashMap::new();
//! let guard = map.guard();
//! map.insert(1u32, "one", &guard);
//! assert_eq!(map.get(&1u32, &guard), Some(&"one"));
//!
//! let stack = Stack::new();
//! let guard = stack.guard();
//! stack.push(1, &guard);
//! assert_eq!(stack.peek(&guard), Some(&1));
//!
//! let queue = Queue::new();
//! let guard = queue.guard();
//! queue.enqueue(1, &guard);
//! assert_eq!(queue.dequeue(&guard), Some(&1));
//! ```
#![deny(missing_docs)]
#![warn(rust_2018_idioms, missing_debug_implementations)]

mod bucket;
mod iter;
mod key;
mod list;
mod map;
mod map_ref;
mod node;
mod queue;
mod stack;

#[cfg(feature = "serde")]
mod serde_impls;

pub use crate::iter::{Iter, Keys, Values};
pub use crate::key::Key;
pub use crate::map::HashMap;
pub use crate::map_ref::HashMapRef;
pub use crate::queue::Queue;
pub use crate::stack::Stack;

/// Guard type re-exported from [`crossbeam_epoch`]; see
/// [`HashMap::guard`], [`Stack::guard`], and [`Queue::guard`].
pub use crossbeam_epoch::Guard;
