//! Small, self-contained data structures backing the traversal engine.
//!
//! # Scope
//! `stdx` hosts narrow, allocation-light utilities tuned for predictable
//! memory use and fast paths rather than general-purpose ergonomics.
//!
//! # Module map
//! - `append_list`: concurrent-read, locked-write segmented vector with
//!   stable element addresses (the result list).
//! - `slab`: index-addressed store with O(1) free-slot recycling (the
//!   submit/complete engine's `statx` buffer table).
//! - `task_ring`: growable power-of-two ring buffer (per-runner task queue).
//!
//! # Safety
//! `append_list` and `task_ring` use `unsafe` internally and rely on
//! invariants called out in their module docs.

pub mod append_list;
pub mod slab;
pub mod task_ring;

pub use append_list::AppendList;
pub use slab::Slab;
pub use task_ring::TaskRing;
