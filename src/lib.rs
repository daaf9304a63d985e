//! Concurrent `du`: recursive directory sizes over two traversal engines.
//!
//! The core is a streaming tree walker that keeps many filesystem
//! operations in flight, propagates partial file sizes toward their
//! ancestors while the descent is still running, and terminates exactly
//! when the root's subtree is fully accounted for. Two backends implement
//! the same protocol:
//! - `traversal::uring`: a single thread driving an io_uring submission
//!   queue (`openat`/`statx`/`close` in flight together).
//! - `traversal::threaded`: a work-stealing pool of workers issuing
//!   synchronous syscalls.
//!
//! Flow: root task -> directory listing (`getdents64`) -> child records in
//! the append list -> child tasks -> completion cascade up the parent
//! chain -> the printer walks the finished list in creation order.
//!
//! Result records live in `stdx::AppendList` (stable addresses, wait-free
//! reads); their path strings live in per-worker bump arenas donated to the
//! traversal at worker shutdown.

pub mod arena;
pub mod errors;
pub mod output;
pub mod pool;
pub mod record;
pub mod stdx;
pub mod traversal;

pub use errors::TreeErrorKind;
pub use record::{Node, NodeState, ROOT_INDEX};
pub use traversal::threaded::{default_workers, ThreadedConfig};
pub use traversal::{Progress, Traversal};
#[cfg(target_os = "linux")]
pub use traversal::uring::UringConfig;
