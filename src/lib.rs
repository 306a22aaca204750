//! Cooperative coordination primitives for async tasks.
//!
//! This crate provides containers whose take and put operations suspend
//! the calling task instead of blocking a thread, and per-key lock
//! registries that materialise lock state on demand:
//!
//! - [`Stack`] — unbounded LIFO container with suspending pop.
//! - [`Queue`] — unbounded FIFO container with suspending dequeue.
//! - [`BoundedQueue`] — bounded FIFO container with producer
//!   backpressure; capacity zero degenerates to a rendezvous point.
//! - [`LockMap`] — per-key mutual exclusion.
//! - [`RwLockMap`] — per-key reader/writer locks with upgradeable
//!   readers.
//!
//! All primitives share two mechanisms. The containers keep a FIFO wait
//! queue of suspended callers under the same mutex as their storage, so a
//! value is either stored or handed to the longest-waiting caller but
//! never both; waiters are resumed only after that mutex is released. The
//! lock maps keep a reference-counted registry of per-key async locks, so
//! an entry exists exactly while some task holds or awaits its key.
//!
//! Every suspending operation takes a
//! [`CancellationToken`](tokio_util::sync::CancellationToken): a
//! pre-triggered token short-circuits before any state changes, and a
//! token that fires mid-wait withdraws the caller without disturbing its
//! neighbours. A cancellation that loses the race against a matching
//! counterpart is ignored and the operation succeeds.
//!
//! ```
//! use syncpoint::Queue;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let queue = Queue::new();
//! queue.enqueue("job");
//! assert_eq!(queue.dequeue(CancellationToken::new()).await, Ok("job"));
//! # }
//! ```

mod bounded;
mod error;
pub mod keyed;
mod queue;
mod stack;
mod wait_queue;

pub use bounded::BoundedQueue;
pub use error::{WaitError, WaitResult};
pub use keyed::lock_map::{KeyGuard, LockMap};
pub use keyed::rw_lock_map::{
    ReadKeyGuard, RwLockMap, UpgradableKeyGuard, UpgradedKeyGuard, WriteKeyGuard,
};
pub use queue::Queue;
pub use stack::Stack;
pub use wait_queue::Broadcast;
