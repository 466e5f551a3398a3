//! Repository locking.
//!
//! # Layers
//!
//! - `state`: per-key holder counts and the FIFO wait queue (synchronous)
//! - `registry`: key map with lazy creation and eager reclamation
//! - `slot`: completion cell linking a queued request to its future
//! - [`RepositoryMutex`]: the async API built on the above
//!
//! Every transition happens under one registry mutex; wakers and cancel
//! listeners always run after it is released.

mod registry;
mod repo_mutex;
mod slot;
mod state;

pub use repo_mutex::{Acquire, LockGuard, LockSnapshot, QueuedRequest, RepositoryMutex};
