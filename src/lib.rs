//! Per-repository async readers-writer locks for backup orchestration.
//!
//! A backup service runs many operations against the same repositories:
//! backups and integrity checks can share a repository, while configuration
//! edits, pruning and restores need it alone. [`RepositoryMutex`] provides one
//! readers-writer lock per [`ResourceKey`] with:
//!
//! - writer-priority FIFO fairness: once anything is queued, new arrivals
//!   queue behind it, so writers are never starved by a stream of readers
//! - shared cohorts: when a reader reaches the head of the queue, every
//!   reader directly behind it is granted with it
//! - prompt cancellation: firing a [`CancelToken`] removes the queued request
//!   right away, without disturbing the order of the others
//! - bounded memory: keys are tracked only while held or contended
//!
//! The futures returned here are runtime-agnostic; they only rely on
//! [`Waker`](std::task::Waker).
//!
//! # Example
//!
//! ```
//! use repo_mutex::{LockMode, RepositoryMutex};
//! # futures_lite::future::block_on(async {
//! let locks = RepositoryMutex::new();
//!
//! let guard = locks.acquire("repo-1", "prune", LockMode::Exclusive, None).await?;
//! assert!(locks.try_acquire_shared("repo-1", "backup").is_err());
//! guard.release();
//!
//! let stats = locks
//!     .with_shared("repo-1", "check", || async { 42 })
//!     .await?;
//! assert_eq!(stats, 42);
//! # Ok::<(), repo_mutex::Error>(())
//! # }).unwrap();
//! ```
//!
//! # Module Structure
//!
//! - [`sync`]: the lock itself
//! - [`cancel`]: listener-based cancellation tokens
//! - [`types`]: keys, modes and request ids
//! - [`error`]: error types
//! - [`config`]: configuration and environment overrides

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cancel;
pub mod config;
pub mod error;
pub mod sync;
pub mod tracing_compat;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use cancel::{CancelToken, ListenerId};
pub use config::{ConfigError, MutexConfig, ViolationPolicy};
pub use error::{Error, ErrorKind, Recoverability, Result, TryAcquireError};
pub use sync::{Acquire, LockGuard, LockSnapshot, QueuedRequest, RepositoryMutex};
pub use types::{ActiveMode, LockMode, RequestId, ResourceKey};
