//! Core types shared by the lock state, registry and public API.
//!
//! - [`resource`]: the [`ResourceKey`] naming a protected repository
//! - [`mode`]: requested and active lock modes
//! - [`RequestId`]: per-mutex identifier for acquisition requests

pub mod mode;
pub mod resource;

pub use mode::{ActiveMode, LockMode};
pub use resource::ResourceKey;

use core::fmt;
use serde::Serialize;

/// Identifier assigned to every acquisition request.
///
/// Ids are allocated monotonically by a [`RepositoryMutex`](crate::RepositoryMutex)
/// and are only meaningful within that mutex. They are used to remove a
/// specific queued request and to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Creates an id from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}
