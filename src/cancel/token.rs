//! Listener-based cancellation token.
//!
//! Unlike a flag that waiters poll, a [`CancelToken`] runs its listeners
//! synchronously inside [`CancelToken::cancel`], in registration order. This
//! is what lets a queued lock request be removed from its queue at the moment
//! the token fires rather than whenever its future is next polled.
//!
//! # Example
//!
//! ```
//! use repo_mutex::CancelToken;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let token = CancelToken::new();
//! let fired = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&fired);
//! token.on_cancel(move || {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! assert!(token.cancel());
//! assert!(!token.cancel());
//! assert_eq!(fired.load(Ordering::SeqCst), 1);
//! ```

use core::fmt;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type Listener = Box<dyn FnOnce() + Send + 'static>;

/// Handle identifying a registered listener, used to deregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: SmallVec<[(ListenerId, Listener); 2]>,
}

#[derive(Default)]
struct TokenInner {
    /// Written only while `listeners` is locked.
    cancelled: AtomicBool,
    listeners: Mutex<Listeners>,
}

/// A cloneable cancellation signal.
///
/// Clones share state: cancelling any clone cancels all of them. Cancellation
/// is one-way and happens at most once.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Creates a token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once [`cancel`](Self::cancel) has been called on any clone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Fires the token.
    ///
    /// Runs every registered listener on the calling thread, in registration
    /// order, after the token's own lock has been released. Returns `false` if
    /// the token was already cancelled, in which case nothing runs.
    pub fn cancel(&self) -> bool {
        let entries = {
            let mut listeners = self.inner.listeners.lock();
            if self.inner.cancelled.swap(true, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut listeners.entries)
        };
        for (_, listener) in entries {
            listener();
        }
        true
    }

    /// Registers `listener` to run when the token fires.
    ///
    /// If the token is already cancelled the listener runs immediately on the
    /// calling thread and `None` is returned.
    pub fn on_cancel<F>(&self, listener: F) -> Option<ListenerId>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut listeners = self.inner.listeners.lock();
        if self.inner.cancelled.load(Ordering::Acquire) {
            drop(listeners);
            listener();
            return None;
        }
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners.entries.push((id, Box::new(listener)));
        drop(listeners);
        Some(id)
    }

    /// Deregisters a listener that has not run yet.
    ///
    /// Returns `false` if the listener already ran or was already removed.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let Some(pos) = listeners.entries.iter().position(|(lid, _)| *lid == id) else {
            return false;
        };
        // Order of the remaining listeners is observable through `cancel`.
        let removed = listeners.entries.remove(pos);
        drop(listeners);
        drop(removed);
        true
    }

    /// Returns the number of listeners waiting for the token to fire.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().entries.len()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
