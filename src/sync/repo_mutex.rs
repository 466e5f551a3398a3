//! Per-repository readers-writer lock.
//!
//! [`RepositoryMutex`] serializes operations against the same repository
//! (backup, restore, mirror copy, integrity check, configuration edit) while
//! letting compatible operations run together. Each [`ResourceKey`] has an
//! independent lock; keys are tracked only while held or contended.
//!
//! # Fairness
//!
//! | Scenario                         | Behavior                                    |
//! |----------------------------------|---------------------------------------------|
//! | Key idle                         | Any request is granted immediately          |
//! | Shared holders, nothing queued   | Shared granted immediately; exclusive queues|
//! | Anything queued                  | Every new request queues, in arrival order  |
//! | Last holder leaves, writer first | The writer is granted alone                 |
//! | Last holder leaves, reader first | Readers up to the next writer are granted   |
//!
//! Exclusive requests are granted in strict arrival order, and a shared
//! request never overtakes an exclusive request that arrived before it.
//!
//! # Cancel Safety
//!
//! - A request takes its place when `acquire*` is called, not when the
//!   returned future is first polled.
//! - Firing the request's [`CancelToken`] while it is queued removes it from
//!   the queue immediately and resolves the future with
//!   [`ErrorKind::Cancelled`](crate::error::ErrorKind::Cancelled). Other queued
//!   requests keep their positions.
//! - Dropping a pending future withdraws the request the same way. If the
//!   request had already been granted, the grant is released.
//! - Granted guards are never revoked; they release when dropped or when
//!   [`LockGuard::release`] is called.
//!
//! # Example
//!
//! ```
//! use repo_mutex::{CancelToken, RepositoryMutex};
//! # futures_lite::future::block_on(async {
//! let locks = RepositoryMutex::new();
//!
//! let backup = locks.acquire_shared("repo-1", "backup").await?;
//! let check = locks.acquire_shared("repo-1", "check").await?;
//!
//! let token = CancelToken::new();
//! let edit = locks.acquire_exclusive("repo-1", "edit-config", Some(&token));
//! assert_eq!(locks.queue_len("repo-1"), 1);
//!
//! token.cancel();
//! assert!(edit.await.unwrap_err().is_cancelled());
//!
//! drop((backup, check));
//! assert!(!locks.is_tracked("repo-1"));
//! # Ok::<(), repo_mutex::Error>(())
//! # }).unwrap();
//! ```

use core::fmt;
use parking_lot::Mutex;
use serde::Serialize;
use smallvec::SmallVec;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use crate::cancel::{CancelToken, ListenerId};
use crate::config::{MutexConfig, ViolationPolicy};
use crate::error::{ContractViolation, Error, Result, TryAcquireError};
use crate::sync::registry::Registry;
use crate::sync::slot::{Resolution, WaitSlot};
use crate::sync::state::{Granted, PendingRequest};
use crate::tracing_compat::{debug, debug_span, error, trace, warn};
use crate::types::{ActiveMode, LockMode, RequestId, ResourceKey};

type SlotRegistry = Registry<Arc<WaitSlot>>;

struct Shared {
    registry: Mutex<SlotRegistry>,
    config: MutexConfig,
}

impl Shared {
    /// Releases one holder and wakes whatever the drain granted.
    fn release(&self, key: &ResourceKey, mode: LockMode, id: RequestId, label: &str) {
        let result = {
            let mut registry = self.registry.lock();
            registry
                .release(key.as_str(), mode)
                .map(|granted| resolve_granted(key, granted))
        };
        match result {
            Ok(wakers) => {
                trace!(key = %key, label = %label, request_id = %id, mode = %mode, "repository lock released");
                wake_all(wakers);
            }
            Err(violation) => self.on_violation(key, label, id, violation),
        }
    }

    fn on_violation(&self, key: &ResourceKey, label: &str, id: RequestId, violation: ContractViolation) {
        match self.config.violation_policy {
            ViolationPolicy::Warn => {
                warn!(key = %key, label = %label, request_id = %id, %violation, "ignoring release of lock not held");
            }
            ViolationPolicy::Panic if std::thread::panicking() => {
                error!(key = %key, label = %label, request_id = %id, %violation, "release of lock not held during unwind");
            }
            ViolationPolicy::Panic => {
                panic!("repository lock {key}: {violation} (request {id}, label {label:?})");
            }
        }
    }

    /// Withdraws a queued request and rejects its future.
    ///
    /// Returns false if the request was no longer queued.
    fn withdraw(&self, key: &ResourceKey, id: RequestId) -> bool {
        let _span = debug_span!("lock_request_withdraw", key = %key, request_id = %id).entered();
        let wakers = {
            let mut registry = self.registry.lock();
            let Some((request, granted)) = registry.withdraw(key.as_str(), id) else {
                return false;
            };
            debug!(key = %key, label = %request.label, request_id = %id, mode = %request.mode, "queued lock request cancelled");
            let mut wakers = resolve_granted(key, granted);
            wakers.extend(request.waiter.reject());
            wakers
        };
        wake_all(wakers);
        true
    }
}

type Wakers = SmallVec<[Waker; 4]>;

/// Marks drained requests granted. Called with the registry lock held, so a
/// request is never observed as dequeued but unresolved.
fn resolve_granted(key: &ResourceKey, granted: Granted<Arc<WaitSlot>>) -> Wakers {
    granted
        .iter()
        .filter_map(|request| {
            trace!(key = %key, label = %request.label, request_id = %request.id, mode = %request.mode, "queued lock request granted");
            request.waiter.grant()
        })
        .collect()
}

fn wake_all(wakers: Wakers) {
    for waker in wakers {
        waker.wake();
    }
}

/// A registry of per-repository readers-writer locks.
///
/// Cloning is cheap; clones share the same locks.
#[derive(Clone)]
pub struct RepositoryMutex {
    shared: Arc<Shared>,
}

impl RepositoryMutex {
    /// Creates a mutex with the default [`MutexConfig`].
    #[must_use]
    pub fn new() -> Self {
        Self::from_valid_config(MutexConfig::default())
    }

    /// Creates a mutex with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfig`](crate::error::ErrorKind::InvalidConfig)
    /// if the configuration fails validation.
    pub fn with_config(config: MutexConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    fn from_valid_config(config: MutexConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::new(config.queue_capacity)),
                config,
            }),
        }
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &MutexConfig {
        &self.shared.config
    }

    /// Requests shared access to `key`.
    pub fn acquire_shared(&self, key: impl Into<ResourceKey>, label: &str) -> Acquire {
        self.acquire(key, label, LockMode::Shared, None)
    }

    /// Requests shared access to `key`, withdrawable through `token`.
    pub fn acquire_shared_with_cancel(
        &self,
        key: impl Into<ResourceKey>,
        label: &str,
        token: &CancelToken,
    ) -> Acquire {
        self.acquire(key, label, LockMode::Shared, Some(token))
    }

    /// Requests exclusive access to `key`.
    ///
    /// If `token` is already cancelled the future fails immediately and
    /// nothing is registered.
    pub fn acquire_exclusive(
        &self,
        key: impl Into<ResourceKey>,
        label: &str,
        token: Option<&CancelToken>,
    ) -> Acquire {
        self.acquire(key, label, LockMode::Exclusive, token)
    }

    /// Requests `mode` access to `key`.
    ///
    /// The request is granted or queued before this method returns; the
    /// future resolves once it is granted, or fails with
    /// [`ErrorKind::Cancelled`](crate::error::ErrorKind::Cancelled) if `token`
    /// fires first.
    pub fn acquire(
        &self,
        key: impl Into<ResourceKey>,
        label: &str,
        mode: LockMode,
        token: Option<&CancelToken>,
    ) -> Acquire {
        let key = key.into();
        let label: Arc<str> = Arc::from(label);

        if token.is_some_and(CancelToken::is_cancelled) {
            debug!(key = %key, label = %label, mode = %mode, "lock request cancelled before queueing");
            let err = Error::cancelled(&key, &label, mode);
            return self.ready(key, label, mode, Err(err));
        }

        let slot = Arc::new(WaitSlot::new());
        let (id, position) = {
            let mut registry = self.shared.registry.lock();
            let id = registry.next_request_id();
            if registry.try_hold(&key, mode) {
                (id, None)
            } else {
                let position = registry.enqueue(
                    &key,
                    PendingRequest {
                        id,
                        mode,
                        label: Arc::clone(&label),
                        waiter: Arc::clone(&slot),
                    },
                );
                (id, Some(position))
            }
        };

        let Some(position) = position else {
            trace!(key = %key, label = %label, request_id = %id, mode = %mode, "repository lock granted immediately");
            let guard = self.guard(key.clone(), Arc::clone(&label), mode, id);
            return self.ready(key, label, mode, Ok(guard));
        };
        trace!(key = %key, label = %label, request_id = %id, mode = %mode, position, "repository lock request queued");

        // Registered after the registry lock is dropped: a token fired in the
        // meantime runs the listener inline, which takes that lock.
        let token = token.cloned();
        let listener = token.as_ref().and_then(|token| {
            let weak: Weak<Shared> = Arc::downgrade(&self.shared);
            let listener_key = key.clone();
            token.on_cancel(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.withdraw(&listener_key, id);
                }
            })
        });

        Acquire {
            shared: Arc::clone(&self.shared),
            key,
            label,
            mode,
            state: AcquireState::Queued {
                id,
                slot,
                token,
                listener,
            },
        }
    }

    /// Grants shared access to `key` only if that is possible without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TryAcquireError::WouldBlock`] if an exclusive holder exists or
    /// any request is queued.
    pub fn try_acquire_shared(
        &self,
        key: impl Into<ResourceKey>,
        label: &str,
    ) -> core::result::Result<LockGuard, TryAcquireError> {
        self.try_acquire(key.into(), label, LockMode::Shared)
    }

    /// Grants exclusive access to `key` only if that is possible without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TryAcquireError::WouldBlock`] if the key has any holder or any
    /// queued request.
    pub fn try_acquire_exclusive(
        &self,
        key: impl Into<ResourceKey>,
        label: &str,
    ) -> core::result::Result<LockGuard, TryAcquireError> {
        self.try_acquire(key.into(), label, LockMode::Exclusive)
    }

    fn try_acquire(
        &self,
        key: ResourceKey,
        label: &str,
        mode: LockMode,
    ) -> core::result::Result<LockGuard, TryAcquireError> {
        let id = {
            let mut registry = self.shared.registry.lock();
            if !registry.try_hold(&key, mode) {
                return Err(TryAcquireError::WouldBlock);
            }
            registry.next_request_id()
        };
        trace!(key = %key, label = %label, request_id = %id, mode = %mode, "repository lock granted immediately");
        Ok(self.guard(key, Arc::from(label), mode, id))
    }

    fn ready(
        &self,
        key: ResourceKey,
        label: Arc<str>,
        mode: LockMode,
        result: Result<LockGuard>,
    ) -> Acquire {
        Acquire {
            shared: Arc::clone(&self.shared),
            key,
            label,
            mode,
            state: AcquireState::Ready(Some(result)),
        }
    }

    fn guard(&self, key: ResourceKey, label: Arc<str>, mode: LockMode, id: RequestId) -> LockGuard {
        LockGuard {
            shared: Arc::clone(&self.shared),
            key,
            label,
            mode,
            id,
        }
    }

    /// Runs `f` while holding shared access to `key`.
    ///
    /// The lock is released on every exit path, including when the returned
    /// future is dropped early.
    ///
    /// # Errors
    ///
    /// Never fails today; the `Result` mirrors
    /// [`with_exclusive`](Self::with_exclusive).
    pub async fn with_shared<F, Fut, T>(&self, key: impl Into<ResourceKey>, label: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire_shared(key, label).await?;
        let out = f().await;
        guard.release();
        Ok(out)
    }

    /// Runs `f` while holding exclusive access to `key`.
    ///
    /// The lock is released on every exit path, including when the returned
    /// future is dropped early.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Cancelled`](crate::error::ErrorKind::Cancelled) if
    /// `token` fires before the lock is granted; `f` is not run.
    pub async fn with_exclusive<F, Fut, T>(
        &self,
        key: impl Into<ResourceKey>,
        label: &str,
        token: Option<&CancelToken>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire_exclusive(key, label, token).await?;
        let out = f().await;
        guard.release();
        Ok(out)
    }

    /// Returns the number of keys currently held or contended.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Returns true if `key` is currently held or contended.
    #[must_use]
    pub fn is_tracked(&self, key: &str) -> bool {
        self.shared.registry.lock().get(key).is_some()
    }

    /// Returns the number of requests queued on `key`.
    #[must_use]
    pub fn queue_len(&self, key: &str) -> usize {
        self.shared
            .registry
            .lock()
            .get(key)
            .map_or(0, |state| state.queue_len())
    }

    /// Returns the holder and queue state of `key`, or `None` if untracked.
    #[must_use]
    pub fn snapshot(&self, key: &str) -> Option<LockSnapshot> {
        let registry = self.shared.registry.lock();
        let state = registry.get(key)?;
        Some(LockSnapshot {
            key: ResourceKey::from(key),
            active: state.active(),
            shared_count: state.shared_count(),
            queued: state
                .queued()
                .map(|r| QueuedRequest {
                    request_id: r.id,
                    mode: r.mode,
                    label: r.label.to_string(),
                })
                .collect(),
        })
    }
}

impl Default for RepositoryMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RepositoryMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryMutex")
            .field("tracked_keys", &self.tracked_keys())
            .field("config", &self.shared.config)
            .finish()
    }
}

/// Point-in-time view of one key, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockSnapshot {
    /// The key described.
    pub key: ResourceKey,
    /// Mode currently held.
    pub active: ActiveMode,
    /// Number of shared holders.
    pub shared_count: usize,
    /// Queued requests, head first.
    pub queued: Vec<QueuedRequest>,
}

/// A queued request as seen by [`RepositoryMutex::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedRequest {
    /// Request id.
    pub request_id: RequestId,
    /// Requested mode.
    pub mode: LockMode,
    /// Diagnostic label.
    pub label: String,
}

enum AcquireState {
    Ready(Option<Result<LockGuard>>),
    Queued {
        id: RequestId,
        slot: Arc<WaitSlot>,
        token: Option<CancelToken>,
        listener: Option<ListenerId>,
    },
    Done,
}

/// Future returned by the `acquire*` methods of [`RepositoryMutex`].
#[must_use = "dropping the future withdraws the lock request"]
pub struct Acquire {
    shared: Arc<Shared>,
    key: ResourceKey,
    label: Arc<str>,
    mode: LockMode,
    state: AcquireState,
}

impl Acquire {
    /// Returns the request id, once the request has been registered.
    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        match &self.state {
            AcquireState::Queued { id, .. } => Some(*id),
            AcquireState::Ready(Some(Ok(guard))) => Some(guard.id),
            AcquireState::Ready(_) | AcquireState::Done => None,
        }
    }

    /// Returns true if the request is waiting in a queue.
    #[must_use]
    pub fn is_queued(&self) -> bool {
        matches!(self.state, AcquireState::Queued { .. })
    }
}

impl Future for Acquire {
    type Output = Result<LockGuard>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let resolution = match &mut this.state {
            AcquireState::Ready(result) => {
                let result = result.take();
                this.state = AcquireState::Done;
                return match result {
                    Some(result) => Poll::Ready(result),
                    None => Poll::Pending,
                };
            }
            AcquireState::Queued { slot, .. } => match slot.poll(cx.waker()) {
                Poll::Ready(resolution) => resolution,
                Poll::Pending => return Poll::Pending,
            },
            AcquireState::Done => {
                debug_assert!(false, "Acquire polled after completion");
                return Poll::Pending;
            }
        };

        let AcquireState::Queued {
            id, token, listener, ..
        } = std::mem::replace(&mut this.state, AcquireState::Done)
        else {
            return Poll::Pending;
        };
        if let (Some(token), Some(listener)) = (token, listener) {
            token.remove_listener(listener);
        }

        Poll::Ready(match resolution {
            Resolution::Granted => Ok(LockGuard {
                shared: Arc::clone(&this.shared),
                key: this.key.clone(),
                label: Arc::clone(&this.label),
                mode: this.mode,
                id,
            }),
            Resolution::Rejected => {
                Err(Error::cancelled(&this.key, &this.label, this.mode).with_request_id(id))
            }
        })
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        let AcquireState::Queued {
            id,
            slot,
            token,
            listener,
        } = std::mem::replace(&mut self.state, AcquireState::Done)
        else {
            // A ready guard, if any, releases through its own drop.
            return;
        };
        if let (Some(token), Some(listener)) = (token, listener) {
            token.remove_listener(listener);
        }

        let (wakers, unclaimed) = {
            let mut registry = self.shared.registry.lock();
            match registry.withdraw(self.key.as_str(), id) {
                Some((_request, granted)) => {
                    debug!(key = %self.key, label = %self.label, request_id = %id, mode = %self.mode, "queued lock request dropped");
                    (resolve_granted(&self.key, granted), None)
                }
                // No longer queued: rejected, or granted without being observed.
                None => (Wakers::new(), slot.take()),
            }
        };
        wake_all(wakers);
        if unclaimed == Some(Resolution::Granted) {
            trace!(key = %self.key, label = %self.label, request_id = %id, "releasing grant of dropped lock request");
            self.shared.release(&self.key, self.mode, id, &self.label);
        }
    }
}

/// Proof of holding a repository lock.
///
/// The lock is released when the guard is dropped or
/// [`released`](LockGuard::release) explicitly.
#[must_use = "guard will be immediately released if not held"]
pub struct LockGuard {
    shared: Arc<Shared>,
    key: ResourceKey,
    label: Arc<str>,
    mode: LockMode,
    id: RequestId,
}

impl LockGuard {
    /// The locked key.
    #[must_use]
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// The held mode.
    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// The diagnostic label given at acquisition.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The id of the request this guard was granted for.
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    /// Releases the lock now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.shared.release(&self.key, self.mode, self.id, &self.label);
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("label", &self.label)
            .field("request_id", &self.id)
            .finish()
    }
}
