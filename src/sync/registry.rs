//! Lazily created, eagerly reclaimed map from resource key to lock state.
//!
//! An entry exists only while its key has a holder or a queued request, so
//! memory tracks the number of currently contended repositories rather than
//! every repository ever locked.

use std::collections::HashMap;

use crate::error::ContractViolation;
use crate::sync::state::{Granted, LockState, PendingRequest};
use crate::tracing_compat::debug;
use crate::types::{LockMode, RequestId, ResourceKey};

#[derive(Debug)]
pub(crate) struct Registry<W> {
    keys: HashMap<ResourceKey, LockState<W>>,
    next_request_id: u64,
    queue_capacity: usize,
}

impl<W> Registry<W> {
    pub(crate) fn new(queue_capacity: usize) -> Self {
        Self {
            keys: HashMap::new(),
            next_request_id: 0,
            queue_capacity,
        }
    }

    pub(crate) fn next_request_id(&mut self) -> RequestId {
        let id = RequestId::new(self.next_request_id);
        self.next_request_id += 1;
        id
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn get(&self, key: &str) -> Option<&LockState<W>> {
        self.keys.get(key)
    }

    pub(crate) fn get_or_create(&mut self, key: &ResourceKey) -> &mut LockState<W> {
        let capacity = self.queue_capacity;
        self.keys.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, "tracking repository lock");
            LockState::new(capacity)
        })
    }

    /// Drops the entry for `key` if it is idle. Returns true if removed.
    pub(crate) fn reclaim_if_idle(&mut self, key: &str) -> bool {
        if self.keys.get(key).is_some_and(LockState::is_idle) {
            self.keys.remove(key);
            debug!(key = %key, "reclaimed idle repository lock");
            true
        } else {
            false
        }
    }

    /// Grants `mode` on `key` without queueing, if the rules allow it.
    ///
    /// A refused grant leaves no entry behind.
    pub(crate) fn try_hold(&mut self, key: &ResourceKey, mode: LockMode) -> bool {
        if let Some(state) = self.keys.get_mut(key.as_str()) {
            return state.try_hold(mode);
        }
        self.get_or_create(key).try_hold(mode)
    }

    /// Queues a request on `key` and returns its position.
    pub(crate) fn enqueue(&mut self, key: &ResourceKey, request: PendingRequest<W>) -> usize {
        self.get_or_create(key).enqueue(request)
    }

    /// Releases one `mode` holder of `key` and drains its queue.
    pub(crate) fn release(
        &mut self,
        key: &str,
        mode: LockMode,
    ) -> Result<Granted<W>, ContractViolation> {
        let Some(state) = self.keys.get_mut(key) else {
            return Err(ContractViolation {
                released: mode,
                shared_count: 0,
                exclusive_held: false,
            });
        };
        state.release(mode)?;
        let granted = state.drain();
        self.reclaim_if_idle(key);
        Ok(granted)
    }

    /// Withdraws a queued request.
    ///
    /// Returns the request if it was still queued; `None` if it had already
    /// been granted or withdrawn. Requests behind it keep their order and are
    /// not promoted unless the key has no holder.
    pub(crate) fn withdraw(
        &mut self,
        key: &str,
        id: RequestId,
    ) -> Option<(PendingRequest<W>, Granted<W>)> {
        let state = self.keys.get_mut(key)?;
        let request = state.remove(id)?;
        let granted = state.drain();
        self.reclaim_if_idle(key);
        Some((request, granted))
    }
}
