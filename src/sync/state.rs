//! Per-key holder bookkeeping and the wait-queue scheduler.
//!
//! [`LockState`] is purely synchronous: it never wakes anyone and never
//! blocks. The registry performs every transition under its mutex and hands
//! the requests returned by [`LockState::drain`] back to the caller, which
//! wakes them after the mutex is released.
//!
//! # Scheduling rules
//!
//! | Request   | Granted immediately iff                        |
//! |-----------|------------------------------------------------|
//! | Shared    | queue empty and no exclusive holder            |
//! | Exclusive | queue empty and no holder at all               |
//!
//! When the last holder leaves, the head of the queue decides: an exclusive
//! head is granted alone; a shared head is granted together with every shared
//! request directly behind it, up to the next exclusive request.
//!
//! Requiring an empty queue for an immediate shared grant is what prevents
//! writer starvation: once anything waits, later arrivals of either mode
//! queue behind it in arrival order.

use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::ContractViolation;
use crate::types::{ActiveMode, LockMode, RequestId};

/// A request waiting in a key's queue.
///
/// `W` is whatever the owner needs to notify the caller once the request is
/// resolved.
#[derive(Debug)]
pub(crate) struct PendingRequest<W> {
    pub(crate) id: RequestId,
    pub(crate) mode: LockMode,
    pub(crate) label: Arc<str>,
    pub(crate) waiter: W,
}

/// Batch of requests granted by one drain. Shared cohorts are usually small.
pub(crate) type Granted<W> = SmallVec<[PendingRequest<W>; 4]>;

#[derive(Debug)]
pub(crate) struct LockState<W> {
    active: ActiveMode,
    shared_count: usize,
    queue: VecDeque<PendingRequest<W>>,
    /// Reserved on the first enqueue; uncontended keys never allocate.
    queue_capacity: usize,
}

impl<W> LockState<W> {
    pub(crate) fn new(queue_capacity: usize) -> Self {
        Self {
            active: ActiveMode::None,
            shared_count: 0,
            queue: VecDeque::new(),
            queue_capacity,
        }
    }

    #[inline]
    pub(crate) fn active(&self) -> ActiveMode {
        self.active
    }

    #[inline]
    pub(crate) fn shared_count(&self) -> usize {
        self.shared_count
    }

    #[inline]
    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn queued(&self) -> impl Iterator<Item = &PendingRequest<W>> {
        self.queue.iter()
    }

    /// Holder-less with nothing queued; the registry may drop this state.
    #[inline]
    pub(crate) fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }

    /// Returns true if a new `mode` request may be granted without queueing.
    #[inline]
    pub(crate) fn can_grant(&self, mode: LockMode) -> bool {
        if !self.queue.is_empty() {
            return false;
        }
        match mode {
            LockMode::Shared => self.active != ActiveMode::Exclusive,
            LockMode::Exclusive => self.active.is_none(),
        }
    }

    /// Records a new holder. Callers check [`can_grant`](Self::can_grant)
    /// first, or are granting from the queue head during a drain.
    fn hold(&mut self, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                debug_assert_ne!(self.active, ActiveMode::Exclusive);
                self.active = ActiveMode::Shared;
                self.shared_count += 1;
            }
            LockMode::Exclusive => {
                debug_assert!(self.active.is_none());
                self.active = ActiveMode::Exclusive;
            }
        }
        debug_assert!(self.invariants_hold());
    }

    /// Grants `mode` immediately if the scheduling rules allow it.
    pub(crate) fn try_hold(&mut self, mode: LockMode) -> bool {
        if self.can_grant(mode) {
            self.hold(mode);
            true
        } else {
            false
        }
    }

    /// Appends a request at the tail and returns its queue position.
    pub(crate) fn enqueue(&mut self, request: PendingRequest<W>) -> usize {
        if self.queue.capacity() == 0 {
            self.queue.reserve(self.queue_capacity);
        }
        self.queue.push_back(request);
        self.queue.len() - 1
    }

    /// Removes a queued request, wherever it sits, keeping the others in order.
    pub(crate) fn remove(&mut self, id: RequestId) -> Option<PendingRequest<W>> {
        let pos = self.queue.iter().position(|r| r.id == id)?;
        self.queue.remove(pos)
    }

    /// Clears one holder of `mode`.
    ///
    /// On success the caller should [`drain`](Self::drain). A release that
    /// does not match the current holders leaves the state untouched.
    pub(crate) fn release(&mut self, mode: LockMode) -> Result<(), ContractViolation> {
        match (mode, self.active) {
            (LockMode::Shared, ActiveMode::Shared) if self.shared_count > 0 => {
                self.shared_count -= 1;
                if self.shared_count == 0 {
                    self.active = ActiveMode::None;
                }
            }
            (LockMode::Exclusive, ActiveMode::Exclusive) => {
                self.active = ActiveMode::None;
            }
            _ => {
                return Err(ContractViolation {
                    released: mode,
                    shared_count: self.shared_count,
                    exclusive_held: self.active == ActiveMode::Exclusive,
                });
            }
        }
        debug_assert!(self.invariants_hold());
        Ok(())
    }

    /// Grants as many head-of-queue requests as the rules allow.
    ///
    /// Does nothing while any holder remains. The returned requests already
    /// count as holders.
    pub(crate) fn drain(&mut self) -> Granted<W> {
        let mut granted = Granted::new();
        if !self.active.is_none() {
            return granted;
        }

        let Some(head) = self.queue.pop_front() else {
            return granted;
        };
        self.hold(head.mode);
        let cohort = head.mode.is_shared();
        granted.push(head);

        if cohort {
            while self.queue.front().is_some_and(|r| r.mode.is_shared()) {
                let Some(next) = self.queue.pop_front() else {
                    break;
                };
                self.hold(LockMode::Shared);
                granted.push(next);
            }
        }
        granted
    }

    pub(crate) fn invariants_hold(&self) -> bool {
        match self.active {
            ActiveMode::None | ActiveMode::Exclusive => self.shared_count == 0,
            ActiveMode::Shared => self.shared_count > 0,
        }
    }
}
