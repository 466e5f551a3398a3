//! Completion slot shared between a queued request and its future.
//!
//! The registry resolves the slot (grant or reject) while holding its mutex;
//! the future only ever touches the slot. Lock order is always
//! registry, then slot.

use parking_lot::Mutex;
use std::task::{Poll, Waker};

#[derive(Debug)]
enum SlotState {
    Waiting(Option<Waker>),
    Granted,
    Rejected,
    /// The future has observed the outcome.
    Consumed,
}

/// Outcome observed by the waiting future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Granted,
    Rejected,
}

#[derive(Debug)]
pub(crate) struct WaitSlot {
    state: Mutex<SlotState>,
}

impl WaitSlot {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Waiting(None)),
        }
    }

    /// Marks the request granted and returns the waker to notify.
    pub(crate) fn grant(&self) -> Option<Waker> {
        self.resolve(SlotState::Granted)
    }

    /// Marks the request rejected and returns the waker to notify.
    pub(crate) fn reject(&self) -> Option<Waker> {
        self.resolve(SlotState::Rejected)
    }

    fn resolve(&self, outcome: SlotState) -> Option<Waker> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, outcome) {
            SlotState::Waiting(waker) => waker,
            previous => {
                // Resolved exactly once; keep the first outcome.
                debug_assert!(false, "wait slot resolved twice: {previous:?}");
                *state = previous;
                None
            }
        }
    }

    /// Consumes an unobserved outcome without a waker, if there is one.
    pub(crate) fn take(&self) -> Option<Resolution> {
        let mut state = self.state.lock();
        match *state {
            SlotState::Granted => {
                *state = SlotState::Consumed;
                Some(Resolution::Granted)
            }
            SlotState::Rejected => {
                *state = SlotState::Consumed;
                Some(Resolution::Rejected)
            }
            SlotState::Waiting(_) | SlotState::Consumed => None,
        }
    }

    pub(crate) fn poll(&self, waker: &Waker) -> Poll<Resolution> {
        let mut state = self.state.lock();
        match &mut *state {
            SlotState::Waiting(slot) => {
                match slot {
                    Some(existing) if existing.will_wake(waker) => {}
                    Some(existing) => existing.clone_from(waker),
                    None => *slot = Some(waker.clone()),
                }
                Poll::Pending
            }
            SlotState::Granted => {
                *state = SlotState::Consumed;
                Poll::Ready(Resolution::Granted)
            }
            SlotState::Rejected => {
                *state = SlotState::Consumed;
                Poll::Ready(Resolution::Rejected)
            }
            SlotState::Consumed => {
                debug_assert!(false, "wait slot polled after completion");
                Poll::Pending
            }
        }
    }
}
