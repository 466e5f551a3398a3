//! Property-based tests for repository lock scheduling.
//!
//! Drives random sequences of acquire, release, cancel and drop operations
//! over a handful of keys and checks, after every step, that holder state,
//! queue order and registry size agree with what the callers observe.

#[macro_use]
mod common;
use common::*;

use proptest::prelude::*;
use repo_mutex::{
    Acquire, ActiveMode, CancelToken, LockGuard, LockMode, RepositoryMutex, RequestId,
};
use std::task::Poll;

const KEYS: usize = 3;

#[derive(Debug, Clone)]
enum Op {
    Shared { key: usize, cancellable: bool },
    Exclusive { key: usize, cancellable: bool },
    Release(usize),
    Cancel(usize),
    Drop(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..KEYS, any::<bool>()).prop_map(|(key, cancellable)| Op::Shared { key, cancellable }),
        2 => (0..KEYS, any::<bool>()).prop_map(|(key, cancellable)| Op::Exclusive { key, cancellable }),
        3 => any::<usize>().prop_map(Op::Release),
        1 => any::<usize>().prop_map(Op::Cancel),
        1 => any::<usize>().prop_map(Op::Drop),
    ]
}

fn key_name(key: usize) -> String {
    format!("repo-{key}")
}

struct Waiting {
    key: usize,
    id: RequestId,
    fut: Acquire,
    token: Option<CancelToken>,
}

struct Holding {
    key: usize,
    guard: LockGuard,
}

#[derive(Default)]
struct Model {
    waiting: Vec<Waiting>,
    holding: Vec<Holding>,
    /// Exclusive grants per key, in grant order.
    exclusive_grants: [Vec<RequestId>; KEYS],
}

impl Model {
    /// Polls every waiter once, moving granted ones to `holding`.
    fn settle(&mut self) -> Result<(), TestCaseError> {
        let mut newly_granted = Vec::new();
        let mut still = Vec::with_capacity(self.waiting.len());
        for mut w in self.waiting.drain(..) {
            match poll_once(&mut w.fut) {
                Poll::Ready(Ok(guard)) => {
                    prop_assert_eq!(guard.request_id(), w.id);
                    newly_granted.push((w.key, w.id, guard.mode()));
                    self.holding.push(Holding { key: w.key, guard });
                }
                Poll::Ready(Err(err)) => {
                    return Err(TestCaseError::fail(format!(
                        "waiter {} failed without its token firing: {err}",
                        w.id
                    )));
                }
                Poll::Pending => still.push(w),
            }
        }
        self.waiting = still;

        for (key, id, mode) in newly_granted {
            // Grants never skip an earlier arrival on the same key.
            for w in self.waiting.iter().filter(|w| w.key == key) {
                prop_assert!(w.id > id, "{} granted ahead of queued {}", id, w.id);
            }
            if mode == LockMode::Exclusive {
                self.exclusive_grants[key].push(id);
            }
        }
        Ok(())
    }

    fn check(&self, locks: &RepositoryMutex) -> Result<(), TestCaseError> {
        let mut tracked = 0;
        for key in 0..KEYS {
            let shared = self
                .holding
                .iter()
                .filter(|h| h.key == key && h.guard.mode() == LockMode::Shared)
                .count();
            let exclusive = self
                .holding
                .iter()
                .filter(|h| h.key == key && h.guard.mode() == LockMode::Exclusive)
                .count();
            let queued: Vec<RequestId> = self
                .waiting
                .iter()
                .filter(|w| w.key == key)
                .map(|w| w.id)
                .collect();

            prop_assert!(exclusive <= 1);
            prop_assert!(shared == 0 || exclusive == 0);

            match locks.snapshot(&key_name(key)) {
                None => {
                    prop_assert_eq!(shared + exclusive, 0);
                    prop_assert!(queued.is_empty());
                }
                Some(snapshot) => {
                    tracked += 1;
                    prop_assert!(shared + exclusive + queued.len() > 0, "idle key retained");
                    let expected = if exclusive == 1 {
                        ActiveMode::Exclusive
                    } else if shared > 0 {
                        ActiveMode::Shared
                    } else {
                        ActiveMode::None
                    };
                    prop_assert_eq!(snapshot.active, expected);
                    // A holder-less key with waiters means a drain stalled.
                    prop_assert!(
                        queued.is_empty() || expected != ActiveMode::None,
                        "requests queued on a key with no holder"
                    );
                    prop_assert_eq!(snapshot.shared_count, shared);
                    let snapshot_ids: Vec<RequestId> =
                        snapshot.queued.iter().map(|r| r.request_id).collect();
                    prop_assert_eq!(snapshot_ids, queued);
                }
            }

            let grants = &self.exclusive_grants[key];
            prop_assert!(grants.windows(2).all(|w| w[0] < w[1]));
        }
        prop_assert_eq!(locks.tracked_keys(), tracked);
        Ok(())
    }
}

fn apply(locks: &RepositoryMutex, model: &mut Model, op: Op) -> Result<(), TestCaseError> {
    match op {
        Op::Shared { key, cancellable } | Op::Exclusive { key, cancellable } => {
            let mode = if matches!(op, Op::Shared { .. }) {
                LockMode::Shared
            } else {
                LockMode::Exclusive
            };
            let token = cancellable.then(CancelToken::new);
            let mut fut = locks.acquire(key_name(key), "prop", mode, token.as_ref());
            let id = fut.request_id().expect("registered");
            match poll_once(&mut fut) {
                Poll::Ready(Ok(guard)) => {
                    if mode == LockMode::Exclusive {
                        model.exclusive_grants[key].push(id);
                    }
                    model.holding.push(Holding { key, guard });
                }
                Poll::Ready(Err(err)) => {
                    return Err(TestCaseError::fail(format!("fresh request failed: {err}")));
                }
                Poll::Pending => model.waiting.push(Waiting {
                    key,
                    id,
                    fut,
                    token,
                }),
            }
        }
        Op::Release(i) => {
            if !model.holding.is_empty() {
                let held = model.holding.remove(i % model.holding.len());
                held.guard.release();
            }
        }
        Op::Cancel(i) => {
            let cancellable: Vec<usize> = model
                .waiting
                .iter()
                .enumerate()
                .filter(|(_, w)| w.token.is_some())
                .map(|(idx, _)| idx)
                .collect();
            if !cancellable.is_empty() {
                let mut w = model.waiting.remove(cancellable[i % cancellable.len()]);
                if let Some(token) = &w.token {
                    token.cancel();
                }
                match poll_once(&mut w.fut) {
                    Poll::Ready(Err(err)) => prop_assert!(err.is_cancelled()),
                    _ => return Err(TestCaseError::fail("cancelled waiter not rejected")),
                }
            }
        }
        Op::Drop(i) => {
            if !model.waiting.is_empty() {
                let w = model.waiting.remove(i % model.waiting.len());
                drop(w);
            }
        }
    }
    model.settle()?;
    model.check(locks)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Random operation sequences keep holders compatible, queues in arrival
    /// order and the registry free of idle keys.
    #[test]
    fn random_schedules_preserve_invariants(ops in prop::collection::vec(arb_op(), 1..80)) {
        init_test_logging();
        let locks = RepositoryMutex::new();
        let mut model = Model::default();

        for op in ops {
            apply(&locks, &mut model, op)?;
        }

        // Tear down: drop waiters first, then holders.
        model.waiting.clear();
        model.check(&locks)?;
        while let Some(held) = model.holding.pop() {
            held.guard.release();
            model.check(&locks)?;
        }
        prop_assert_eq!(locks.tracked_keys(), 0);
    }

    /// A queued request whose token fires never changes when the others run.
    #[test]
    fn cancellation_does_not_reorder_survivors(
        modes in prop::collection::vec(any::<bool>(), 2..12),
        cancel_mask in prop::collection::vec(any::<bool>(), 12),
    ) {
        init_test_logging();
        let cancelled_locks = RepositoryMutex::new();
        let plain_locks = RepositoryMutex::new();

        let run = |locks: &RepositoryMutex, cancel: bool| -> Vec<usize> {
            let blocker = locks.try_acquire_exclusive("repo", "blocker").expect("idle");
            let mut waiters: Vec<(usize, CancelToken, Acquire)> = modes
                .iter()
                .enumerate()
                .filter(|(i, _)| cancel || !cancel_mask[*i])
                .map(|(i, shared)| {
                    let token = CancelToken::new();
                    let mode = if *shared { LockMode::Shared } else { LockMode::Exclusive };
                    let fut = locks.acquire("repo", "prop", mode, Some(&token));
                    (i, token, fut)
                })
                .collect();
            if cancel {
                for (i, token, _) in &waiters {
                    if cancel_mask[*i] {
                        token.cancel();
                    }
                }
                waiters.retain_mut(|(i, _, fut)| {
                    if cancel_mask[*i] {
                        assert!(matches!(poll_once(fut), Poll::Ready(Err(_))));
                        false
                    } else {
                        true
                    }
                });
            }

            let mut order = Vec::new();
            let mut held: Vec<LockGuard> = Vec::new();
            drop(blocker);
            while !waiters.is_empty() {
                waiters.retain_mut(|(i, _, fut)| match poll_once(fut) {
                    Poll::Ready(Ok(guard)) => {
                        order.push(*i);
                        held.push(guard);
                        false
                    }
                    _ => true,
                });
                held.clear();
            }
            order
        };

        let with_cancellation = run(&cancelled_locks, true);
        let never_queued = run(&plain_locks, false);
        prop_assert_eq!(with_cancellation, never_queued);
        prop_assert_eq!(cancelled_locks.tracked_keys(), 0);
        prop_assert_eq!(plain_locks.tracked_keys(), 0);
    }
}

#[test]
fn teardown_with_mixed_queue_reclaims_everything() {
    init_test_logging();
    test_phase!("teardown_with_mixed_queue_reclaims_everything");
    let locks = RepositoryMutex::new();
    let mut model = Model::default();
    let ops = [
        Op::Exclusive { key: 0, cancellable: false },
        Op::Shared { key: 0, cancellable: true },
        Op::Exclusive { key: 0, cancellable: true },
        Op::Shared { key: 0, cancellable: false },
        Op::Cancel(0),
        Op::Release(0),
        Op::Drop(0),
    ];
    for op in ops {
        apply(&locks, &mut model, op).expect("invariants hold");
    }
    model.waiting.clear();
    model.holding.clear();
    let tracked = locks.tracked_keys();
    assert_with_log!(tracked == 0, "registry empty", 0usize, tracked);
    test_complete!("teardown_with_mixed_queue_reclaims_everything");
}
