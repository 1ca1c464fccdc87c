use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

/// Single-holder gate over the shared generation pipeline, with explicit
/// FIFO hand-off.
///
/// A plain async mutex gives no fairness guarantee, which would let the
/// displayed queue order diverge from actual execution order under
/// contention. Here waiters are granted strictly in enlistment order: the
/// scheduler enlists a job in the same critical section that appends it to
/// the admission queue, so the position shown to clients is exactly the
/// order in which the gate will be granted.
#[derive(Debug, Default)]
pub struct PipelineGate {
    state: Mutex<GateState>,
}

#[derive(Debug, Default)]
struct GateState {
    held: bool,
    waiters: VecDeque<Waiter>,
}

#[derive(Debug)]
struct Waiter {
    job_id: String,
    grant: oneshot::Sender<GatePermit>,
}

/// Exclusive hold on the pipeline. Dropping the permit hands the gate to the
/// longest-waiting enlisted job, so no error path can leak a held gate.
///
/// The inner handle is an `Option` so the gate can defuse a permit whose
/// receiver died before delivery; a defused permit must not re-enter
/// `release` from its own drop while the state lock is held.
#[derive(Debug)]
pub struct GatePermit {
    gate: Option<Arc<PipelineGate>>,
}

impl PipelineGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join the wait line for the gate.
    ///
    /// If the gate is free and nobody is waiting, the permit is delivered
    /// immediately; otherwise the returned receiver resolves when every
    /// earlier waiter has released. The receiver errors if the waiter is
    /// withdrawn before being granted.
    pub fn enlist(self: &Arc<Self>, job_id: &str) -> oneshot::Receiver<GatePermit> {
        let (grant, pending) = oneshot::channel();
        let mut state = self.lock_state();
        if !state.held && state.waiters.is_empty() {
            state.held = true;
            // The receiver is a local in the caller's scope, so the send
            // cannot fail; defuse anyway so a failed delivery can never
            // re-enter the lock from the permit's drop.
            if let Err(mut returned) = grant.send(GatePermit {
                gate: Some(Arc::clone(self)),
            }) {
                returned.gate = None;
                state.held = false;
            }
        } else {
            state.waiters.push_back(Waiter {
                job_id: job_id.to_string(),
                grant,
            });
        }
        pending
    }

    /// Remove a not-yet-granted waiter. Returns `false` when `job_id` is not
    /// waiting (it either already holds the gate or was never enlisted).
    pub fn withdraw(&self, job_id: &str) -> bool {
        let mut state = self.lock_state();
        match state.waiters.iter().position(|w| w.job_id == job_id) {
            Some(index) => {
                state.waiters.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn waiting(&self) -> usize {
        self.lock_state().waiters.len()
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.lock_state();
        loop {
            match state.waiters.pop_front() {
                Some(waiter) => {
                    let permit = GatePermit {
                        gate: Some(Arc::clone(self)),
                    };
                    match waiter.grant.send(permit) {
                        Ok(()) => return,
                        // Dead receiver: the driver task is gone. Defuse the
                        // minted permit and hand off to the next waiter.
                        Err(mut returned) => {
                            returned.gate = None;
                        }
                    }
                }
                None => {
                    state.held = false;
                    return;
                }
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_enlistment_is_granted_immediately() {
        let gate = PipelineGate::new();
        let permit = gate.enlist("a").await.expect("immediate grant");
        assert_eq!(gate.waiting(), 0);
        drop(permit);
    }

    #[tokio::test]
    async fn grants_follow_enlistment_order() {
        let gate = PipelineGate::new();
        let first = gate.enlist("a").await.expect("grant a");
        let mut pending_b = gate.enlist("b");
        let mut pending_c = gate.enlist("c");
        assert_eq!(gate.waiting(), 2);

        // Nobody is granted while the permit is held.
        assert!(pending_b.try_recv().is_err());
        assert!(pending_c.try_recv().is_err());

        drop(first);
        let second = pending_b.await.expect("grant b");
        assert!(pending_c.try_recv().is_err());

        drop(second);
        let _third = pending_c.await.expect("grant c");
    }

    #[tokio::test]
    async fn withdrawn_waiter_is_never_granted() {
        let gate = PipelineGate::new();
        let first = gate.enlist("a").await.expect("grant a");
        let pending_b = gate.enlist("b");
        let pending_c = gate.enlist("c");

        assert!(gate.withdraw("b"));
        drop(first);

        assert!(pending_b.await.is_err());
        let _granted = pending_c.await.expect("grant c skips withdrawn b");
    }

    #[tokio::test]
    async fn withdraw_of_holder_or_unknown_returns_false() {
        let gate = PipelineGate::new();
        let _permit = gate.enlist("a").await.expect("grant a");
        assert!(!gate.withdraw("a"));
        assert!(!gate.withdraw("never-enlisted"));
    }

    #[tokio::test]
    async fn dead_receiver_is_skipped_on_release() {
        let gate = PipelineGate::new();
        let first = gate.enlist("a").await.expect("grant a");
        let pending_b = gate.enlist("b");
        let pending_c = gate.enlist("c");

        // The driver for b disappears without withdrawing.
        drop(pending_b);
        drop(first);

        let _granted = pending_c.await.expect("grant c skips dead b");
    }
}
