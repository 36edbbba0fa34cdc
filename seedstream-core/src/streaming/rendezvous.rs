//! Round synchronization between fetch workers and the one-shot launch gate.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Barrier;

type GateAction = Box<dyn FnOnce() + Send>;

/// Runs an action exactly once, no matter how many times it is fired.
pub struct LaunchGate {
    fired: AtomicBool,
    action: Mutex<Option<GateAction>>,
}

impl LaunchGate {
    /// Creates a gate holding `action`.
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            fired: AtomicBool::new(false),
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    /// Creates a gate that does nothing when fired.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Runs the action on the first call. Returns true for that call only.
    pub fn fire(&self) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let action = self.action.lock().take();
        if let Some(action) = action {
            action();
        }
        true
    }

    /// Whether the gate has fired.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl fmt::Debug for LaunchGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchGate")
            .field("fired", &self.has_fired())
            .finish()
    }
}

/// Reusable N-party barrier whose completion fires a [`LaunchGate`].
///
/// All parties block in [`RendezvousBarrier::wait`] until the last one
/// arrives. The releasing party of every round fires the gate, so the gate's
/// action runs after the first complete round and never again.
pub struct RendezvousBarrier {
    barrier: Barrier,
    parties: usize,
    gate: Arc<LaunchGate>,
    rounds: AtomicU64,
}

impl RendezvousBarrier {
    /// Creates a barrier for `parties` participants. Zero is treated as one.
    pub fn new(parties: usize, gate: Arc<LaunchGate>) -> Self {
        let parties = parties.max(1);
        Self {
            barrier: Barrier::new(parties),
            parties,
            gate,
            rounds: AtomicU64::new(0),
        }
    }

    /// Blocks until every party has arrived for the current round.
    ///
    /// Returns true for the single party that completed the round.
    pub async fn wait(&self) -> bool {
        let result = self.barrier.wait().await;
        if !result.is_leader() {
            return false;
        }

        let round = self.rounds.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!("Rendezvous round {} complete ({} parties)", round, self.parties);
        if self.gate.fire() {
            tracing::info!("First rendezvous round complete, launch gate fired");
        }
        true
    }

    /// Number of participants per round.
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Rounds completed so far.
    pub fn completed_rounds(&self) -> u64 {
        self.rounds.load(Ordering::Acquire)
    }

    /// Gate fired by the first completed round.
    pub fn gate(&self) -> &Arc<LaunchGate> {
        &self.gate
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    fn counting_gate() -> (Arc<LaunchGate>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let gate = LaunchGate::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (Arc::new(gate), calls)
    }

    #[test]
    fn test_gate_fires_once() {
        let (gate, calls) = counting_gate();

        assert!(!gate.has_fired());
        assert!(gate.fire());
        assert!(!gate.fire());
        assert!(gate.has_fired());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_action_runs_without_holding_the_lock() {
        let gate = Arc::new_cyclic(|weak: &std::sync::Weak<LaunchGate>| {
            let weak = weak.clone();
            LaunchGate::new(move || {
                let gate = weak.upgrade().unwrap();
                assert!(gate.action.try_lock().is_some());
                assert!(!gate.fire());
            })
        });

        assert!(gate.fire());
    }

    #[tokio::test]
    async fn test_gate_fires_after_first_round_only() {
        let (gate, calls) = counting_gate();
        let barrier = Arc::new(RendezvousBarrier::new(4, gate));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let barrier = Arc::clone(&barrier);
            tasks.push(tokio::spawn(async move {
                let mut led = 0;
                for _ in 0..3 {
                    if barrier.wait().await {
                        led += 1;
                    }
                }
                led
            }));
        }

        let leaders: usize = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|led| led.unwrap())
            .sum();
        assert_eq!(leaders, 3);
        assert_eq!(barrier.completed_rounds(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gate_waits_for_slowest_party() {
        let (gate, calls) = counting_gate();
        let barrier = Arc::new(RendezvousBarrier::new(2, Arc::clone(&gate)));

        let fast = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!gate.has_fired());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        barrier.wait().await;
        fast.await.unwrap();
        assert!(gate.has_fired());
    }

    #[tokio::test]
    async fn test_zero_parties_behaves_as_one() {
        let barrier = RendezvousBarrier::new(0, Arc::new(LaunchGate::noop()));
        assert_eq!(barrier.parties(), 1);
        assert!(barrier.wait().await);
        assert!(barrier.gate().has_fired());
    }
}
