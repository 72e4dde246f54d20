//! # Optimistic Mutation Coordinator
//!
//! Per-target state machine for toggle-style actions (like/unlike):
//!
//! ```text
//! Idle -> Pending(optimistic) -> Committed
//!                             -> RolledBack
//! ```
//!
//! `invoke` captures the displayed value, shows the flipped value at once,
//! then awaits the remote write. A second `invoke` on the same target while
//! the first is pending supersedes it: the new cycle starts from the value
//! currently displayed, and whatever the earlier write returns is ignored.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::error::SyncError;

const NOTICE_CAPACITY: usize = 256;

/// Where a target's cycle currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    /// No cycle has run, or the value was seeded from the backend.
    Idle,
    /// The optimistic value is shown and the write is in flight.
    Pending,
    /// The write succeeded.
    Committed,
    /// The write failed and the captured value was restored.
    RolledBack,
}

/// Display change announced to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationNotice<K, V> {
    /// Target whose displayed value changed.
    pub target: K,
    /// Value to display now.
    pub value: V,
    /// Phase reached.
    pub phase: MutationPhase,
}

/// Result of one `invoke`.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome<V> {
    /// This cycle's write succeeded and its value is displayed.
    Committed(V),
    /// A later `invoke` took over; this write's result was ignored.
    Superseded,
}

#[derive(Debug)]
struct TargetState<V> {
    displayed: V,
    captured: V,
    generation: u64,
    phase: MutationPhase,
}

impl<V: Default> Default for TargetState<V> {
    fn default() -> Self {
        Self {
            displayed: V::default(),
            captured: V::default(),
            generation: 0,
            phase: MutationPhase::Idle,
        }
    }
}

/// Optimistic toggles with rollback, keyed by target.
pub struct OptimisticMutationCoordinator<K, V> {
    targets: Mutex<HashMap<K, TargetState<V>>>,
    notifier: broadcast::Sender<MutationNotice<K, V>>,
}

impl<K, V> Default for OptimisticMutationCoordinator<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> OptimisticMutationCoordinator<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone + Default,
{
    /// Empty coordinator; unknown targets start at `V::default()`.
    pub fn new() -> Self {
        let (notifier, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            targets: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, TargetState<V>>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, target: K, value: V, phase: MutationPhase) {
        let _ = self.notifier.send(MutationNotice {
            target,
            value,
            phase,
        });
    }

    /// Observers of display changes.
    pub fn subscribe(&self) -> broadcast::Receiver<MutationNotice<K, V>> {
        self.notifier.subscribe()
    }

    /// Value currently displayed for `target`.
    pub fn value(&self, target: &K) -> V {
        self.lock()
            .get(target)
            .map(|state| state.displayed.clone())
            .unwrap_or_default()
    }

    /// Phase of `target`'s latest cycle.
    pub fn phase(&self, target: &K) -> MutationPhase {
        self.lock()
            .get(target)
            .map_or(MutationPhase::Idle, |state| state.phase)
    }

    /// Installs an authoritative value read from the backend. While a cycle
    /// is pending only the rollback baseline moves, so the optimistic value
    /// stays on screen.
    pub fn seed(&self, target: K, value: V) {
        let shown = {
            let mut targets = self.lock();
            let state = targets.entry(target.clone()).or_default();
            state.captured = value.clone();
            if state.phase == MutationPhase::Pending {
                false
            } else {
                state.displayed = value.clone();
                state.phase = MutationPhase::Idle;
                true
            }
        };
        if shown {
            self.notify(target, value, MutationPhase::Idle);
        }
    }

    /// Runs one optimistic cycle on `target`.
    ///
    /// `flip` computes the optimistic value from the displayed one; `write`
    /// persists it. On failure the captured value is restored and the error
    /// returned, unless a newer cycle has superseded this one.
    pub async fn invoke<F, W, Fut>(
        &self,
        target: K,
        flip: F,
        write: W,
    ) -> Result<MutationOutcome<V>, SyncError>
    where
        F: FnOnce(&V) -> V,
        W: FnOnce(V) -> Fut,
        Fut: Future<Output = Result<(), SyncError>>,
    {
        let (generation, optimistic) = {
            let mut targets = self.lock();
            let state = targets.entry(target.clone()).or_default();
            let optimistic = flip(&state.displayed);
            state.captured = state.displayed.clone();
            state.displayed = optimistic.clone();
            state.generation += 1;
            state.phase = MutationPhase::Pending;
            (state.generation, optimistic)
        };
        self.notify(target.clone(), optimistic.clone(), MutationPhase::Pending);

        let result = write(optimistic.clone()).await;

        let settled = {
            let mut targets = self.lock();
            let state = targets.entry(target.clone()).or_default();
            if state.generation != generation {
                None
            } else {
                match &result {
                    Ok(()) => state.phase = MutationPhase::Committed,
                    Err(_) => {
                        state.displayed = state.captured.clone();
                        state.phase = MutationPhase::RolledBack;
                    }
                }
                Some((state.displayed.clone(), state.phase))
            }
        };

        let Some((value, phase)) = settled else {
            tracing::debug!(?target, generation, "superseded, ignoring write result");
            return Ok(MutationOutcome::Superseded);
        };
        self.notify(target.clone(), value, phase);

        match result {
            Ok(()) => Ok(MutationOutcome::Committed(optimistic)),
            Err(e) => {
                tracing::warn!(?target, error = %e, "optimistic write failed, rolled back");
                Err(e)
            }
        }
    }
}
