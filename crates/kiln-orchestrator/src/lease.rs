//! Run-scoped exclusive leases.
//!
//! A lease is the guard that keeps at most one attempt in flight per run. It
//! is taken before any state transition, held across internal retries and
//! released exactly once when the worker drops it.

use crate::error::{OrchestrationError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use kiln_training::RunId;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct LeaseEntry {
    acquired_at: DateTime<Utc>,
    cancel: CancellationToken,
    released: watch::Receiver<bool>,
}

/// Keyed registry of active run leases.
#[derive(Clone, Default)]
pub struct LeaseRegistry {
    active: Arc<DashMap<RunId, LeaseEntry>>,
}

impl fmt::Debug for LeaseRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseRegistry").field("active", &self.active.len()).finish()
    }
}

impl LeaseRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lease for `run_id`.
    ///
    /// # Errors
    /// * `AlreadyRunning` - another holder exists; nothing is changed
    pub fn try_acquire(&self, run_id: &RunId) -> Result<RunLease> {
        match self.active.entry(run_id.clone()) {
            Entry::Occupied(_) => Err(OrchestrationError::AlreadyRunning(run_id.clone())),
            Entry::Vacant(slot) => {
                let cancel = CancellationToken::new();
                let (released_tx, released_rx) = watch::channel(false);
                slot.insert(LeaseEntry { acquired_at: Utc::now(), cancel: cancel.clone(), released: released_rx });
                debug!(run_id = %run_id, "Lease acquired");
                Ok(RunLease { registry: Arc::clone(&self.active), run_id: run_id.clone(), cancel, released_tx })
            }
        }
    }

    pub fn is_active(&self, run_id: &RunId) -> bool {
        self.active.contains_key(run_id)
    }

    pub fn active_runs(&self) -> Vec<(RunId, DateTime<Utc>)> {
        self.active.iter().map(|entry| (entry.key().clone(), entry.acquired_at)).collect()
    }

    /// Signals cancellation to the holder and waits until it lets go.
    ///
    /// # Errors
    /// * `NotRunning` - nobody holds the lease
    pub async fn cancel_and_wait(&self, run_id: &RunId) -> Result<()> {
        let mut released = {
            let entry = self.active.get(run_id).ok_or_else(|| OrchestrationError::NotRunning(run_id.clone()))?;
            entry.cancel.cancel();
            entry.released.clone()
        };
        // A closed channel means the lease is already gone.
        let _ = released.wait_for(|done| *done).await;
        Ok(())
    }
}

/// Exclusive hold on a run. Released on drop.
pub struct RunLease {
    registry: Arc<DashMap<RunId, LeaseEntry>>,
    run_id: RunId,
    cancel: CancellationToken,
    released_tx: watch::Sender<bool>,
}

impl fmt::Debug for RunLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLease")
            .field("run_id", &self.run_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RunLease {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Token tripped by [`LeaseRegistry::cancel_and_wait`].
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        self.registry.remove(&self.run_id);
        let _ = self.released_tx.send(true);
        debug!(run_id = %self.run_id, "Lease released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_second_acquire_is_rejected_until_release() {
        let registry = LeaseRegistry::new();
        let run = RunId::from("r1");

        let lease = registry.try_acquire(&run).unwrap();
        assert!(matches!(registry.try_acquire(&run), Err(OrchestrationError::AlreadyRunning(_))));
        assert!(registry.try_acquire(&RunId::from("r2")).is_ok());

        drop(lease);
        assert!(!registry.is_active(&run));
        assert!(registry.try_acquire(&run).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_waits_for_release() {
        let registry = LeaseRegistry::new();
        let run = RunId::from("r1");
        let lease = registry.try_acquire(&run).unwrap();
        let token = lease.cancellation().clone();

        let holder = tokio::spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(lease);
        });

        registry.cancel_and_wait(&run).await.unwrap();
        assert!(!registry.is_active(&run));
        holder.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_without_holder() {
        let registry = LeaseRegistry::new();
        let result = registry.cancel_and_wait(&RunId::from("idle")).await;
        assert!(matches!(result, Err(OrchestrationError::NotRunning(_))));
    }
}
