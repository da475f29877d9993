//! Checkpoint lifecycle manager.
//!
//! Writes checkpoint manifests to artifact storage, registers the matching
//! records and answers latest/best/final queries. Step numbers of a run are
//! strictly increasing; re-registering a step the run already has returns the
//! existing record unchanged so that replays after a crash are safe.

use crate::error::{OrchestrationError, Result};
use crate::executor::CheckpointEvent;
use dashmap::DashMap;
use kiln_training::{
    ArtifactStorage, Checkpoint, CheckpointId, CheckpointManifest, CheckpointStore, MetricObjective, MetricSnapshot,
    RunId, StorageRef, read_manifest,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    artifacts: Arc<dyn ArtifactStorage>,
    locks: DashMap<RunId, Arc<Mutex<()>>>,
}

impl fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointManager").field("tracked_runs", &self.locks.len()).finish_non_exhaustive()
    }
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, artifacts: Arc<dyn ArtifactStorage>) -> Self {
        Self { store, artifacts, locks: DashMap::new() }
    }

    fn lock_for(&self, run_id: &RunId) -> Arc<Mutex<()>> {
        self.locks.entry(run_id.clone()).or_default().clone()
    }

    /// Drops the per-run lock of a run that reached a terminal status.
    pub fn release(&self, run_id: &RunId) {
        self.locks.remove(run_id);
    }

    /// Registers a checkpoint whose artifact is already stored.
    ///
    /// # Errors
    /// * `InvalidStepOrder` - `step` is not above the run's current maximum
    pub async fn register(
        &self,
        run_id: &RunId,
        step: u64,
        storage_ref: StorageRef,
        source: Option<String>,
        metrics: MetricSnapshot,
        is_final: bool,
    ) -> Result<Checkpoint> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;
        let (checkpoint, _) = self.insert_locked(run_id, step, storage_ref, source, metrics, is_final).await?;
        Ok(checkpoint)
    }

    /// Persists the manifest for a reported checkpoint, then registers it.
    ///
    /// The write is retried once before failing with `Artifact`.
    pub async fn record(&self, run_id: &RunId, event: &CheckpointEvent) -> Result<Checkpoint> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;

        let existing = self.store.list_checkpoints(run_id).await?;
        if let Some(same) = existing.iter().find(|c| c.step == event.step) {
            debug!(run_id = %run_id, step = event.step, "Checkpoint already registered");
            return Ok(same.clone());
        }
        if let Some(max_step) = existing.last().map(|c| c.step) {
            if event.step <= max_step {
                return Err(OrchestrationError::InvalidStepOrder { run_id: run_id.clone(), step: event.step, max_step });
            }
        }

        let manifest = CheckpointManifest::new(
            run_id.clone(),
            event.step,
            event.location.clone(),
            event.metrics.clone(),
            event.is_final,
        );
        let bytes = serde_json::to_vec(&manifest)
            .map_err(|e| OrchestrationError::Artifact(format!("failed to encode manifest: {e}")))?;
        let storage_ref = self.write_with_retry(run_id, &bytes).await?;

        let (checkpoint, _) = self
            .insert_locked(run_id, event.step, storage_ref, event.location.clone(), event.metrics.clone(), event.is_final)
            .await?;
        Ok(checkpoint)
    }

    async fn write_with_retry(&self, run_id: &RunId, bytes: &[u8]) -> Result<StorageRef> {
        match self.artifacts.write(bytes).await {
            Ok(storage_ref) => Ok(storage_ref),
            Err(first) => {
                warn!(run_id = %run_id, error = %first, "Checkpoint artifact write failed, retrying once");
                self.artifacts
                    .write(bytes)
                    .await
                    .map_err(|e| OrchestrationError::Artifact(format!("checkpoint write failed twice: {e}")))
            }
        }
    }

    /// Returns the checkpoint and whether it was newly created.
    async fn insert_locked(
        &self,
        run_id: &RunId,
        step: u64,
        storage_ref: StorageRef,
        source: Option<String>,
        metrics: MetricSnapshot,
        is_final: bool,
    ) -> Result<(Checkpoint, bool)> {
        let existing = self.store.list_checkpoints(run_id).await?;
        if let Some(same) = existing.iter().find(|c| c.step == step) {
            debug!(run_id = %run_id, step, "Checkpoint already registered");
            return Ok((same.clone(), false));
        }
        if let Some(max_step) = existing.last().map(|c| c.step) {
            if step <= max_step {
                return Err(OrchestrationError::InvalidStepOrder { run_id: run_id.clone(), step, max_step });
            }
        }

        let checkpoint = Checkpoint {
            id: CheckpointId::new(),
            run_id: run_id.clone(),
            step,
            storage_ref,
            source,
            metrics,
            is_final,
            created_at: chrono::Utc::now(),
        };
        self.store.insert_checkpoint(&checkpoint).await?;
        info!(run_id = %run_id, step, is_final, checkpoint_id = %checkpoint.id, "Checkpoint registered");
        Ok((checkpoint, true))
    }

    pub async fn get(&self, id: &CheckpointId) -> Result<Checkpoint> {
        Ok(self.store.get_checkpoint(id).await?)
    }

    /// Checkpoints of a run in ascending step order.
    pub async fn list(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        Ok(self.store.list_checkpoints(run_id).await?)
    }

    pub async fn latest(&self, run_id: &RunId) -> Result<Option<Checkpoint>> {
        Ok(self.list(run_id).await?.pop())
    }

    pub async fn final_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint>> {
        Ok(self.list(run_id).await?.into_iter().rev().find(|c| c.is_final))
    }

    /// Best checkpoint by `metric`. Checkpoints without a finite value are
    /// skipped; ties go to the earliest step.
    pub async fn best(&self, run_id: &RunId, metric: &str, objective: MetricObjective) -> Result<Option<Checkpoint>> {
        let mut best: Option<(f64, Checkpoint)> = None;
        for checkpoint in self.list(run_id).await? {
            let Some(value) = checkpoint.metric(metric) else {
                continue;
            };
            let better = best.as_ref().is_none_or(|(incumbent, _)| objective.is_better(value, *incumbent));
            if better {
                best = Some((value, checkpoint));
            }
        }
        Ok(best.map(|(_, checkpoint)| checkpoint))
    }

    /// Writes and registers a final checkpoint from the last known state.
    pub async fn synthesize_final(&self, run_id: &RunId, step: u64, metrics: MetricSnapshot) -> Result<Checkpoint> {
        info!(run_id = %run_id, step, "Synthesizing final checkpoint");
        let event = CheckpointEvent { step, location: None, metrics, is_final: true };
        self.record(run_id, &event).await
    }

    /// Registers manifests of `run_id` found in artifact storage without a record.
    ///
    /// Unreadable blobs and stale steps are skipped with a warning. Returns
    /// the checkpoints created.
    pub async fn reconcile(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;

        let mut manifests = Vec::new();
        for storage_ref in self.artifacts.list().await? {
            match read_manifest(self.artifacts.as_ref(), &storage_ref).await {
                Ok(Some(manifest)) if manifest.run_id == *run_id => manifests.push((manifest, storage_ref)),
                Ok(_) => {}
                Err(e) => warn!(storage_ref = %storage_ref, error = %e, "Skipping unreadable artifact"),
            }
        }
        manifests.sort_by_key(|(manifest, _)| manifest.step);

        let mut created = Vec::new();
        for (manifest, storage_ref) in manifests {
            let step = manifest.step;
            match self
                .insert_locked(run_id, step, storage_ref, manifest.source, manifest.metrics, manifest.is_final)
                .await
            {
                Ok((checkpoint, true)) => created.push(checkpoint),
                Ok((_, false)) => {}
                Err(OrchestrationError::InvalidStepOrder { max_step, .. }) => {
                    warn!(run_id = %run_id, step, max_step, "Orphaned manifest is behind the registered maximum");
                }
                Err(e) => return Err(e),
            }
        }
        if !created.is_empty() {
            info!(run_id = %run_id, recovered = created.len(), "Recovered orphaned checkpoints");
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kiln_training::{MemoryArtifactStorage, MemoryStore, TrainingError, TrainingResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> (CheckpointManager, Arc<MemoryStore>, Arc<MemoryArtifactStorage>) {
        let store = Arc::new(MemoryStore::new());
        let artifacts = Arc::new(MemoryArtifactStorage::new());
        (CheckpointManager::new(store.clone(), artifacts.clone()), store, artifacts)
    }

    fn event(step: u64, loss: f64) -> CheckpointEvent {
        CheckpointEvent {
            step,
            location: Some(format!("remote://ckpt/{step}")),
            metrics: [("loss".to_string(), loss)].into_iter().collect(),
            is_final: false,
        }
    }

    #[tokio::test]
    async fn test_steps_must_increase() {
        let (manager, _, _) = manager();
        let run = RunId::from("r");
        manager.record(&run, &event(10, 0.9)).await.unwrap();
        manager.record(&run, &event(20, 0.8)).await.unwrap();

        let stale = manager.record(&run, &event(15, 0.7)).await;
        assert!(matches!(stale, Err(OrchestrationError::InvalidStepOrder { step: 15, max_step: 20, .. })));

        let direct = manager.register(&run, 12, StorageRef::new("other"), None, MetricSnapshot::new(), false).await;
        assert!(matches!(direct, Err(OrchestrationError::InvalidStepOrder { step: 12, max_step: 20, .. })));
        assert_eq!(manager.list(&run).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_replaying_a_checkpoint_is_idempotent() {
        let (manager, _, artifacts) = manager();
        let run = RunId::from("r");
        let first = manager.record(&run, &event(10, 0.9)).await.unwrap();
        let again = manager.record(&run, &event(10, 0.9)).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(manager.list(&run).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_step_with_new_ref_returns_existing() {
        let (manager, _, _) = manager();
        let run = RunId::from("r");
        let snapshot = MetricSnapshot::new();
        let first = manager.register(&run, 10, StorageRef::new("a"), None, snapshot.clone(), false).await.unwrap();
        let again = manager.register(&run, 10, StorageRef::new("b"), None, snapshot, true).await.unwrap();

        assert_eq!(again.id, first.id);
        assert_eq!(again.storage_ref, StorageRef::new("a"));
        assert!(!again.is_final);
        assert_eq!(manager.list(&run).await.unwrap().len(), 1);

        let replayed = manager.record(&run, &event(10, 0.1)).await.unwrap();
        assert_eq!(replayed.id, first.id);
    }

    #[tokio::test]
    async fn test_release_drops_run_lock() {
        let (manager, _, _) = manager();
        let run = RunId::from("r");
        manager.record(&run, &event(10, 0.9)).await.unwrap();
        assert_eq!(manager.locks.len(), 1);

        manager.release(&run);
        assert!(manager.locks.is_empty());
        assert_eq!(manager.list(&run).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_best_ignores_registration_order_and_missing_metrics() {
        let (manager, _, _) = manager();
        let run = RunId::from("r");
        manager.record(&run, &event(1, 0.9)).await.unwrap();
        manager.record(&run, &event(2, 0.4)).await.unwrap();
        manager.record(&run, &event(3, 0.6)).await.unwrap();
        manager
            .record(&run, &CheckpointEvent { step: 4, location: None, metrics: MetricSnapshot::new(), is_final: true })
            .await
            .unwrap();

        let best = manager.best(&run, "loss", MetricObjective::Minimize).await.unwrap().unwrap();
        assert_eq!(best.step, 2);
        let worst = manager.best(&run, "loss", MetricObjective::Maximize).await.unwrap().unwrap();
        assert_eq!(worst.step, 1);
        assert!(manager.best(&run, "reward", MetricObjective::Maximize).await.unwrap().is_none());

        assert_eq!(manager.latest(&run).await.unwrap().unwrap().step, 4);
        assert_eq!(manager.final_checkpoint(&run).await.unwrap().unwrap().step, 4);
    }

    #[tokio::test]
    async fn test_reconcile_registers_orphaned_manifests() {
        let (manager, _, artifacts) = manager();
        let run = RunId::from("r");
        manager.record(&run, &event(10, 0.9)).await.unwrap();

        // Manifests written right before a crash, with no record.
        for (step, target) in [(20, "r"), (30, "r"), (5, "r"), (40, "other")] {
            let manifest = CheckpointManifest::new(RunId::from(target), step, None, MetricSnapshot::new(), false);
            artifacts.write(&serde_json::to_vec(&manifest).unwrap()).await.unwrap();
        }
        artifacts.write(b"not a manifest").await.unwrap();

        let recovered = manager.reconcile(&run).await.unwrap();
        let steps: Vec<u64> = recovered.iter().map(|c| c.step).collect();
        assert_eq!(steps, vec![20, 30]);
        assert!(manager.reconcile(&run).await.unwrap().is_empty());
    }

    struct FlakyStorage {
        inner: MemoryArtifactStorage,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl ArtifactStorage for FlakyStorage {
        async fn write(&self, bytes: &[u8]) -> TrainingResult<StorageRef> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TrainingError::Artifact("disk hiccup".to_string()));
            }
            self.inner.write(bytes).await
        }

        async fn read(&self, storage_ref: &StorageRef) -> TrainingResult<Vec<u8>> {
            self.inner.read(storage_ref).await
        }

        async fn list(&self) -> TrainingResult<Vec<StorageRef>> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn test_artifact_write_is_retried_once() {
        let run = RunId::from("r");
        let flaky = |failures| {
            Arc::new(FlakyStorage { inner: MemoryArtifactStorage::new(), failures_left: AtomicUsize::new(failures) })
        };

        let manager = CheckpointManager::new(Arc::new(MemoryStore::new()), flaky(1));
        manager.record(&run, &event(1, 0.5)).await.unwrap();

        let manager = CheckpointManager::new(Arc::new(MemoryStore::new()), flaky(2));
        let result = manager.record(&run, &event(1, 0.5)).await;
        assert!(matches!(result, Err(OrchestrationError::Artifact(_))));
    }
}
