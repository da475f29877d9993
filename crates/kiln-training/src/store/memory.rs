use super::{CheckpointStore, EvaluationStore, RunStore};
use crate::checkpoint::{Checkpoint, CheckpointId};
use crate::error::{TrainingError, TrainingResult};
use crate::evaluation::{Evaluation, EvaluationId};
use crate::run::{Run, RunId, RunStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Tables {
    runs: HashMap<RunId, Run>,
    checkpoints: Vec<Checkpoint>,
    evaluations: HashMap<EvaluationId, Evaluation>,
}

/// In-memory store backed by plain maps behind one mutex.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[async_trait]
impl RunStore for MemoryStore {
    async fn insert_run(&self, run: &Run) -> TrainingResult<()> {
        let mut tables = self.tables();
        if tables.runs.contains_key(&run.id) {
            return Err(TrainingError::Storage(format!("run {} already exists", run.id)));
        }
        tables.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> TrainingResult<Run> {
        self.tables().runs.get(id).cloned().ok_or_else(|| TrainingError::NotFound(format!("run {id}")))
    }

    async fn update_run(&self, run: &Run) -> TrainingResult<()> {
        let mut tables = self.tables();
        let slot = tables.runs.get_mut(&run.id).ok_or_else(|| TrainingError::NotFound(format!("run {}", run.id)))?;
        *slot = run.clone();
        Ok(())
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> TrainingResult<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .tables()
            .runs
            .values()
            .filter(|run| status.is_none_or(|s| run.status == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> TrainingResult<()> {
        let mut tables = self.tables();
        let max_step = tables.checkpoints.iter().filter(|c| c.run_id == checkpoint.run_id).map(|c| c.step).max();
        if let Some(max_step) = max_step {
            if tables.checkpoints.iter().any(|c| c.run_id == checkpoint.run_id && c.step == checkpoint.step) {
                return Err(TrainingError::InvalidStepOrder {
                    run_id: checkpoint.run_id.clone(),
                    step: checkpoint.step,
                    max_step,
                });
            }
        }
        tables.checkpoints.push(checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(&self, id: &CheckpointId) -> TrainingResult<Checkpoint> {
        self.tables()
            .checkpoints
            .iter()
            .find(|c| &c.id == id)
            .cloned()
            .ok_or_else(|| TrainingError::NotFound(format!("checkpoint {id}")))
    }

    async fn list_checkpoints(&self, run_id: &RunId) -> TrainingResult<Vec<Checkpoint>> {
        let mut checkpoints: Vec<Checkpoint> =
            self.tables().checkpoints.iter().filter(|c| &c.run_id == run_id).cloned().collect();
        checkpoints.sort_by_key(|c| c.step);
        Ok(checkpoints)
    }
}

// ---------------------------------------------------------------------------
// Evaluations
// ---------------------------------------------------------------------------

#[async_trait]
impl EvaluationStore for MemoryStore {
    async fn insert_evaluation(&self, evaluation: &Evaluation) -> TrainingResult<()> {
        self.tables().evaluations.insert(evaluation.id.clone(), evaluation.clone());
        Ok(())
    }

    async fn update_evaluation(&self, evaluation: &Evaluation) -> TrainingResult<()> {
        let mut tables = self.tables();
        let slot = tables
            .evaluations
            .get_mut(&evaluation.id)
            .ok_or_else(|| TrainingError::NotFound(format!("evaluation {}", evaluation.id)))?;
        *slot = evaluation.clone();
        Ok(())
    }

    async fn get_evaluation(&self, id: &EvaluationId) -> TrainingResult<Evaluation> {
        self.tables()
            .evaluations
            .get(id)
            .cloned()
            .ok_or_else(|| TrainingError::NotFound(format!("evaluation {id}")))
    }

    async fn list_evaluations(&self, run_id: &RunId) -> TrainingResult<Vec<Evaluation>> {
        let mut evaluations: Vec<Evaluation> =
            self.tables().evaluations.values().filter(|e| &e.run_id == run_id).cloned().collect();
        evaluations.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(evaluations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::StorageRef;
    use crate::run::{ProjectId, RecipeKind, RunConfig};
    use chrono::Utc;

    fn checkpoint(run_id: &RunId, step: u64) -> Checkpoint {
        Checkpoint {
            id: CheckpointId::new(),
            run_id: run_id.clone(),
            step,
            storage_ref: StorageRef::new(format!("ref-{step}")),
            source: None,
            metrics: Default::default(),
            is_final: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_run_crud() {
        let store = MemoryStore::new();
        let mut run = Run::new(ProjectId::from("p"), RecipeKind::Sft, RunConfig::new(), None);
        store.insert_run(&run).await.unwrap();
        assert!(store.insert_run(&run).await.is_err());

        run.status = RunStatus::Running;
        store.update_run(&run).await.unwrap();
        assert_eq!(store.get_run(&run.id).await.unwrap().status, RunStatus::Running);
        assert_eq!(store.list_runs(Some(RunStatus::Pending)).await.unwrap().len(), 0);
        assert!(matches!(store.get_run(&RunId::from("missing")).await, Err(TrainingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_checkpoints_unique_per_step_and_sorted() {
        let store = MemoryStore::new();
        let run = RunId::from("r");
        store.insert_checkpoint(&checkpoint(&run, 20)).await.unwrap();
        store.insert_checkpoint(&checkpoint(&run, 10)).await.unwrap();
        store.insert_checkpoint(&checkpoint(&RunId::from("other"), 20)).await.unwrap();

        let duplicate = store.insert_checkpoint(&checkpoint(&run, 20)).await;
        assert!(matches!(duplicate, Err(TrainingError::InvalidStepOrder { .. })));

        let steps: Vec<u64> = store.list_checkpoints(&run).await.unwrap().iter().map(|c| c.step).collect();
        assert_eq!(steps, vec![10, 20]);
    }
}
