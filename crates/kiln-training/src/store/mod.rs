//! Persistence for runs, checkpoints and evaluations.
//!
//! Each record kind has its own async trait so callers can mix backends.
//! [`MemoryStore`] and [`SqliteStore`] implement all three.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::checkpoint::{Checkpoint, CheckpointId};
use crate::error::TrainingResult;
use crate::evaluation::{Evaluation, EvaluationId};
use crate::run::{Run, RunId, RunStatus};
use async_trait::async_trait;

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_run(&self, run: &Run) -> TrainingResult<()>;

    /// Fails with `NotFound` for an unknown id.
    async fn get_run(&self, id: &RunId) -> TrainingResult<Run>;

    /// Replaces the stored record. Fails with `NotFound` for an unknown id.
    async fn update_run(&self, run: &Run) -> TrainingResult<()>;

    async fn list_runs(&self, status: Option<RunStatus>) -> TrainingResult<Vec<Run>>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Fails with `InvalidStepOrder` when the run already has a checkpoint at that step.
    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> TrainingResult<()>;

    async fn get_checkpoint(&self, id: &CheckpointId) -> TrainingResult<Checkpoint>;

    /// Checkpoints of a run in ascending step order.
    async fn list_checkpoints(&self, run_id: &RunId) -> TrainingResult<Vec<Checkpoint>>;
}

#[async_trait]
pub trait EvaluationStore: Send + Sync {
    async fn insert_evaluation(&self, evaluation: &Evaluation) -> TrainingResult<()>;

    async fn update_evaluation(&self, evaluation: &Evaluation) -> TrainingResult<()>;

    async fn get_evaluation(&self, id: &EvaluationId) -> TrainingResult<Evaluation>;

    async fn list_evaluations(&self, run_id: &RunId) -> TrainingResult<Vec<Evaluation>>;
}
