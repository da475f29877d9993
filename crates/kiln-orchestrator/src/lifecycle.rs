//! Run state machine.
//!
//! The only component that moves a run across statuses. Transitions on one run
//! are serialized through a per-run mutex; unrelated runs never contend.

use crate::error::{OrchestrationError, Result};
use dashmap::DashMap;
use kiln_training::{CheckpointId, MetricSample, Run, RunId, RunStatus, RunStore};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// A requested status change.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// `pending -> running`, first attempt.
    Start,
    /// `running -> running` with the attempt counter incremented.
    ///
    /// Without a resume checkpoint the run restarts from scratch and its
    /// progress resets.
    Retry { resume_from: Option<CheckpointId> },
    Complete,
    Fail { error: String },
    Cancel,
}

impl Transition {
    fn target(&self) -> RunStatus {
        match self {
            Self::Start | Self::Retry { .. } => RunStatus::Running,
            Self::Complete => RunStatus::Completed,
            Self::Fail { .. } => RunStatus::Failed,
            Self::Cancel => RunStatus::Cancelled,
        }
    }

    /// Start only leaves `pending` and Retry only re-enters `running`; the
    /// rest follow the status graph.
    fn permitted_from(&self, from: RunStatus) -> bool {
        match self {
            Self::Start => from == RunStatus::Pending,
            Self::Retry { .. } => from == RunStatus::Running,
            _ => from.can_transition_to(self.target()),
        }
    }
}

/// Owns the authoritative status of every run.
pub struct RunStateMachine {
    store: Arc<dyn RunStore>,
    locks: DashMap<RunId, Arc<Mutex<()>>>,
}

impl fmt::Debug for RunStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunStateMachine").field("tracked_runs", &self.locks.len()).finish_non_exhaustive()
    }
}

impl RunStateMachine {
    #[must_use]
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store, locks: DashMap::new() }
    }

    fn lock_for(&self, run_id: &RunId) -> Arc<Mutex<()>> {
        self.locks.entry(run_id.clone()).or_default().clone()
    }

    pub async fn get(&self, run_id: &RunId) -> Result<Run> {
        Ok(self.store.get_run(run_id).await?)
    }

    /// Persists a freshly submitted run.
    pub async fn insert(&self, run: &Run) -> Result<()> {
        if run.status != RunStatus::Pending {
            return Err(OrchestrationError::Validation(format!("run {} is not pending", run.id)));
        }
        self.store.insert_run(run).await?;
        info!(run_id = %run.id, recipe = %run.recipe, "Run submitted");
        Ok(())
    }

    pub async fn list(&self, status: Option<RunStatus>) -> Result<Vec<Run>> {
        Ok(self.store.list_runs(status).await?)
    }

    /// Applies a transition and persists the run.
    ///
    /// # Errors
    /// * `InvalidTransition` - the current status does not permit the move
    /// * `NotFound` - unknown run
    pub async fn apply(&self, run_id: &RunId, transition: Transition) -> Result<Run> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;

        let mut run = self.store.get_run(run_id).await?;
        let from = run.status;
        let to = transition.target();
        if !transition.permitted_from(from) {
            error!(run_id = %run_id, from = %from, to = %to, "Invalid run transition");
            return Err(OrchestrationError::InvalidTransition { run_id: run_id.clone(), from, to });
        }

        match transition {
            Transition::Start => {
                run.attempt += 1;
                run.last_error = None;
            }
            Transition::Retry { resume_from } => {
                run.attempt += 1;
                if resume_from.is_none() {
                    run.progress = 0.0;
                    run.current_step = None;
                }
            }
            Transition::Complete | Transition::Cancel => {}
            Transition::Fail { error } => run.last_error = Some(error),
        }
        run.status = to;
        run.stalled = false;
        run.touch();
        self.store.update_run(&run).await?;

        info!(run_id = %run_id, from = %from, to = %to, attempt = run.attempt, "Run transition");
        if to.is_terminal() {
            self.locks.remove(run_id);
        }
        Ok(run)
    }

    /// Folds a parsed sample into the run's step and progress.
    ///
    /// Samples from a superseded attempt, or for a run that is no longer
    /// running, are ignored and `None` is returned. Progress never decreases
    /// within an attempt.
    pub async fn apply_sample(&self, run_id: &RunId, attempt: u32, sample: &MetricSample) -> Result<Option<Run>> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;

        let mut run = self.store.get_run(run_id).await?;
        if run.status != RunStatus::Running || run.attempt != attempt {
            debug!(run_id = %run_id, attempt, current = run.attempt, "Dropping sample from inactive attempt");
            return Ok(None);
        }

        if let Some(step) = sample.step {
            run.current_step = Some(run.current_step.map_or(step, |current| current.max(step)));
        }
        if let Some(progress) = sample.progress {
            run.progress = run.progress.max(progress.clamp(0.0, 1.0));
        }
        run.stalled = false;
        run.touch();
        self.store.update_run(&run).await?;
        Ok(Some(run))
    }

    /// Marks a running attempt as stalled, ahead of its retry.
    pub async fn flag_stalled(&self, run_id: &RunId, attempt: u32) -> Result<Option<Run>> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;

        let mut run = self.store.get_run(run_id).await?;
        if run.status != RunStatus::Running || run.attempt != attempt {
            return Ok(None);
        }
        run.stalled = true;
        run.touch();
        self.store.update_run(&run).await?;
        Ok(Some(run))
    }
}
