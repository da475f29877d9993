// Error types for run orchestration

use kiln_training::{RunId, RunStatus, TrainingError};
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Orchestration errors
#[derive(Debug, Clone, Error)]
pub enum OrchestrationError {
    /// Bad recipe kind, configuration or dataset reference. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A start request raced an attempt that is already in flight.
    #[error("run {0} already has an active attempt")]
    AlreadyRunning(RunId),

    /// Cancellation of a run with no active attempt.
    #[error("run {0} has no active attempt")]
    NotRunning(RunId),

    /// Network or backend hiccup, retried up to the attempt budget.
    #[error("transient provider error: {0}")]
    TransientProvider(String),

    /// Permanent backend failure (malformed request, authentication).
    #[error("training backend error: {0}")]
    Backend(String),

    /// No metric sample within the stall timeout.
    #[error("run {run_id} produced no metric sample for {idle_secs}s")]
    StalledExecution {
        /// Stalled run
        run_id: RunId,
        /// Configured stall timeout in seconds
        idle_secs: u64,
    },

    /// Checkpoint write or read failure.
    #[error("artifact error: {0}")]
    Artifact(String),

    /// Unknown run, checkpoint or evaluation reference.
    #[error("not found: {0}")]
    NotFound(String),

    /// Checkpoint step not above the run's registered maximum.
    #[error("checkpoint step {step} for run {run_id} is not above the registered maximum {max_step}")]
    InvalidStepOrder {
        /// Run the checkpoint belongs to
        run_id: RunId,
        /// Rejected step
        step: u64,
        /// Highest registered step
        max_step: u64,
    },

    /// Transition not permitted by the run state machine.
    #[error("run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Run id
        run_id: RunId,
        /// Current status
        from: RunStatus,
        /// Requested status
        to: RunStatus,
    },

    /// Attempt stopped by a cancellation request.
    #[error("run {0} was cancelled")]
    Cancelled(RunId),

    /// Persistence failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid orchestrator configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<TrainingError> for OrchestrationError {
    fn from(err: TrainingError) -> Self {
        match err {
            TrainingError::InvalidConfig(msg) | TrainingError::Dataset(msg) => Self::Validation(msg),
            TrainingError::Artifact(msg) => Self::Artifact(msg),
            TrainingError::NotFound(what) => Self::NotFound(what),
            TrainingError::InvalidStepOrder { run_id, step, max_step } => {
                Self::InvalidStepOrder { run_id, step, max_step }
            }
            other @ (TrainingError::Storage(_)
            | TrainingError::Io(_)
            | TrainingError::Json(_)
            | TrainingError::Other(_)) => Self::Storage(other.to_string()),
        }
    }
}
