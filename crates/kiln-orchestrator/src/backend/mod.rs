//! Contracts of the external collaborators the engine drives: the remote
//! training backend, the dataset resolver and the evaluation sampler.

mod scripted;

pub use scripted::{ScriptErrorKind, ScriptStep, ScriptedBackend, ScriptedSampler};

use async_trait::async_trait;
use futures::stream::BoxStream;
use kiln_training::{
    Checkpoint, CheckpointCadence, CheckpointId, DatasetHandle, DatasetRef, MetricSnapshot, RecipeKind, RunId,
    StorageRef,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors raised by a training backend or sampler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Network hiccup, rate limit, provider restart.
    #[error("transient: {0}")]
    Transient(String),

    /// Malformed request or unsupported model combination.
    #[error("permanent: {0}")]
    Permanent(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Checkpoint the backend resumes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub checkpoint_id: CheckpointId,
    pub storage_ref: StorageRef,
    /// Provider-side location recorded with the checkpoint.
    #[serde(default)]
    pub location: Option<String>,
    pub step: u64,
}

impl From<&Checkpoint> for ResumePoint {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            checkpoint_id: checkpoint.id.clone(),
            storage_ref: checkpoint.storage_ref.clone(),
            location: checkpoint.source.clone(),
            step: checkpoint.step,
        }
    }
}

/// Invocation parameters produced by a recipe's translation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderParams {
    pub run_id: RunId,
    pub attempt: u32,
    pub recipe: RecipeKind,
    pub base_model: String,
    #[serde(default)]
    pub dataset: Option<DatasetHandle>,
    pub hyperparameters: BTreeMap<String, serde_json::Value>,
    pub cadence: CheckpointCadence,
    #[serde(default)]
    pub resume_from: Option<ResumePoint>,
    /// Steps reported by the backend must be numbered above this value.
    pub start_step: u64,
}

/// A checkpoint as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCheckpoint {
    pub step: u64,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub metrics: MetricSnapshot,
    #[serde(default)]
    pub is_final: bool,
}

/// One event on a backend session stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProviderEvent {
    /// Raw output line.
    Output { line: String },
    /// Structured metrics payload.
    Metrics { values: serde_json::Value },
    Checkpoint(ProviderCheckpoint),
    Completed {
        #[serde(default)]
        final_checkpoint: Option<ProviderCheckpoint>,
    },
    Failed {
        message: String,
        #[serde(default)]
        retryable: bool,
    },
}

/// Opaque identifier of a submitted backend job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub String);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub type ProviderEventStream = BoxStream<'static, Result<ProviderEvent, BackendError>>;

/// A live backend job and its event stream.
pub struct ProviderSession {
    pub handle: SessionHandle,
    pub events: ProviderEventStream,
}

impl fmt::Debug for ProviderSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSession").field("handle", &self.handle).finish_non_exhaustive()
    }
}

/// Remote training backend.
#[async_trait]
pub trait TrainingBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, params: &ProviderParams) -> Result<ProviderSession, BackendError>;

    async fn cancel(&self, handle: &SessionHandle) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("dataset not found: {0}")]
    NotFound(String),

    #[error("dataset has an invalid format: {0}")]
    InvalidFormat(String),
}

/// Turns a dataset reference into something a recipe can consume.
#[async_trait]
pub trait DatasetResolver: Send + Sync {
    async fn resolve(&self, dataset: &DatasetRef) -> Result<DatasetHandle, ResolveError>;
}

/// Resolver that hands references through unchanged. Local paths must exist.
#[derive(Debug, Default)]
pub struct PassthroughResolver;

#[async_trait]
impl DatasetResolver for PassthroughResolver {
    async fn resolve(&self, dataset: &DatasetRef) -> Result<DatasetHandle, ResolveError> {
        if let DatasetRef::Local { path, .. } = dataset {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(ResolveError::NotFound(path.display().to_string()));
            }
        }
        Ok(DatasetHandle { uri: dataset.to_string(), format: dataset.format() })
    }
}

/// Samples completions from a checkpoint for evaluation.
#[async_trait]
pub trait Sampler: Send + Sync {
    async fn sample(&self, checkpoint: &Checkpoint, prompt: &str) -> Result<String, BackendError>;
}
