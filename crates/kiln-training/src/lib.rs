//! Kiln Training
//!
//! Data model and leaf services for orchestrating model-training runs:
//! - Runs, recipe kinds and configuration blobs (`Run`, `RecipeKind`, `RunConfig`)
//! - Checkpoints, manifests and cadence declarations
//! - Parsing raw training output into metric samples
//! - Artifact storage and persistence stores
//! - Hyperparameter recommendations

pub mod artifacts;
pub mod checkpoint;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod hyperparams;
pub mod layout;
pub mod metrics;
pub mod progress;
pub mod run;
pub mod store;

pub use artifacts::{ArtifactStorage, FsArtifactStorage, MemoryArtifactStorage, read_manifest, sha256_bytes};
pub use checkpoint::{
    Checkpoint, CheckpointCadence, CheckpointId, CheckpointManifest, MetricObjective, MetricSnapshot, StorageRef,
};
pub use dataset::{DatasetFormat, DatasetHandle, DatasetRef};
pub use error::{TrainingError, TrainingResult};
pub use evaluation::{
    EvalPrompt, Evaluation, EvaluationId, EvaluationMetrics, EvaluationStatus, EvaluationTarget, PromptResult,
    PromptSet,
};
pub use hyperparams::{Recommendations, recommend, recommended_learning_rate};
pub use layout::ArtifactLayout;
pub use metrics::MetricSample;
pub use progress::{FileLogSink, LogSink, MemoryLogSink, TracingLogSink};
pub use run::{ProjectId, RecipeFamily, RecipeKind, Run, RunConfig, RunId, RunStatus};
pub use store::{CheckpointStore, EvaluationStore, MemoryStore, RunStore, SqliteStore};
