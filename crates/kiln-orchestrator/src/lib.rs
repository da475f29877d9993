//! Run orchestration engine for Kiln.
//!
//! Accepts training runs, validates them against the recipe table, drives
//! each through one or more execution attempts against a remote training
//! backend, records checkpoints and metrics, and evaluates finished runs.
//!
//! The [`Orchestrator`] facade is the entry point; the modules below are its
//! building blocks and can be assembled separately in tests.

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod executor;
pub mod lease;
pub mod lifecycle;
pub mod orchestrator;
pub mod progress;
pub mod recipes;
pub mod runner;

pub use backend::{
    BackendError, DatasetResolver, PassthroughResolver, ProviderEvent, ProviderParams, ResolveError, Sampler,
    ScriptStep, ScriptedBackend, ScriptedSampler, TrainingBackend,
};
pub use checkpoint::CheckpointManager;
pub use config::{ConfigLayer, OrchestratorConfig};
pub use error::{OrchestrationError, Result};
pub use evaluation::EvaluationRunner;
pub use executor::{AttemptFailure, AttemptOutcome, ExecutionEvent, FailureClass, RecipeExecutor};
pub use lease::{LeaseRegistry, RunLease};
pub use lifecycle::{RunStateMachine, Transition};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use progress::{ProgressReporter, RunEvent, RunSnapshot};
pub use recipes::{DatasetRequirement, FinalCheckpoint, Recipe, RecipeRegistry};
pub use runner::{JobRunner, RecoveryReport, RunnerSettings};
