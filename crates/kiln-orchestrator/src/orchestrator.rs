//! The orchestration facade consumed by the presentation layer.

use crate::backend::{DatasetResolver, PassthroughResolver, Sampler, TrainingBackend};
use crate::checkpoint::CheckpointManager;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestrationError, Result};
use crate::evaluation::EvaluationRunner;
use crate::executor::RecipeExecutor;
use crate::lifecycle::RunStateMachine;
use crate::progress::{ProgressReporter, RunEvent, RunSnapshot};
use crate::recipes::RecipeRegistry;
use crate::runner::{JobRunner, RecoveryReport, RunnerSettings};
use kiln_training::{
    ArtifactLayout, ArtifactStorage, Checkpoint, CheckpointId, CheckpointStore, DatasetRef, Evaluation, EvaluationId,
    EvaluationStore, EvaluationTarget, FsArtifactStorage, LogSink, MemoryStore, MetricObjective, ProjectId,
    PromptSet, RecipeKind, Run, RunConfig, RunId, RunStatus, RunStore, SqliteStore, TracingLogSink,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Assembles an [`Orchestrator`] from its collaborators.
///
/// Only the training backend is mandatory. Stores default to SQLite when the
/// config names a database and to memory otherwise; artifacts default to the
/// filesystem under `artifact_root`.
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    backend: Option<Arc<dyn TrainingBackend>>,
    runs: Option<Arc<dyn RunStore>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    evaluations: Option<Arc<dyn EvaluationStore>>,
    artifacts: Option<Arc<dyn ArtifactStorage>>,
    resolver: Option<Arc<dyn DatasetResolver>>,
    sampler: Option<Arc<dyn Sampler>>,
    log_sink: Option<Arc<dyn LogSink>>,
    recipes: Option<RecipeRegistry>,
    settings: Option<RunnerSettings>,
}

impl OrchestratorBuilder {
    #[must_use]
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config, ..Self::default() }
    }

    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn TrainingBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Uses one store for runs, checkpoints and evaluations.
    #[must_use]
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: RunStore + CheckpointStore + EvaluationStore + 'static,
    {
        let (runs, checkpoints, evaluations) = split_store(store);
        self.runs = Some(runs);
        self.checkpoints = Some(checkpoints);
        self.evaluations = Some(evaluations);
        self
    }

    #[must_use]
    pub fn artifacts(mut self, artifacts: Arc<dyn ArtifactStorage>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn DatasetResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    #[must_use]
    pub fn log_sink(mut self, log_sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(log_sink);
        self
    }

    #[must_use]
    pub fn recipes(mut self, recipes: RecipeRegistry) -> Self {
        self.recipes = Some(recipes);
        self
    }

    /// Overrides the limits derived from the config.
    #[must_use]
    pub fn runner_settings(mut self, settings: RunnerSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        let backend =
            self.backend.ok_or_else(|| OrchestrationError::Config("no training backend configured".to_string()))?;

        let (runs, checkpoint_store, evaluation_store) = match (self.runs, self.checkpoints, self.evaluations) {
            (Some(runs), Some(checkpoints), Some(evaluations)) => (runs, checkpoints, evaluations),
            _ => default_stores(&self.config)?,
        };
        let artifacts: Arc<dyn ArtifactStorage> = match self.artifacts {
            Some(artifacts) => artifacts,
            None => Arc::new(FsArtifactStorage::new(ArtifactLayout::new(self.config.artifact_root.clone()))?),
        };

        let machine = Arc::new(RunStateMachine::new(runs));
        let checkpoints = Arc::new(CheckpointManager::new(checkpoint_store, artifacts));
        let reporter = Arc::new(ProgressReporter::new());
        let executor = RecipeExecutor::new(
            backend,
            self.resolver.unwrap_or_else(|| Arc::new(PassthroughResolver)),
            self.recipes.unwrap_or_else(RecipeRegistry::standard),
            self.config.cadence_overrides()?,
        );
        let settings = self.settings.unwrap_or_else(|| RunnerSettings::from_config(&self.config));
        let runner = JobRunner::new(
            Arc::clone(&machine),
            Arc::clone(&checkpoints),
            executor.clone(),
            Arc::clone(&reporter),
            self.log_sink.unwrap_or_else(|| Arc::new(TracingLogSink)),
            settings,
        );
        let evaluations = self.sampler.map(|sampler| {
            EvaluationRunner::new(evaluation_store, Arc::clone(&checkpoints), sampler, self.config.eval_concurrency)
        });

        Ok(Orchestrator { config: self.config, machine, checkpoints, executor, runner, reporter, evaluations })
    }
}

type Stores = (Arc<dyn RunStore>, Arc<dyn CheckpointStore>, Arc<dyn EvaluationStore>);

fn default_stores(config: &OrchestratorConfig) -> Result<Stores> {
    if let Some(path) = &config.database {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| OrchestrationError::Config(format!("{}: {}", parent.display(), e)))?;
        }
        let store = Arc::new(SqliteStore::open(path)?);
        info!(path = %path.display(), "Using SQLite store");
        Ok(split_store(store))
    } else {
        Ok(split_store(Arc::new(MemoryStore::new())))
    }
}

fn split_store<S>(store: Arc<S>) -> Stores
where
    S: RunStore + CheckpointStore + EvaluationStore + 'static,
{
    let runs: Arc<dyn RunStore> = store.clone();
    let checkpoints: Arc<dyn CheckpointStore> = store.clone();
    let evaluations: Arc<dyn EvaluationStore> = store;
    (runs, checkpoints, evaluations)
}

/// Run Orchestration Engine.
///
/// Every operation is safe to call concurrently from any task.
pub struct Orchestrator {
    config: OrchestratorConfig,
    machine: Arc<RunStateMachine>,
    checkpoints: Arc<CheckpointManager>,
    executor: RecipeExecutor,
    runner: JobRunner,
    reporter: Arc<ProgressReporter>,
    evaluations: Option<EvaluationRunner>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("runner", &self.runner)
            .field("reporter", &self.reporter)
            .field("evaluations", &self.evaluations.is_some())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn recipes(&self) -> &RecipeRegistry {
        self.executor.recipes()
    }

    /// Validates and persists a new run in `pending`.
    ///
    /// # Errors
    /// * `Validation` - unsupported recipe kind, bad config or dataset mismatch
    pub async fn submit_run(
        &self,
        project_id: ProjectId,
        recipe: RecipeKind,
        config: RunConfig,
        dataset: Option<DatasetRef>,
    ) -> Result<Run> {
        let run = Run::new(project_id, recipe, config, dataset);
        self.executor.plan(&run)?;
        self.machine.insert(&run).await?;
        Ok(run)
    }

    /// Like [`Self::submit_run`], but the first attempt resumes from a
    /// checkpoint of another run.
    ///
    /// # Errors
    /// * `NotFound` - unknown checkpoint
    pub async fn submit_run_from_checkpoint(
        &self,
        project_id: ProjectId,
        recipe: RecipeKind,
        config: RunConfig,
        dataset: Option<DatasetRef>,
        checkpoint_id: &CheckpointId,
    ) -> Result<Run> {
        let origin = self.checkpoints.get(checkpoint_id).await?;
        let mut run = Run::new(project_id, recipe, config, dataset);
        run.resume_from = Some(origin.id);
        self.executor.plan(&run)?;
        self.machine.insert(&run).await?;
        Ok(run)
    }

    pub async fn start_run(&self, run_id: &RunId) -> Result<Run> {
        self.runner.start(run_id).await
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<Run> {
        self.machine.get(run_id).await
    }

    pub async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<Run>> {
        self.machine.list(status).await
    }

    pub async fn run_status(&self, run_id: &RunId) -> Result<RunSnapshot> {
        self.runner.status(run_id).await
    }

    /// Returns once the in-flight attempt has stopped and the run is `cancelled`.
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<()> {
        self.runner.cancel(run_id).await
    }

    /// Checkpoints of a run in step order.
    pub async fn list_checkpoints(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        self.checkpoints.list(run_id).await
    }

    pub async fn get_checkpoint(&self, id: &CheckpointId) -> Result<Checkpoint> {
        self.checkpoints.get(id).await
    }

    pub async fn latest_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint>> {
        self.checkpoints.latest(run_id).await
    }

    pub async fn best_checkpoint(
        &self,
        run_id: &RunId,
        metric: &str,
        objective: MetricObjective,
    ) -> Result<Option<Checkpoint>> {
        self.checkpoints.best(run_id, metric, objective).await
    }

    fn evaluation_runner(&self) -> Result<&EvaluationRunner> {
        self.evaluations.as_ref().ok_or_else(|| OrchestrationError::Config("no sampler configured".to_string()))
    }

    pub async fn request_evaluation(&self, target: EvaluationTarget, prompt_set: PromptSet) -> Result<Evaluation> {
        self.evaluation_runner()?.evaluate(target, prompt_set).await
    }

    pub async fn evaluate_many(&self, requests: Vec<(EvaluationTarget, PromptSet)>) -> Result<Vec<Result<Evaluation>>> {
        Ok(self.evaluation_runner()?.evaluate_many(requests).await)
    }

    pub async fn get_evaluation(&self, id: &EvaluationId) -> Result<Evaluation> {
        self.evaluation_runner()?.get(id).await
    }

    pub async fn list_evaluations(&self, run_id: &RunId) -> Result<Vec<Evaluation>> {
        self.evaluation_runner()?.list(run_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.runner.subscribe()
    }

    pub async fn wait_for_terminal(&self, run_id: &RunId) -> Result<Run> {
        self.runner.wait_for_terminal(run_id).await
    }

    /// Resumes runs a previous process left `running`. Call once at startup.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let report = self.runner.recover().await?;
        info!(
            resumed = report.resumed.len(),
            failed = report.failed.len(),
            recovered_checkpoints = report.recovered_checkpoints,
            "Recovery finished"
        );
        Ok(report)
    }
}
