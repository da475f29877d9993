//! Recipe executor.
//!
//! One skeleton for every recipe kind: validate, resolve the dataset,
//! translate into provider parameters, submit, then turn the provider's event
//! stream into [`ExecutionEvent`]s. The terminal outcome is emitted exactly
//! once and nothing follows it.

use crate::backend::{
    BackendError, DatasetResolver, ProviderEvent, ProviderEventStream, ProviderSession, ResolveError, ResumePoint,
    SessionHandle, TrainingBackend,
};
use crate::error::{OrchestrationError, Result};
use crate::recipes::{FinalCheckpoint, Recipe, RecipeRegistry, translate};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use kiln_training::{Checkpoint, CheckpointCadence, MetricSnapshot, RecipeKind, Run};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Whether a failure may be followed by another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    Fatal,
}

#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub class: FailureClass,
    pub error: OrchestrationError,
}

impl AttemptFailure {
    pub fn retryable(error: OrchestrationError) -> Self {
        Self { class: FailureClass::Retryable, error }
    }

    pub fn fatal(error: OrchestrationError) -> Self {
        Self { class: FailureClass::Fatal, error }
    }

    pub fn is_retryable(&self) -> bool {
        self.class == FailureClass::Retryable
    }
}

impl From<BackendError> for AttemptFailure {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Transient(message) => Self::retryable(OrchestrationError::TransientProvider(message)),
            BackendError::Permanent(message) => Self::fatal(OrchestrationError::Backend(message)),
            BackendError::Unauthorized(message) => {
                Self::fatal(OrchestrationError::Backend(format!("unauthorized: {message}")))
            }
        }
    }
}

impl From<ResolveError> for AttemptFailure {
    fn from(error: ResolveError) -> Self {
        match error {
            ResolveError::NotFound(what) => Self::fatal(OrchestrationError::NotFound(format!("dataset {what}"))),
            ResolveError::InvalidFormat(message) => Self::fatal(OrchestrationError::Validation(message)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Succeeded,
    Failed(AttemptFailure),
}

/// A checkpoint reported during an attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointEvent {
    pub step: u64,
    pub location: Option<String>,
    pub metrics: MetricSnapshot,
    pub is_final: bool,
}

#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Log(String),
    /// Structured progress payload, fed to the metrics parser.
    Progress(Value),
    Checkpoint(CheckpointEvent),
    Outcome(AttemptOutcome),
}

/// What the runner needs to know about a run's recipe before it starts.
#[derive(Clone)]
pub struct ExecutionPlan {
    pub recipe: Arc<dyn Recipe>,
    pub cadence: CheckpointCadence,
}

impl ExecutionPlan {
    pub fn final_checkpoint(&self) -> FinalCheckpoint {
        self.recipe.final_checkpoint()
    }
}

impl fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("recipe", &self.recipe.kind())
            .field("cadence", &self.cadence)
            .finish()
    }
}

#[derive(Clone)]
pub struct RecipeExecutor {
    backend: Arc<dyn TrainingBackend>,
    resolver: Arc<dyn DatasetResolver>,
    recipes: RecipeRegistry,
    cadence_overrides: BTreeMap<RecipeKind, CheckpointCadence>,
}

impl fmt::Debug for RecipeExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecipeExecutor")
            .field("backend", &self.backend.name())
            .field("recipes", &self.recipes)
            .field("cadence_overrides", &self.cadence_overrides)
            .finish_non_exhaustive()
    }
}

impl RecipeExecutor {
    pub fn new(
        backend: Arc<dyn TrainingBackend>,
        resolver: Arc<dyn DatasetResolver>,
        recipes: RecipeRegistry,
        cadence_overrides: BTreeMap<RecipeKind, CheckpointCadence>,
    ) -> Self {
        Self { backend, resolver, recipes, cadence_overrides }
    }

    pub fn recipes(&self) -> &RecipeRegistry {
        &self.recipes
    }

    /// Validates the run and resolves its cadence.
    ///
    /// # Errors
    /// * `Validation` - see [`RecipeRegistry::validate_submission`]
    pub fn plan(&self, run: &Run) -> Result<ExecutionPlan> {
        let recipe = self.recipes.validate_submission(run)?;
        let cadence = self.recipes.cadence_for(recipe.as_ref(), &run.config, &self.cadence_overrides);
        Ok(ExecutionPlan { recipe, cadence })
    }

    /// Starts one attempt. Nothing happens until the first event is polled.
    pub fn execute(&self, run: Run, attempt: u32, resume: Option<Checkpoint>) -> ExecutionAttempt {
        let session = Arc::new(OnceLock::new());
        let pump = Pump {
            phase: Phase::Submit,
            pending: VecDeque::new(),
            executor: self.clone(),
            run,
            attempt,
            resume,
            session: Arc::clone(&session),
        };
        let events = stream::unfold(pump, Pump::advance).boxed();
        ExecutionAttempt { events, session, backend: Arc::clone(&self.backend), finished: false }
    }

    async fn submit(
        &self,
        run: &Run,
        attempt: u32,
        resume: Option<&Checkpoint>,
    ) -> std::result::Result<ProviderSession, AttemptFailure> {
        let plan = self.plan(run).map_err(AttemptFailure::fatal)?;

        let dataset = match &run.dataset {
            Some(dataset) => Some(self.resolver.resolve(dataset).await?),
            None => None,
        };

        let resume_point = resume.map(ResumePoint::from);
        let params = translate(plan.recipe.as_ref(), run, attempt, dataset, plan.cadence, resume_point)
            .map_err(AttemptFailure::fatal)?;

        info!(
            run_id = %run.id,
            attempt,
            recipe = %run.recipe,
            backend = self.backend.name(),
            start_step = params.start_step,
            "Submitting attempt"
        );
        Ok(self.backend.submit(&params).await?)
    }
}

enum Phase {
    Submit,
    Streaming(ProviderEventStream),
    Done,
}

struct Pump {
    phase: Phase,
    pending: VecDeque<ExecutionEvent>,
    executor: RecipeExecutor,
    run: Run,
    attempt: u32,
    resume: Option<Checkpoint>,
    session: Arc<OnceLock<SessionHandle>>,
}

impl Pump {
    async fn advance(mut self) -> Option<(ExecutionEvent, Self)> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some((event, self));
            }
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Done => return None,
                Phase::Submit => {
                    let submitted = self.executor.submit(&self.run, self.attempt, self.resume.as_ref()).await;
                    match submitted {
                        Ok(session) => {
                            debug!(run_id = %self.run.id, handle = %session.handle, "Backend session opened");
                            let _ = self.session.set(session.handle);
                            self.phase = Phase::Streaming(session.events);
                        }
                        Err(failure) => self.fail(failure),
                    }
                }
                Phase::Streaming(mut events) => {
                    let next = events.next().await;
                    match next {
                        Some(Ok(event)) => {
                            if !self.translate(event) {
                                self.phase = Phase::Streaming(events);
                            }
                        }
                        Some(Err(error)) => self.fail(error.into()),
                        None => self.fail(AttemptFailure::retryable(OrchestrationError::TransientProvider(
                            "backend stream ended without a terminal event".to_string(),
                        ))),
                    }
                }
            }
        }
    }

    fn fail(&mut self, failure: AttemptFailure) {
        warn!(
            run_id = %self.run.id,
            attempt = self.attempt,
            retryable = failure.is_retryable(),
            error = %failure.error,
            "Attempt failed"
        );
        self.pending.push_back(ExecutionEvent::Outcome(AttemptOutcome::Failed(failure)));
    }

    /// Queues the events for one provider event. Returns `true` when it was terminal.
    fn translate(&mut self, event: ProviderEvent) -> bool {
        match event {
            ProviderEvent::Output { line } => self.pending.push_back(ExecutionEvent::Log(line)),
            ProviderEvent::Metrics { values } => self.pending.push_back(ExecutionEvent::Progress(values)),
            ProviderEvent::Checkpoint(checkpoint) => {
                self.pending.push_back(ExecutionEvent::Checkpoint(CheckpointEvent {
                    step: checkpoint.step,
                    location: checkpoint.location,
                    metrics: checkpoint.metrics,
                    is_final: checkpoint.is_final,
                }));
            }
            ProviderEvent::Completed { final_checkpoint } => {
                if let Some(checkpoint) = final_checkpoint {
                    self.pending.push_back(ExecutionEvent::Checkpoint(CheckpointEvent {
                        step: checkpoint.step,
                        location: checkpoint.location,
                        metrics: checkpoint.metrics,
                        is_final: true,
                    }));
                }
                self.pending.push_back(ExecutionEvent::Outcome(AttemptOutcome::Succeeded));
                return true;
            }
            ProviderEvent::Failed { message, retryable } => {
                let failure = if retryable {
                    AttemptFailure::retryable(OrchestrationError::TransientProvider(message))
                } else {
                    AttemptFailure::fatal(OrchestrationError::Backend(message))
                };
                self.fail(failure);
                return true;
            }
        }
        false
    }
}

/// A live attempt. Yields events until its outcome.
pub struct ExecutionAttempt {
    events: BoxStream<'static, ExecutionEvent>,
    session: Arc<OnceLock<SessionHandle>>,
    backend: Arc<dyn TrainingBackend>,
    finished: bool,
}

impl fmt::Debug for ExecutionAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionAttempt")
            .field("session", &self.session.get())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl ExecutionAttempt {
    pub async fn next(&mut self) -> Option<ExecutionEvent> {
        if self.finished {
            return None;
        }
        let event = self.events.next().await;
        if matches!(event, Some(ExecutionEvent::Outcome(_)) | None) {
            self.finished = true;
        }
        event
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.get()
    }

    /// Stops the attempt, cancelling the backend job if it has not finished.
    pub async fn shutdown(self) {
        let Self { events, session, backend, finished } = self;
        drop(events);
        if finished {
            return;
        }
        if let Some(handle) = session.get() {
            if let Err(e) = backend.cancel(handle).await {
                warn!(handle = %handle, error = %e, "Failed to cancel backend session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{PassthroughResolver, ScriptedBackend};
    use kiln_training::{DatasetFormat, DatasetRef, ProjectId, RunConfig};
    use std::path::PathBuf;

    fn scripted_executor(script: &str) -> (RecipeExecutor, Arc<ScriptedBackend>) {
        let backend = Arc::new(ScriptedBackend::from_jsonl(script).unwrap());
        let executor = RecipeExecutor::new(
            backend.clone(),
            Arc::new(PassthroughResolver),
            RecipeRegistry::standard(),
            BTreeMap::new(),
        );
        (executor, backend)
    }

    fn sft_run() -> Run {
        Run::new(ProjectId::from("p"), RecipeKind::Sft, RunConfig::new().with("base_model", "modelA"), None)
    }

    async fn drain(mut attempt: ExecutionAttempt) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Some(event) = attempt.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_success_emits_final_checkpoint_then_outcome() {
        let (executor, _) = scripted_executor(
            r#"
{"event": "log", "line": "booting"}
{"event": "metrics", "values": {"step": 10, "progress": 0.1}}
{"event": "completed", "final_checkpoint": {"step": 100}}
{"event": "log", "line": "never seen"}
"#,
        );
        let events = drain(executor.execute(sft_run(), 1, None)).await;

        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], ExecutionEvent::Log(line) if line == "booting"));
        assert!(matches!(&events[1], ExecutionEvent::Progress(_)));
        assert!(matches!(&events[2], ExecutionEvent::Checkpoint(c) if c.step == 100 && c.is_final));
        assert!(matches!(events[3], ExecutionEvent::Outcome(AttemptOutcome::Succeeded)));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_retryable() {
        let (executor, _) = scripted_executor(r#"{"event": "log", "line": "x"}"#);
        let events = drain(executor.execute(sft_run(), 1, None)).await;
        let Some(ExecutionEvent::Outcome(AttemptOutcome::Failed(failure))) = events.last() else {
            panic!("expected a failure outcome, got {events:?}");
        };
        assert!(failure.is_retryable());
    }

    #[tokio::test]
    async fn test_classification_of_backend_errors() {
        let (executor, _) = scripted_executor(r#"{"event": "error", "kind": "permanent", "message": "bad model"}"#);
        let events = drain(executor.execute(sft_run(), 1, None)).await;
        assert!(matches!(
            &events[0],
            ExecutionEvent::Outcome(AttemptOutcome::Failed(f)) if f.class == FailureClass::Fatal
        ));

        let (executor, _) = scripted_executor(r#"{"event": "failed", "message": "preempted", "retryable": true}"#);
        let events = drain(executor.execute(sft_run(), 1, None)).await;
        assert!(matches!(
            &events[0],
            ExecutionEvent::Outcome(AttemptOutcome::Failed(f)) if f.is_retryable()
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_submission() {
        let (executor, backend) = scripted_executor(r#"{"event": "completed"}"#);
        let run = Run::new(ProjectId::from("p"), RecipeKind::Sft, RunConfig::new(), None);
        let events = drain(executor.execute(run, 1, None)).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ExecutionEvent::Outcome(AttemptOutcome::Failed(f))
                if f.class == FailureClass::Fatal && matches!(f.error, OrchestrationError::Validation(_))
        ));
        assert!(backend.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_missing_local_dataset_is_fatal() {
        let (executor, backend) = scripted_executor(r#"{"event": "completed"}"#);
        let dataset = DatasetRef::Local {
            path: PathBuf::from("/definitely/not/here.jsonl"),
            format: Some(DatasetFormat::Instruction),
        };
        let run =
            Run::new(ProjectId::from("p"), RecipeKind::Sft, RunConfig::new().with("base_model", "m"), Some(dataset));
        let events = drain(executor.execute(run, 1, None)).await;

        assert!(matches!(
            &events[0],
            ExecutionEvent::Outcome(AttemptOutcome::Failed(f)) if matches!(f.error, OrchestrationError::NotFound(_))
        ));
        assert!(backend.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_open_session() {
        let (executor, backend) = scripted_executor(
            r#"
{"event": "log", "line": "started"}
{"event": "hang"}
"#,
        );
        let mut attempt = executor.execute(sft_run(), 1, None);
        assert!(matches!(attempt.next().await, Some(ExecutionEvent::Log(_))));
        assert!(attempt.session().is_some());

        attempt.shutdown().await;
        assert_eq!(backend.cancelled().len(), 1);
    }
}
