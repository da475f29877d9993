//! Job runner.
//!
//! Accepts start and cancel requests, keeps one attempt in flight per run
//! through the lease registry, and supervises each attempt: output goes to the
//! log sink and metrics parser, checkpoint events to the checkpoint manager,
//! and the terminal outcome drives the state machine through retries and
//! terminal states. The lease is held across retries and released once, after
//! the final transition.

use crate::checkpoint::CheckpointManager;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestrationError, Result};
use crate::executor::{AttemptFailure, AttemptOutcome, ExecutionEvent, ExecutionPlan, RecipeExecutor};
use crate::lease::{LeaseRegistry, RunLease};
use crate::lifecycle::{RunStateMachine, Transition};
use crate::progress::{ProgressReporter, RunEvent, RunSnapshot};
use crate::recipes::FinalCheckpoint;
use chrono::Utc;
use kiln_training::metrics::{parse_line, parse_value};
use kiln_training::{Checkpoint, LogSink, MetricSample, MetricSnapshot, Run, RunId, RunStatus};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Retry and supervision limits.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSettings {
    /// Attempts per run, first attempt included.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub stall_timeout: Duration,
    pub max_concurrent_runs: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

impl RunnerSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            retry_backoff: config.retry_backoff(),
            stall_timeout: config.stall_timeout(),
            max_concurrent_runs: config.max_concurrent_runs,
        }
    }
}

/// Runs picked up by [`JobRunner::recover`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    /// Restarted as a new attempt.
    pub resumed: Vec<RunId>,
    /// Failed because their attempt budget was spent.
    pub failed: Vec<RunId>,
    /// Checkpoints rebuilt from orphaned manifests.
    pub recovered_checkpoints: usize,
}

enum AttemptResult {
    Succeeded,
    Failed(AttemptFailure),
    Cancelled,
}

enum Terminal {
    Completed,
    Failed(String),
    Cancelled,
}

/// State carried across the attempts of one run.
struct Supervision {
    run: Run,
    plan: ExecutionPlan,
    token: CancellationToken,
    /// Checkpoint of another run this one was started from.
    origin: Option<Checkpoint>,
    last_metrics: MetricSnapshot,
}

#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    machine: Arc<RunStateMachine>,
    checkpoints: Arc<CheckpointManager>,
    executor: RecipeExecutor,
    leases: LeaseRegistry,
    reporter: Arc<ProgressReporter>,
    log_sink: Arc<dyn LogSink>,
    permits: Arc<Semaphore>,
    settings: RunnerSettings,
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunner")
            .field("settings", &self.inner.settings)
            .field("leases", &self.inner.leases)
            .field("available_permits", &self.inner.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl JobRunner {
    pub fn new(
        machine: Arc<RunStateMachine>,
        checkpoints: Arc<CheckpointManager>,
        executor: RecipeExecutor,
        reporter: Arc<ProgressReporter>,
        log_sink: Arc<dyn LogSink>,
        settings: RunnerSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_runs.max(1)));
        Self {
            inner: Arc::new(RunnerInner {
                machine,
                checkpoints,
                executor,
                leases: LeaseRegistry::new(),
                reporter,
                log_sink,
                permits,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.inner.settings
    }

    pub fn is_active(&self, run_id: &RunId) -> bool {
        self.inner.leases.is_active(run_id)
    }

    /// Starts the first attempt of a pending run and returns it as `running`.
    ///
    /// Concurrent duplicate calls are safe: exactly one proceeds, the others
    /// get `AlreadyRunning` and change nothing.
    ///
    /// # Errors
    /// * `AlreadyRunning` - an attempt is in flight
    /// * `InvalidTransition` - the run already finished
    /// * `NotFound` - unknown run, or its resume checkpoint is missing
    pub async fn start(&self, run_id: &RunId) -> Result<Run> {
        let lease = self.inner.leases.try_acquire(run_id)?;
        let run = self.inner.machine.get(run_id).await?;
        match run.status {
            RunStatus::Pending => {}
            RunStatus::Running => return Err(OrchestrationError::AlreadyRunning(run_id.clone())),
            status => {
                return Err(OrchestrationError::InvalidTransition {
                    run_id: run_id.clone(),
                    from: status,
                    to: RunStatus::Running,
                });
            }
        }

        let origin = match &run.resume_from {
            Some(id) => Some(self.inner.checkpoints.get(id).await?),
            None => None,
        };

        let run = self.inner.machine.apply(run_id, Transition::Start).await?;
        self.inner.reporter.status_changed(&run);
        tokio::spawn(self.clone().supervise(lease, run.clone(), origin.clone(), origin));
        Ok(run)
    }

    /// Requests cancellation and returns once the attempt has stopped.
    ///
    /// # Errors
    /// * `NotRunning` - no attempt is in flight
    pub async fn cancel(&self, run_id: &RunId) -> Result<()> {
        info!(run_id = %run_id, "Cancellation requested");
        self.inner.leases.cancel_and_wait(run_id).await
    }

    /// Last known state, from the live snapshot when there is one.
    pub async fn status(&self, run_id: &RunId) -> Result<RunSnapshot> {
        if let Some(snapshot) = self.inner.reporter.snapshot(run_id) {
            return Ok(snapshot);
        }
        let run = self.inner.machine.get(run_id).await?;
        Ok(RunSnapshot::from_run(&run))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.reporter.subscribe()
    }

    /// Resolves once the run is terminal. Never resolves for a run nobody starts.
    pub async fn wait_for_terminal(&self, run_id: &RunId) -> Result<Run> {
        loop {
            let rx = self.inner.reporter.subscribe();
            let run = self.inner.machine.get(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            if ProgressReporter::wait_for_terminal(rx, run_id).await {
                return self.inner.machine.get(run_id).await;
            }
        }
    }

    /// Picks up runs left `running` by a previous process.
    ///
    /// Orphaned checkpoint manifests are registered first. Each run then
    /// restarts as a retry from its latest checkpoint, or fails when its
    /// attempt budget is spent.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for run in self.inner.machine.list(Some(RunStatus::Running)).await? {
            let Ok(lease) = self.inner.leases.try_acquire(&run.id) else {
                continue;
            };

            let recovered = self.inner.checkpoints.reconcile(&run.id).await?;
            report.recovered_checkpoints += recovered.len();
            for checkpoint in &recovered {
                self.inner.reporter.checkpoint_registered(checkpoint);
            }

            if run.attempt >= self.inner.settings.max_attempts {
                let error = format!(
                    "process stopped during attempt {}; retry budget exhausted after {} attempts",
                    run.attempt, run.attempt
                );
                let failed = self.inner.machine.apply(&run.id, Transition::Fail { error }).await?;
                error!(run_id = %run.id, attempt = failed.attempt, "Run failed during recovery");
                self.inner.checkpoints.release(&run.id);
                self.inner.reporter.status_changed(&failed);
                report.failed.push(run.id.clone());
                continue;
            }

            let origin = match &run.resume_from {
                Some(id) => self.inner.checkpoints.get(id).await.ok(),
                None => None,
            };
            let resume = self.inner.checkpoints.latest(&run.id).await?.or_else(|| origin.clone());
            let resumed = self
                .inner
                .machine
                .apply(&run.id, Transition::Retry { resume_from: resume.as_ref().map(|c| c.id.clone()) })
                .await?;
            info!(run_id = %run.id, attempt = resumed.attempt, "Recovered run restarted");
            self.inner.reporter.status_changed(&resumed);
            tokio::spawn(self.clone().supervise(lease, resumed, resume, origin));
            report.resumed.push(run.id.clone());
        }
        Ok(report)
    }

    async fn supervise(self, lease: RunLease, run: Run, resume: Option<Checkpoint>, origin: Option<Checkpoint>) {
        let run_id = run.id.clone();
        let token = lease.cancellation().clone();

        let permit = tokio::select! {
            permit = Arc::clone(&self.inner.permits).acquire_owned() => permit.ok(),
            () = token.cancelled() => None,
        };

        let terminal = match (permit.is_some(), self.inner.executor.plan(&run)) {
            _ if token.is_cancelled() => Terminal::Cancelled,
            (false, _) => Terminal::Failed("worker pool is shut down".to_string()),
            (true, Err(e)) => Terminal::Failed(e.to_string()),
            (true, Ok(plan)) => {
                let mut supervision =
                    Supervision { run, plan, token, origin, last_metrics: MetricSnapshot::new() };
                self.run_attempts(&mut supervision, resume).await
            }
        };

        self.finish(&run_id, terminal).await;
        drop(permit);
        drop(lease);
    }

    async fn run_attempts(&self, sup: &mut Supervision, mut resume: Option<Checkpoint>) -> Terminal {
        let settings = &self.inner.settings;
        let mut attempt = sup.run.attempt;
        loop {
            let failure = match self.drive_attempt(sup, attempt, resume.take()).await {
                AttemptResult::Cancelled => return Terminal::Cancelled,
                AttemptResult::Succeeded => match self.settle_success(sup).await {
                    Ok(()) => return Terminal::Completed,
                    Err(failure) => failure,
                },
                AttemptResult::Failed(failure) => failure,
            };

            if !failure.is_retryable() {
                return Terminal::Failed(failure.error.to_string());
            }
            if attempt >= settings.max_attempts {
                return Terminal::Failed(format!(
                    "retry budget exhausted after {attempt} attempts: {}",
                    failure.error
                ));
            }

            warn!(
                run_id = %sup.run.id,
                attempt,
                backoff_ms = settings.retry_backoff.as_millis() as u64,
                error = %failure.error,
                "Retrying run"
            );
            tokio::select! {
                () = tokio::time::sleep(settings.retry_backoff) => {}
                () = sup.token.cancelled() => return Terminal::Cancelled,
            }

            resume = match self.inner.checkpoints.latest(&sup.run.id).await {
                Ok(latest) => latest.or_else(|| sup.origin.clone()),
                Err(e) => return Terminal::Failed(e.to_string()),
            };
            let transition = Transition::Retry { resume_from: resume.as_ref().map(|c| c.id.clone()) };
            match self.inner.machine.apply(&sup.run.id, transition).await {
                Ok(run) => {
                    self.inner.reporter.status_changed(&run);
                    attempt = run.attempt;
                }
                Err(e) => return Terminal::Failed(e.to_string()),
            }
        }
    }

    async fn drive_attempt(&self, sup: &mut Supervision, attempt: u32, resume: Option<Checkpoint>) -> AttemptResult {
        let run_id = sup.run.id.clone();
        let stall_timeout = self.inner.settings.stall_timeout;
        let mut execution = self.inner.executor.execute(sup.run.clone(), attempt, resume);
        let mut deadline = Instant::now() + stall_timeout;

        let result = loop {
            let next = tokio::select! {
                biased;
                () = sup.token.cancelled() => None,
                next = tokio::time::timeout_at(deadline, execution.next()) => Some(next),
            };
            let Some(next) = next else {
                break AttemptResult::Cancelled;
            };
            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => {
                    break AttemptResult::Failed(AttemptFailure::retryable(OrchestrationError::TransientProvider(
                        "attempt ended without an outcome".to_string(),
                    )));
                }
                Err(_) => {
                    let idle_secs = stall_timeout.as_secs();
                    warn!(run_id = %run_id, attempt, idle_secs, "Attempt stalled");
                    match self.inner.machine.flag_stalled(&run_id, attempt).await {
                        Ok(Some(run)) => self.inner.reporter.stalled(&run, idle_secs),
                        Ok(None) => {}
                        Err(e) => warn!(run_id = %run_id, error = %e, "Failed to flag stalled run"),
                    }
                    break AttemptResult::Failed(AttemptFailure::retryable(OrchestrationError::StalledExecution {
                        run_id: run_id.clone(),
                        idle_secs,
                    }));
                }
            };

            // Cancellation is observed at every event boundary.
            if sup.token.is_cancelled() {
                break AttemptResult::Cancelled;
            }

            match event {
                ExecutionEvent::Log(line) => {
                    self.inner.log_sink.write_line(&run_id, attempt, &line);
                    self.inner.reporter.log(&run_id, attempt, &line);
                    if let Some(sample) = parse_line(&line) {
                        if self.apply_sample(sup, attempt, &sample).await {
                            deadline = Instant::now() + stall_timeout;
                        }
                    }
                }
                ExecutionEvent::Progress(values) => match parse_value(&values, Utc::now()) {
                    Some(sample) => {
                        if self.apply_sample(sup, attempt, &sample).await {
                            deadline = Instant::now() + stall_timeout;
                        }
                    }
                    None => warn!(run_id = %run_id, attempt, "Progress payload without usable metrics"),
                },
                ExecutionEvent::Checkpoint(event) => match self.inner.checkpoints.record(&run_id, &event).await {
                    Ok(checkpoint) => {
                        sup.last_metrics.extend(checkpoint.metrics.clone());
                        self.inner.reporter.checkpoint_registered(&checkpoint);
                    }
                    Err(OrchestrationError::InvalidStepOrder { step, max_step, .. }) => {
                        warn!(run_id = %run_id, attempt, step, max_step, "Skipping stale checkpoint");
                    }
                    Err(e @ OrchestrationError::Artifact(_)) => break AttemptResult::Failed(AttemptFailure::fatal(e)),
                    Err(e) => break AttemptResult::Failed(AttemptFailure::retryable(e)),
                },
                ExecutionEvent::Outcome(AttemptOutcome::Succeeded) => break AttemptResult::Succeeded,
                ExecutionEvent::Outcome(AttemptOutcome::Failed(failure)) => break AttemptResult::Failed(failure),
            }
        };

        execution.shutdown().await;
        result
    }

    /// Folds a sample into the run. Returns `true` when it was applied.
    async fn apply_sample(&self, sup: &mut Supervision, attempt: u32, sample: &MetricSample) -> bool {
        match self.inner.machine.apply_sample(&sup.run.id, attempt, sample).await {
            Ok(Some(run)) => {
                sup.last_metrics.extend(sample.snapshot());
                self.inner.reporter.progress(&run, sample);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(run_id = %sup.run.id, attempt, error = %e, "Failed to apply metric sample");
                false
            }
        }
    }

    /// Checks the terminal checkpoint a successful attempt must leave behind.
    async fn settle_success(&self, sup: &Supervision) -> std::result::Result<(), AttemptFailure> {
        if !sup.plan.cadence.produces_checkpoints() {
            return Ok(());
        }
        let run_id = &sup.run.id;
        let checkpoints = &self.inner.checkpoints;
        if checkpoints.final_checkpoint(run_id).await.map_err(AttemptFailure::retryable)?.is_some() {
            return Ok(());
        }

        match sup.plan.final_checkpoint() {
            FinalCheckpoint::Reported => Err(AttemptFailure::fatal(OrchestrationError::Artifact(format!(
                "{} run {run_id} completed without a final checkpoint",
                sup.plan.recipe.kind()
            )))),
            FinalCheckpoint::Synthesized => {
                let run = self.inner.machine.get(run_id).await.map_err(AttemptFailure::retryable)?;
                let latest = checkpoints.latest(run_id).await.map_err(AttemptFailure::retryable)?;
                let step = run.current_step.unwrap_or(0).max(latest.map_or(0, |c| c.step.saturating_add(1)));
                let checkpoint = checkpoints
                    .synthesize_final(run_id, step, sup.last_metrics.clone())
                    .await
                    .map_err(AttemptFailure::fatal)?;
                self.inner.reporter.checkpoint_registered(&checkpoint);
                Ok(())
            }
        }
    }

    async fn finish(&self, run_id: &RunId, terminal: Terminal) {
        let transition = match terminal {
            Terminal::Completed => Transition::Complete,
            Terminal::Failed(error) => Transition::Fail { error },
            Terminal::Cancelled => Transition::Cancel,
        };
        match self.inner.machine.apply(run_id, transition).await {
            Ok(run) => {
                match run.status {
                    RunStatus::Failed => {
                        error!(run_id = %run_id, attempt = run.attempt, error = ?run.last_error, "Run failed");
                    }
                    status => info!(run_id = %run_id, attempt = run.attempt, status = %status, "Run finished"),
                }
                self.inner.checkpoints.release(run_id);
                self.inner.reporter.status_changed(&run);
            }
            Err(e) => error!(run_id = %run_id, error = %e, "Failed to record terminal state"),
        }
    }
}
