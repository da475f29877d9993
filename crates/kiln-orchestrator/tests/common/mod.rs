//! Shared helpers for the orchestrator integration tests.
#![allow(dead_code)]

use kiln_orchestrator::{Orchestrator, OrchestratorConfig, RunEvent, RunnerSettings, ScriptedBackend, ScriptedSampler};
use kiln_training::{MemoryArtifactStorage, MemoryLogSink, MemoryStore, ProjectId, RecipeKind, Run, RunConfig, RunId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub backend: Arc<ScriptedBackend>,
    pub store: Arc<MemoryStore>,
    pub artifacts: Arc<MemoryArtifactStorage>,
    pub logs: Arc<MemoryLogSink>,
}

/// Fast limits: three attempts, short backoff, generous stall timeout.
pub fn settings() -> RunnerSettings {
    RunnerSettings {
        max_attempts: 3,
        retry_backoff: Duration::from_millis(10),
        stall_timeout: Duration::from_secs(5),
        max_concurrent_runs: 4,
    }
}

pub fn harness(script: &str) -> Harness {
    harness_with(script, settings(), Arc::new(MemoryStore::new()), Arc::new(MemoryArtifactStorage::new()))
}

pub fn harness_with(
    script: &str,
    settings: RunnerSettings,
    store: Arc<MemoryStore>,
    artifacts: Arc<MemoryArtifactStorage>,
) -> Harness {
    build(script, OrchestratorConfig::default(), settings, store, artifacts)
}

/// Default settings and in-memory stores under a custom engine config.
pub fn harness_with_config(script: &str, config: OrchestratorConfig) -> Harness {
    build(script, config, settings(), Arc::new(MemoryStore::new()), Arc::new(MemoryArtifactStorage::new()))
}

fn build(
    script: &str,
    config: OrchestratorConfig,
    settings: RunnerSettings,
    store: Arc<MemoryStore>,
    artifacts: Arc<MemoryArtifactStorage>,
) -> Harness {
    let backend = Arc::new(ScriptedBackend::from_jsonl(script).expect("script should parse"));
    let logs = Arc::new(MemoryLogSink::new());
    let orchestrator = Orchestrator::builder(config)
        .backend(backend.clone())
        .store(store.clone())
        .artifacts(artifacts.clone())
        .sampler(Arc::new(
            ScriptedSampler::new().respond("What is 2+2?", "The answer is 4.").fail("broken", "sampler offline"),
        ))
        .log_sink(logs.clone())
        .runner_settings(settings)
        .build()
        .expect("orchestrator should build");
    Harness { orchestrator: Arc::new(orchestrator), backend, store, artifacts, logs }
}

pub fn config(model: &str) -> RunConfig {
    RunConfig::new().with("base_model", model)
}

pub async fn submit(orchestrator: &Orchestrator, recipe: RecipeKind, config: RunConfig) -> Run {
    orchestrator.submit_run(ProjectId::from("project"), recipe, config, None).await.expect("submission should pass")
}

/// Waits for a terminal status, failing the test after ten seconds.
pub async fn finish(orchestrator: &Orchestrator, run_id: &RunId) -> Run {
    tokio::time::timeout(Duration::from_secs(10), orchestrator.wait_for_terminal(run_id))
        .await
        .expect("run should finish in time")
        .expect("run should exist")
}

/// Waits for the first event of `run_id` matching `pred`.
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<RunEvent>, run_id: &RunId, pred: F) -> RunEvent
where
    F: Fn(&RunEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if event.run_id() == run_id && pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event should arrive in time")
}
