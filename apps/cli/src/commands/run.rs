//! `kiln run` - drive a single run to a terminal status against a scripted
//! backend and render its events as they arrive.

use anyhow::{Context, Result, bail};
use colored::Colorize;
use kiln_orchestrator::{Orchestrator, OrchestratorConfig, RunEvent, ScriptedBackend};
use kiln_training::{
    ArtifactLayout, DatasetFormat, DatasetRef, FileLogSink, ProjectId, RecipeKind, Run, RunConfig, RunId, RunStatus,
};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug)]
pub struct RunOptions {
    pub recipe: RecipeKind,
    pub run_config: PathBuf,
    pub script: PathBuf,
    pub dataset: Option<String>,
    pub dataset_format: Option<String>,
    pub project: String,
}

pub async fn execute(config: OrchestratorConfig, options: RunOptions, json_output: bool) -> Result<()> {
    let run_config = load_run_config(&options.run_config)?;
    let dataset = options.dataset.as_deref().map(|d| parse_dataset(d, options.dataset_format.as_deref())).transpose()?;
    let script = std::fs::read_to_string(&options.script)
        .with_context(|| format!("Failed to read script {}", options.script.display()))?;
    let backend = Arc::new(ScriptedBackend::from_jsonl(&script)?);
    let log_sink = Arc::new(FileLogSink::new(ArtifactLayout::new(config.artifact_root.clone())));

    let orchestrator = Orchestrator::builder(config).backend(backend).log_sink(log_sink).build()?;

    let run = orchestrator.submit_run(ProjectId::from(options.project.as_str()), options.recipe, run_config, dataset).await?;
    if !json_output {
        println!("{} {} ({})", "Submitted".bold().cyan(), run.id, run.recipe);
    }

    let mut events = orchestrator.subscribe();
    orchestrator.start_run(&run.id).await?;
    follow(&orchestrator, &run.id, &mut events, json_output).await?;

    let finished = orchestrator.wait_for_terminal(&run.id).await?;
    let checkpoints = orchestrator.list_checkpoints(&run.id).await?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&json!({ "run": finished, "checkpoints": checkpoints }))?);
    } else {
        print_summary(&finished, checkpoints.len());
    }

    match finished.status {
        RunStatus::Completed => Ok(()),
        status => bail!(
            "run {} ended {}{}",
            finished.id,
            status,
            finished.last_error.as_deref().map(|e| format!(": {e}")).unwrap_or_default()
        ),
    }
}

/// Renders events for `run_id` until it reaches a terminal status. Ctrl-C
/// cancels the run and keeps following until the cancellation lands.
async fn follow(
    orchestrator: &Orchestrator,
    run_id: &RunId,
    events: &mut broadcast::Receiver<RunEvent>,
    json_output: bool,
) -> Result<()> {
    let mut cancel_requested = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if event.run_id() == run_id => {
                    if !json_output {
                        render(&event);
                    }
                    if let RunEvent::StatusChanged { status, .. } = event
                        && status.is_terminal()
                    {
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            signal = tokio::signal::ctrl_c(), if !cancel_requested => {
                signal.context("Failed to listen for Ctrl-C")?;
                cancel_requested = true;
                eprintln!("{}", "Cancelling run...".yellow());
                if let Err(e) = orchestrator.cancel_run(run_id).await {
                    warn!(run_id = %run_id, error = %e, "Cancel request failed");
                }
            }
        }
    }
}

fn render(event: &RunEvent) {
    match event {
        RunEvent::StatusChanged { status, attempt, error, .. } => {
            let line = format!("status {status} (attempt {attempt})");
            match error {
                Some(error) => println!("{} {}", line.bold(), error.red()),
                None => println!("{}", line.bold()),
            }
        }
        RunEvent::Progress { sample, .. } => {
            let mut parts = Vec::new();
            if let Some(step) = sample.step {
                parts.push(format!("step={step}"));
            }
            if let Some(loss) = sample.loss {
                parts.push(format!("loss={loss:.4}"));
            }
            if let Some(progress) = sample.progress {
                parts.push(format!("progress={:.1}%", progress * 100.0));
            }
            println!("  {} {}", "metrics".cyan(), parts.join(" "));
        }
        RunEvent::CheckpointRegistered { checkpoint } => {
            let kind = if checkpoint.is_final { "final checkpoint" } else { "checkpoint" };
            println!("  {} step {} ({})", kind.green(), checkpoint.step, checkpoint.id);
        }
        RunEvent::Stalled { attempt, idle_secs, .. } => {
            println!("  {} attempt {attempt} idle for {idle_secs}s", "stalled".yellow());
        }
        RunEvent::Log { line, .. } => println!("  {}", line.dimmed()),
    }
}

fn print_summary(run: &Run, checkpoints: usize) {
    println!();
    let status = match run.status {
        RunStatus::Completed => run.status.to_string().green().bold(),
        _ => run.status.to_string().red().bold(),
    };
    println!("{} {}", "Run".bold(), run.id);
    println!("  {:<12} {}", "Status", status);
    println!("  {:<12} {}", "Attempts", run.attempt);
    println!("  {:<12} {}", "Step", run.current_step.map_or_else(|| "-".to_string(), |s| s.to_string()));
    println!("  {:<12} {:.1}%", "Progress", run.progress * 100.0);
    println!("  {:<12} {}", "Checkpoints", checkpoints);
    if let Some(error) = &run.last_error {
        println!("  {:<12} {}", "Error", error.red());
    }
    println!();
}

/// Reads a run configuration from a `.json` or `.toml` file.
pub fn load_run_config(path: &Path) -> Result<RunConfig> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read run config {}", path.display()))?;
    let value: Value = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => {
            let table: toml::Value =
                toml::from_str(&content).with_context(|| format!("Invalid TOML in {}", path.display()))?;
            serde_json::to_value(table)?
        }
        _ => serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))?,
    };
    Ok(RunConfig::from_value(value)?)
}

/// `hf://name[@split]`, `dataset://id`, anything else is a local path.
pub fn parse_dataset(value: &str, format: Option<&str>) -> Result<DatasetRef> {
    let format = format
        .map(|f| {
            serde_json::from_value::<DatasetFormat>(Value::String(f.to_ascii_lowercase()))
                .with_context(|| format!("Unknown dataset format: {f}"))
        })
        .transpose()?;

    if let Some(rest) = value.strip_prefix("hf://") {
        let (name, split) = match rest.split_once('@') {
            Some((name, split)) => (name, Some(split.to_string())),
            None => (rest, None),
        };
        if name.is_empty() {
            bail!("Dataset name missing in {value}");
        }
        return Ok(DatasetRef::HuggingFace { name: name.to_string(), split, format });
    }
    if let Some(id) = value.strip_prefix("dataset://") {
        if id.is_empty() {
            bail!("Dataset id missing in {value}");
        }
        return Ok(DatasetRef::Registered { id: id.to_string(), format });
    }
    Ok(DatasetRef::Local { path: PathBuf::from(value), format })
}
