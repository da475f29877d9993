//! `kiln checkpoints` and `kiln show`, read-only views over a SQLite store.

use anyhow::{Context, Result, bail};
use colored::Colorize;
use kiln_orchestrator::{CheckpointManager, OrchestratorConfig};
use kiln_training::{
    ArtifactLayout, Checkpoint, CheckpointStore, EvaluationStore, FsArtifactStorage, MetricObjective, RunId, RunStore,
    SqliteStore,
};
use serde_json::json;
use std::sync::Arc;

fn open_store(config: &OrchestratorConfig) -> Result<Arc<SqliteStore>> {
    let Some(path) = &config.database else {
        bail!("No database configured; pass --database or set `database` in kiln.toml");
    };
    if !path.exists() {
        bail!("Database {} does not exist", path.display());
    }
    let store = SqliteStore::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(Arc::new(store))
}

pub async fn checkpoints(
    config: &OrchestratorConfig,
    run_id: &str,
    best: Option<&str>,
    maximize: bool,
    json_output: bool,
) -> Result<()> {
    let store = open_store(config)?;
    let run_id = RunId::from(run_id);
    let run = store.get_run(&run_id).await?;

    let checkpoints = match best {
        Some(metric) => {
            let artifacts = FsArtifactStorage::new(ArtifactLayout::new(config.artifact_root.clone()))?;
            let manager = CheckpointManager::new(store, Arc::new(artifacts));
            let objective = if maximize { MetricObjective::Maximize } else { MetricObjective::Minimize };
            match manager.best(&run.id, metric, objective).await? {
                Some(checkpoint) => vec![checkpoint],
                None => bail!("No checkpoint of run {} reports {metric}", run.id),
            }
        }
        None => store.list_checkpoints(&run.id).await?,
    };

    if json_output {
        println!("{}", serde_json::to_string_pretty(&checkpoints)?);
        return Ok(());
    }
    println!();
    println!("{}", format!("Checkpoints of {} ({})", run.id, checkpoints.len()).bold().cyan());
    print_checkpoints(&checkpoints);
    Ok(())
}

pub async fn show(config: &OrchestratorConfig, run_id: &str, json_output: bool) -> Result<()> {
    let store = open_store(config)?;
    let run_id = RunId::from(run_id);
    let run = store.get_run(&run_id).await?;
    let checkpoints = store.list_checkpoints(&run_id).await?;
    let evaluations = store.list_evaluations(&run_id).await?;

    if json_output {
        let value = json!({ "run": run, "checkpoints": checkpoints, "evaluations": evaluations });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    println!("{} {}", "Run".bold().cyan(), run.id);
    println!("  {:<12} {}", "Project", run.project_id);
    println!("  {:<12} {}", "Recipe", run.recipe);
    println!("  {:<12} {}", "Status", run.status);
    println!("  {:<12} {}", "Attempts", run.attempt);
    println!("  {:<12} {}", "Step", run.current_step.map_or_else(|| "-".to_string(), |s| s.to_string()));
    println!("  {:<12} {:.1}%", "Progress", run.progress * 100.0);
    if let Some(model) = run.config.base_model() {
        println!("  {:<12} {}", "Model", model);
    }
    if let Some(error) = &run.last_error {
        println!("  {:<12} {}", "Error", error.red());
    }
    println!("  {:<12} {}", "Created", run.created_at.to_rfc3339().dimmed());

    print_checkpoints(&checkpoints);

    if !evaluations.is_empty() {
        println!();
        println!("{}", format!("Evaluations ({})", evaluations.len()).bold());
        for evaluation in &evaluations {
            let rate = evaluation
                .metrics
                .as_ref()
                .map_or_else(|| "-".to_string(), |m| format!("{:.1}%", m.success_rate * 100.0));
            println!("  {:<38} {:<10} {:<10} {}", evaluation.id, evaluation.status.as_str(), rate, evaluation.prompt_set.dimmed());
        }
    }
    println!();
    Ok(())
}

fn print_checkpoints(checkpoints: &[Checkpoint]) {
    if checkpoints.is_empty() {
        println!("  {}", "no checkpoints".dimmed());
        return;
    }
    println!();
    println!("  {:<8} {:<38} {:<10} {}", "Step", "ID", "Loss", "Source");
    println!("  {}", "─".repeat(80));
    for checkpoint in checkpoints {
        let step = if checkpoint.is_final { format!("{}*", checkpoint.step) } else { checkpoint.step.to_string() };
        let loss = checkpoint.metric("loss").map_or_else(|| "-".to_string(), |v| format!("{v:.4}"));
        println!(
            "  {:<8} {:<38} {:<10} {}",
            step,
            checkpoint.id,
            loss,
            checkpoint.source.as_deref().unwrap_or("-").dimmed()
        );
    }
}
