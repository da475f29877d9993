//! Kiln CLI - operator interface for the Kiln run orchestration engine.
//!
//! Provides the `kiln` command: inspect recipe kinds and hyperparameter
//! recommendations, parse training logs, replay a run end to end against a
//! scripted backend, and inspect runs persisted in a SQLite database.

mod commands;
mod logging;

use clap::{Parser, Subcommand};
use kiln_orchestrator::{ConfigLayer, OrchestratorConfig};
use kiln_training::RecipeKind;
use std::path::PathBuf;

use commands::{hyperparams, inspect, metrics, recipes, run};
use logging::LogFormat;

/// Kiln - training run orchestration
#[derive(Parser, Debug)]
#[command(name = "kiln", author, version, about = "Kiln - training run orchestration")]
struct Args {
    /// Orchestrator config file, layered over ~/.kiln/config.toml and ./kiln.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database holding runs, checkpoints and evaluations
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Root directory for checkpoint manifests and run logs
    #[arg(long, global = true)]
    artifact_root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List recipe kinds with their dataset, cadence and checkpoint defaults
    Recipes,

    /// Recommend hyperparameters for a base model
    Hyperparams {
        /// Base model name (e.g. meta-llama/Llama-3.1-8B)
        #[arg(long)]
        model: String,

        /// Recipe kind the recommendation is for
        #[arg(long, default_value = "SFT", value_parser = parse_recipe)]
        recipe: RecipeKind,
    },

    /// Parse raw training output into metric samples
    ParseMetrics {
        /// Log file, `-` for stdin
        log: PathBuf,
    },

    /// Drive one run end to end against a scripted backend
    ///
    /// The script is JSONL, one backend event per line; `{"event": "next_attempt"}`
    /// starts the script of the next attempt.
    Run {
        /// Recipe kind (SFT, CHAT_SL, DPO, RL, MATH_RL, DISTILLATION, ON_POLICY_DISTILLATION)
        #[arg(long, value_parser = parse_recipe)]
        recipe: RecipeKind,

        /// Run configuration file (.json or .toml)
        #[arg(long)]
        run_config: PathBuf,

        /// Backend script (.jsonl)
        #[arg(long)]
        script: PathBuf,

        /// Dataset: hf://name[@split], dataset://id or a local path
        #[arg(long)]
        dataset: Option<String>,

        /// Dataset format (instruction, chat, preference, prompts, text)
        #[arg(long, requires = "dataset")]
        dataset_format: Option<String>,

        /// Project the run belongs to
        #[arg(long, default_value = "default")]
        project: String,
    },

    /// List the checkpoints of a run
    Checkpoints {
        run_id: String,

        /// Only print the best checkpoint by this metric (minimized unless --maximize)
        #[arg(long)]
        best: Option<String>,

        #[arg(long, requires = "best")]
        maximize: bool,
    },

    /// Show a run with its checkpoints and evaluations
    Show { run_id: String },
}

fn parse_recipe(value: &str) -> Result<RecipeKind, String> {
    value.parse::<RecipeKind>().map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = OrchestratorConfig::discover_and_load(args.config.as_deref())?;
    config.merge(&ConfigLayer {
        database: args.database.clone(),
        artifact_root: args.artifact_root.clone(),
        log_level: args.log_level.clone(),
        ..ConfigLayer::default()
    });

    let level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    logging::init(&level, args.log_format)?;

    match args.command {
        Command::Recipes => recipes::execute(args.json)?,
        Command::Hyperparams { model, recipe } => hyperparams::execute(&model, recipe, args.json)?,
        Command::ParseMetrics { log } => metrics::execute(&log, args.json)?,
        Command::Run { recipe, run_config, script, dataset, dataset_format, project } => {
            let options = run::RunOptions { recipe, run_config, script, dataset, dataset_format, project };
            run::execute(config, options, args.json).await?;
        }
        Command::Checkpoints { run_id, best, maximize } => {
            inspect::checkpoints(&config, &run_id, best.as_deref(), maximize, args.json).await?;
        }
        Command::Show { run_id } => inspect::show(&config, &run_id, args.json).await?,
    }
    Ok(())
}
