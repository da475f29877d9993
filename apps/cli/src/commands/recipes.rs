//! `kiln recipes`

use anyhow::Result;
use colored::Colorize;
use kiln_orchestrator::{FinalCheckpoint, RecipeRegistry};
use kiln_training::{RecipeFamily, RecipeKind};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct RecipeRow {
    kind: RecipeKind,
    family: RecipeFamily,
    supported: bool,
    dataset: Option<String>,
    required_keys: Vec<&'static str>,
    cadence: Option<String>,
    final_checkpoint: Option<&'static str>,
}

fn rows(registry: &RecipeRegistry) -> Vec<RecipeRow> {
    RecipeKind::ALL
        .into_iter()
        .map(|kind| match registry.get(kind) {
            Ok(recipe) => {
                let mut required_keys = vec!["base_model"];
                required_keys.extend(recipe.required_keys());
                RecipeRow {
                    kind,
                    family: kind.family(),
                    supported: true,
                    dataset: Some(recipe.dataset().to_string()),
                    required_keys,
                    cadence: Some(recipe.default_cadence().to_string()),
                    final_checkpoint: Some(match recipe.final_checkpoint() {
                        FinalCheckpoint::Reported => "reported",
                        FinalCheckpoint::Synthesized => "synthesized",
                    }),
                }
            }
            Err(_) => RecipeRow {
                kind,
                family: kind.family(),
                supported: false,
                dataset: None,
                required_keys: Vec::new(),
                cadence: None,
                final_checkpoint: None,
            },
        })
        .collect()
}

pub fn execute(json: bool) -> Result<()> {
    let rows = rows(&RecipeRegistry::standard());
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Recipe Kinds ({})", rows.len()).bold().cyan());
    println!();
    println!("{:<24} {:<22} {:<16} {:<12} {}", "Kind", "Dataset", "Cadence", "Final", "Required");
    println!("{}", "─".repeat(96));
    for row in rows {
        if row.supported {
            println!(
                "{:<24} {:<22} {:<16} {:<12} {}",
                row.kind.as_str().cyan(),
                row.dataset.unwrap_or_default(),
                row.cadence.unwrap_or_default(),
                row.final_checkpoint.unwrap_or_default(),
                row.required_keys.join(", ").dimmed()
            );
        } else {
            println!("{:<24} {}", row.kind.as_str().dimmed(), "coming soon".dimmed());
        }
    }
    println!();
    Ok(())
}
