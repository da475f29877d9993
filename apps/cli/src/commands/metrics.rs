//! `kiln parse-metrics`

use anyhow::{Context, Result};
use colored::Colorize;
use kiln_training::MetricSample;
use kiln_training::metrics::parse_lines;
use std::io::Read;
use std::path::Path;

fn read_input(log: &Path) -> Result<String> {
    if log == Path::new("-") {
        let mut content = String::new();
        std::io::stdin().read_to_string(&mut content).context("Failed to read stdin")?;
        return Ok(content);
    }
    std::fs::read_to_string(log).with_context(|| format!("Failed to read {}", log.display()))
}

fn cell<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

pub fn execute(log: &Path, json: bool) -> Result<()> {
    let content = read_input(log)?;
    let samples: Vec<MetricSample> = parse_lines(content.lines()).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&samples)?);
        return Ok(());
    }

    println!();
    println!(
        "{}",
        format!("{} samples from {} lines", samples.len(), content.lines().count()).bold().cyan()
    );
    if samples.is_empty() {
        println!();
        return Ok(());
    }
    println!();
    println!("{:<10} {:<12} {:<12} {:<10} {:<10}", "Step", "Loss", "LR", "Progress", "Tokens");
    println!("{}", "─".repeat(58));
    for sample in &samples {
        println!(
            "{:<10} {:<12} {:<12} {:<10} {:<10}",
            cell(sample.step),
            cell(sample.loss.map(|v| format!("{v:.4}"))),
            cell(sample.learning_rate.map(|v| format!("{v:.2e}"))),
            cell(sample.progress.map(|v| format!("{:.1}%", v * 100.0))),
            cell(sample.tokens)
        );
    }
    println!();
    Ok(())
}
