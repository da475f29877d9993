//! `kiln hyperparams`

use anyhow::Result;
use colored::Colorize;
use kiln_training::hyperparams::recommended_learning_rate;
use kiln_training::{RecipeKind, recommend};
use serde_json::json;

pub fn execute(model: &str, recipe: RecipeKind, json_output: bool) -> Result<()> {
    let recommendations = recommend(model, recipe.family());
    let full_learning_rate = recommended_learning_rate(model, false);

    if json_output {
        let mut value = serde_json::to_value(&recommendations)?;
        if let Some(map) = value.as_object_mut() {
            map.insert("recipe".to_string(), json!(recipe));
            map.insert("full_finetune_learning_rate".to_string(), json!(full_learning_rate));
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Hyperparameters for {model} ({recipe})").bold().cyan());
    println!();
    println!("  {:<22} {:?}", "Model family", recommendations.family);
    println!("  {:<22} {}", "Hidden size", recommendations.hidden_size);
    println!("  {:<22} {:.3e}", "Learning rate (LoRA)", recommendations.learning_rate);
    println!("  {:<22} {:.3e}", "Learning rate (full)", full_learning_rate);
    println!("  {:<22} {}", "Batch size", recommendations.batch_size);
    println!("  {:<22} {}", "LoRA rank", recommendations.lora_rank);
    println!(
        "  {:<22} beta1={} beta2={} eps={:e}",
        "Adam", recommendations.adam_beta1, recommendations.adam_beta2, recommendations.adam_eps
    );
    println!();
    Ok(())
}
