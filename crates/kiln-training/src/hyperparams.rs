//! Recommended hyperparameters for LoRA fine-tuning.
//!
//! The learning rate follows `5e-5 * 10 (LoRA) * (2000 / hidden_size) ^ exponent`,
//! where the exponent depends on the model family.

use crate::run::RecipeFamily;
use serde::{Deserialize, Serialize};

const LR_BASE: f64 = 5e-5;
const LORA_MULTIPLIER: f64 = 10.0;
const DEFAULT_HIDDEN_SIZE: u32 = 4096;

const HIDDEN_SIZES: &[(&str, u32)] = &[
    ("meta-llama/Llama-3.2-1B", 2048),
    ("meta-llama/Llama-3.2-1B-Instruct", 2048),
    ("meta-llama/Llama-3.2-3B", 3072),
    ("meta-llama/Llama-3.2-3B-Instruct", 3072),
    ("meta-llama/Llama-3.1-8B", 4096),
    ("meta-llama/Llama-3.1-8B-Instruct", 4096),
    ("meta-llama/Llama-3.1-70B", 8192),
    ("meta-llama/Llama-3.3-70B-Instruct", 8192),
    ("Qwen/Qwen2.5-0.5B", 896),
    ("Qwen/Qwen2.5-0.5B-Instruct", 896),
    ("Qwen/Qwen2.5-1.5B", 1536),
    ("Qwen/Qwen2.5-1.5B-Instruct", 1536),
    ("Qwen/Qwen2.5-3B", 2048),
    ("Qwen/Qwen2.5-3B-Instruct", 2048),
    ("Qwen/Qwen2.5-7B", 3584),
    ("Qwen/Qwen2.5-7B-Instruct", 3584),
    ("Qwen/Qwen2.5-14B", 5120),
    ("Qwen/Qwen2.5-14B-Instruct", 5120),
    ("Qwen/Qwen2.5-32B", 5120),
    ("Qwen/Qwen2.5-32B-Instruct", 5120),
    ("Qwen/Qwen2.5-72B", 8192),
    ("Qwen/Qwen2.5-72B-Instruct", 8192),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Llama,
    Qwen,
    Unknown,
}

impl ModelFamily {
    pub fn detect(model: &str) -> Self {
        let lower = model.to_ascii_lowercase();
        if lower.contains("llama") {
            Self::Llama
        } else if lower.contains("qwen") {
            Self::Qwen
        } else {
            Self::Unknown
        }
    }

    /// Unknown families fall back to the Llama exponent.
    pub fn exponent(self) -> f64 {
        match self {
            Self::Qwen => 0.0775,
            Self::Llama | Self::Unknown => 0.781,
        }
    }
}

pub fn hidden_size(model: &str) -> u32 {
    HIDDEN_SIZES
        .iter()
        .find(|(name, _)| *name == model)
        .map_or(DEFAULT_HIDDEN_SIZE, |(_, size)| *size)
}

pub fn recommended_learning_rate(model: &str, lora: bool) -> f64 {
    let base = if lora { LR_BASE * LORA_MULTIPLIER } else { LR_BASE };
    let exponent = ModelFamily::detect(model).exponent();
    base * (2000.0 / f64::from(hidden_size(model))).powf(exponent)
}

pub fn recommended_batch_size(model: &str, family: RecipeFamily) -> u32 {
    let tiers = match family {
        RecipeFamily::Supervised => [128, 64, 32],
        RecipeFamily::Preference => [64, 32, 16],
        RecipeFamily::Reinforcement => [32, 16, 8],
    };
    match hidden_size(model) {
        0..=2048 => tiers[0],
        2049..=4096 => tiers[1],
        _ => tiers[2],
    }
}

pub fn recommended_lora_rank(model: &str, family: RecipeFamily) -> u32 {
    match family {
        RecipeFamily::Supervised => match hidden_size(model) {
            0..=2048 => 32,
            2049..=4096 => 64,
            _ => 128,
        },
        RecipeFamily::Preference | RecipeFamily::Reinforcement => 32,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendations {
    pub model: String,
    pub family: ModelFamily,
    pub hidden_size: u32,
    pub exponent: f64,
    pub learning_rate: f64,
    pub batch_size: u32,
    pub lora_rank: u32,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_eps: f64,
}

pub fn recommend(model: &str, recipe: RecipeFamily) -> Recommendations {
    let family = ModelFamily::detect(model);
    if family == ModelFamily::Unknown {
        tracing::debug!(model, "Unknown model family, using Llama exponent");
    }
    Recommendations {
        model: model.to_string(),
        family,
        hidden_size: hidden_size(model),
        exponent: family.exponent(),
        learning_rate: recommended_learning_rate(model, true),
        batch_size: recommended_batch_size(model, recipe),
        lora_rank: recommended_lora_rank(model, recipe),
        adam_beta1: 0.9,
        adam_beta2: 0.95,
        adam_eps: 1e-8,
    }
}
