//! Reinforcement learning recipes.

use super::{DatasetRequirement, Recipe};
use crate::error::{OrchestrationError, Result};
use kiln_training::{CheckpointCadence, DatasetFormat, RecipeKind, RunConfig};
use serde_json::Value;

const RL_SAVE_EVERY: u64 = 20;

pub const MATH_ENVIRONMENTS: &[&str] = &["arithmetic", "math", "gsm8k", "polaris", "deepmath"];

fn rl_defaults() -> Vec<(&'static str, Value)> {
    vec![
        ("group_size", Value::from(4)),
        ("groups_per_batch", Value::from(100)),
        ("max_tokens", Value::from(256)),
    ]
}

#[derive(Debug, Default)]
pub struct Rl;

impl Recipe for Rl {
    fn kind(&self) -> RecipeKind {
        RecipeKind::Rl
    }

    fn dataset(&self) -> DatasetRequirement {
        DatasetRequirement::Optional(&[DatasetFormat::Prompts])
    }

    fn default_cadence(&self) -> CheckpointCadence {
        CheckpointCadence::Every(RL_SAVE_EVERY)
    }

    fn defaults(&self, _config: &RunConfig) -> Vec<(&'static str, Value)> {
        rl_defaults()
    }
}

/// RL against a built-in math environment. Takes no dataset.
#[derive(Debug, Default)]
pub struct MathRl;

impl Recipe for MathRl {
    fn kind(&self) -> RecipeKind {
        RecipeKind::MathRl
    }

    fn dataset(&self) -> DatasetRequirement {
        DatasetRequirement::None
    }

    fn default_cadence(&self) -> CheckpointCadence {
        CheckpointCadence::Every(RL_SAVE_EVERY)
    }

    fn validate(&self, config: &RunConfig) -> Result<()> {
        match config.get("environment") {
            None => Ok(()),
            Some(value) => match value.as_str() {
                Some(env) if MATH_ENVIRONMENTS.contains(&env) => Ok(()),
                _ => Err(OrchestrationError::Validation(format!(
                    "unknown math environment {value}, expected one of {}",
                    MATH_ENVIRONMENTS.join(", ")
                ))),
            },
        }
    }

    fn defaults(&self, _config: &RunConfig) -> Vec<(&'static str, Value)> {
        let mut defaults = rl_defaults();
        defaults.push(("environment", Value::from("arithmetic")));
        defaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_math_environment_is_checked() {
        let recipe = MathRl;
        recipe.validate(&RunConfig::new()).unwrap();
        recipe.validate(&RunConfig::new().with("environment", "gsm8k")).unwrap();
        assert!(recipe.validate(&RunConfig::new().with("environment", "chess")).is_err());
        assert!(recipe.validate(&RunConfig::new().with("environment", 3)).is_err());
    }
}
