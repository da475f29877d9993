//! Supervised recipes: instruction tuning and chat training.

use super::{DatasetRequirement, Recipe};
use kiln_training::{CheckpointCadence, DatasetFormat, RecipeKind, RunConfig};
use serde_json::Value;

const MAX_LENGTH: u64 = 32_768;

fn supervised_defaults() -> Vec<(&'static str, Value)> {
    vec![
        ("max_length", Value::from(MAX_LENGTH)),
        ("lr_schedule", Value::from("linear")),
        ("num_epochs", Value::from(1)),
    ]
}

#[derive(Debug, Default)]
pub struct Sft;

impl Recipe for Sft {
    fn kind(&self) -> RecipeKind {
        RecipeKind::Sft
    }

    fn dataset(&self) -> DatasetRequirement {
        DatasetRequirement::Optional(&[DatasetFormat::Instruction, DatasetFormat::Chat])
    }

    fn default_cadence(&self) -> CheckpointCadence {
        CheckpointCadence::EndOnly
    }

    fn defaults(&self, _config: &RunConfig) -> Vec<(&'static str, Value)> {
        supervised_defaults()
    }
}

/// Multi-turn chat training. Needs a conversation dataset.
#[derive(Debug, Default)]
pub struct ChatSl;

impl Recipe for ChatSl {
    fn kind(&self) -> RecipeKind {
        RecipeKind::ChatSl
    }

    fn dataset(&self) -> DatasetRequirement {
        DatasetRequirement::Required(&[DatasetFormat::Chat])
    }

    fn default_cadence(&self) -> CheckpointCadence {
        CheckpointCadence::EndOnly
    }

    fn defaults(&self, _config: &RunConfig) -> Vec<(&'static str, Value)> {
        supervised_defaults()
    }
}
