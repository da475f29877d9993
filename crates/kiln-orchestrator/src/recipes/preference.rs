//! Preference optimization recipes: DPO over chosen/rejected pairs.

use super::{DatasetRequirement, Recipe};
use kiln_training::{CheckpointCadence, DatasetFormat, RecipeKind, RunConfig};
use serde_json::Value;

/// Direct preference optimization over chosen/rejected pairs.
#[derive(Debug, Default)]
pub struct Dpo;

impl Recipe for Dpo {
    fn kind(&self) -> RecipeKind {
        RecipeKind::Dpo
    }

    fn dataset(&self) -> DatasetRequirement {
        DatasetRequirement::Required(&[DatasetFormat::Preference])
    }

    fn default_cadence(&self) -> CheckpointCadence {
        CheckpointCadence::EndOnly
    }

    fn defaults(&self, _config: &RunConfig) -> Vec<(&'static str, Value)> {
        vec![("dpo_beta", Value::from(0.1)), ("num_epochs", Value::from(1))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipes::{RecipeRegistry, translate};
    use kiln_training::{DatasetRef, ProjectId, Run};
    use serde_json::json;

    fn dpo_run(format: Option<DatasetFormat>) -> Run {
        let dataset = DatasetRef::HuggingFace { name: "Anthropic/hh-rlhf".to_string(), split: None, format };
        let config = RunConfig::new().with("base_model", "meta-llama/Llama-3.2-1B");
        Run::new(ProjectId::from("p"), RecipeKind::Dpo, config, Some(dataset))
    }

    #[test]
    fn test_dpo_accepts_only_preference_datasets() {
        let registry = RecipeRegistry::standard();
        assert!(registry.validate_submission(&dpo_run(Some(DatasetFormat::Chat))).is_err());

        let run = dpo_run(Some(DatasetFormat::Preference));
        let recipe = registry.validate_submission(&run).unwrap();
        let params = translate(recipe.as_ref(), &run, 1, None, CheckpointCadence::EndOnly, None).unwrap();
        assert_eq!(params.hyperparameters["dpo_beta"], json!(0.1));
        assert_eq!(params.hyperparameters["num_epochs"], json!(1));
    }
}
