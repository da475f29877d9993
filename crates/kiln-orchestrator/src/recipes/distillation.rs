//! Distillation recipes.

use super::{DatasetRequirement, FinalCheckpoint, Recipe};
use kiln_training::{CheckpointCadence, DatasetFormat, RecipeKind, RunConfig};
use serde_json::Value;

const DEFAULT_TEACHER: &str = "Qwen/Qwen3-8B";

/// Offline distillation from teacher completions. The backend does not report
/// a terminal checkpoint, so one is written from the last known state.
#[derive(Debug, Default)]
pub struct Distillation;

impl Recipe for Distillation {
    fn kind(&self) -> RecipeKind {
        RecipeKind::Distillation
    }

    fn dataset(&self) -> DatasetRequirement {
        DatasetRequirement::Required(&[])
    }

    fn default_cadence(&self) -> CheckpointCadence {
        CheckpointCadence::EndOnly
    }

    fn final_checkpoint(&self) -> FinalCheckpoint {
        FinalCheckpoint::Synthesized
    }

    fn required_keys(&self) -> &'static [&'static str] {
        &["teacher_model"]
    }

    fn defaults(&self, _config: &RunConfig) -> Vec<(&'static str, Value)> {
        vec![("num_epochs", Value::from(1))]
    }
}

#[derive(Debug, Default)]
pub struct OnPolicyDistillation;

impl Recipe for OnPolicyDistillation {
    fn kind(&self) -> RecipeKind {
        RecipeKind::OnPolicyDistillation
    }

    fn dataset(&self) -> DatasetRequirement {
        DatasetRequirement::Optional(&[DatasetFormat::Prompts])
    }

    fn default_cadence(&self) -> CheckpointCadence {
        CheckpointCadence::Every(20)
    }

    fn defaults(&self, _config: &RunConfig) -> Vec<(&'static str, Value)> {
        vec![
            ("teacher_model", Value::from(DEFAULT_TEACHER)),
            ("groups_per_batch", Value::from(1024)),
            ("group_size", Value::from(4)),
            ("max_tokens", Value::from(4096)),
            ("kl_penalty_coef", Value::from(1.0)),
            ("lora_rank", Value::from(128)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipes::{RecipeRegistry, translate};
    use kiln_training::{DatasetRef, ProjectId, Run};
    use serde_json::json;

    #[test]
    fn test_distillation_requires_teacher() {
        let registry = RecipeRegistry::standard();
        let dataset = DatasetRef::Registered { id: "d".to_string(), format: None };
        let config = RunConfig::new().with("base_model", "Qwen/Qwen3-4B");

        let missing = Run::new(ProjectId::from("p"), RecipeKind::Distillation, config.clone(), Some(dataset.clone()));
        assert!(registry.validate_submission(&missing).is_err());

        let ok = Run::new(
            ProjectId::from("p"),
            RecipeKind::Distillation,
            config.with("teacher_model", "Qwen/Qwen3-8B"),
            Some(dataset),
        );
        let recipe = registry.validate_submission(&ok).unwrap();
        assert_eq!(recipe.final_checkpoint(), FinalCheckpoint::Synthesized);
    }

    #[test]
    fn test_on_policy_defaults_teacher_and_rank() {
        let registry = RecipeRegistry::standard();
        let run = Run::new(
            ProjectId::from("p"),
            RecipeKind::OnPolicyDistillation,
            RunConfig::new().with("base_model", "Qwen/Qwen3-4B"),
            None,
        );
        let recipe = registry.validate_submission(&run).unwrap();
        let params = translate(recipe.as_ref(), &run, 1, None, CheckpointCadence::Every(20), None).unwrap();
        assert_eq!(params.hyperparameters["teacher_model"], json!(DEFAULT_TEACHER));
        assert_eq!(params.hyperparameters["lora_rank"], json!(128));
        assert_eq!(params.hyperparameters["save_every"], json!(20));
        assert_eq!(params.start_step, 0);
    }
}
