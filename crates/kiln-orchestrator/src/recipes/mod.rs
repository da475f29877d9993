//! Recipe kinds and the lookup table the executor dispatches through.
//!
//! Each supported kind contributes one [`Recipe`] entry: its dataset
//! requirement, checkpoint cadence, final checkpoint behaviour, extra
//! validation and hyperparameter defaults. Everything else (submission,
//! streaming, classification) is shared.

mod distillation;
mod preference;
mod reinforcement;
mod supervised;

pub use distillation::{Distillation, OnPolicyDistillation};
pub use preference::Dpo;
pub use reinforcement::{MathRl, Rl};
pub use supervised::{ChatSl, Sft};

use crate::backend::{ProviderParams, ResumePoint};
use crate::error::{OrchestrationError, Result};
use kiln_training::{
    CheckpointCadence, DatasetFormat, DatasetHandle, RecipeKind, Run, RunConfig, recommend, recommended_learning_rate,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Hyperparameters that must be positive integers when present.
const POSITIVE_INTEGER_KEYS: &[&str] = &["batch_size", "lora_rank", "save_every", "max_tokens", "group_size"];

/// Dataset input a recipe accepts. An empty format list accepts any format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetRequirement {
    None,
    Optional(&'static [DatasetFormat]),
    Required(&'static [DatasetFormat]),
}

impl DatasetRequirement {
    fn formats(self) -> &'static [DatasetFormat] {
        match self {
            Self::None => &[],
            Self::Optional(formats) | Self::Required(formats) => formats,
        }
    }
}

impl fmt::Display for DatasetRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::None => return f.write_str("none"),
            Self::Optional(_) => "optional",
            Self::Required(_) => "required",
        };
        let formats = self.formats();
        if formats.is_empty() {
            write!(f, "{label} (any)")
        } else {
            let names: Vec<String> = formats.iter().map(ToString::to_string).collect();
            write!(f, "{label} ({})", names.join("/"))
        }
    }
}

/// Whether the backend reports the terminal checkpoint or the runner writes one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalCheckpoint {
    Reported,
    Synthesized,
}

impl fmt::Display for FinalCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reported => f.write_str("reported"),
            Self::Synthesized => f.write_str("synthesized"),
        }
    }
}

/// Per-kind behaviour plugged into the shared execution skeleton.
pub trait Recipe: Send + Sync {
    fn kind(&self) -> RecipeKind;

    fn dataset(&self) -> DatasetRequirement;

    fn default_cadence(&self) -> CheckpointCadence;

    fn final_checkpoint(&self) -> FinalCheckpoint {
        FinalCheckpoint::Reported
    }

    /// Keys that must be present beyond `base_model`.
    fn required_keys(&self) -> &'static [&'static str] {
        &[]
    }

    /// Checks run after the common ones.
    fn validate(&self, _config: &RunConfig) -> Result<()> {
        Ok(())
    }

    /// Values filled into the hyperparameters when the run does not set them.
    fn defaults(&self, config: &RunConfig) -> Vec<(&'static str, Value)>;
}

/// Lookup table from recipe kind to its entry, built once at startup.
#[derive(Clone)]
pub struct RecipeRegistry {
    recipes: BTreeMap<RecipeKind, Arc<dyn Recipe>>,
}

impl fmt::Debug for RecipeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecipeRegistry").field("kinds", &self.recipes.keys().collect::<Vec<_>>()).finish()
    }
}

impl Default for RecipeRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl RecipeRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self { recipes: BTreeMap::new() }
    }

    /// Every supported kind.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(Sft));
        registry.register(Arc::new(ChatSl));
        registry.register(Arc::new(Dpo));
        registry.register(Arc::new(Rl));
        registry.register(Arc::new(MathRl));
        registry.register(Arc::new(Distillation));
        registry.register(Arc::new(OnPolicyDistillation));
        registry
    }

    pub fn register(&mut self, recipe: Arc<dyn Recipe>) {
        debug!(kind = %recipe.kind(), "Registering recipe");
        self.recipes.insert(recipe.kind(), recipe);
    }

    /// # Errors
    /// * `Validation` - the kind is announced but not executable, or unknown
    pub fn get(&self, kind: RecipeKind) -> Result<Arc<dyn Recipe>> {
        if !kind.is_supported() {
            return Err(OrchestrationError::Validation(format!("recipe {kind} is not supported yet")));
        }
        self.recipes
            .get(&kind)
            .cloned()
            .ok_or_else(|| OrchestrationError::Validation(format!("no recipe registered for {kind}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Recipe>> {
        self.recipes.values()
    }

    /// Cadence for a run: its `save_every` first, then the override, then the recipe default.
    pub fn cadence_for(
        &self,
        recipe: &dyn Recipe,
        config: &RunConfig,
        overrides: &BTreeMap<RecipeKind, CheckpointCadence>,
    ) -> CheckpointCadence {
        config
            .get_u64("save_every")
            .filter(|n| *n > 0)
            .map(CheckpointCadence::Every)
            .or_else(|| overrides.get(&recipe.kind()).copied())
            .unwrap_or_else(|| recipe.default_cadence())
    }

    /// Fail-fast checks for a submission. Touches no external resource.
    ///
    /// # Errors
    /// * `Validation` - unsupported kind, missing or malformed keys, dataset mismatch
    pub fn validate_submission(&self, run: &Run) -> Result<Arc<dyn Recipe>> {
        let recipe = self.get(run.recipe)?;
        validate_common(run.recipe, &run.config)?;

        for key in recipe.required_keys() {
            let present = run.config.get_str(key).is_some_and(|value| !value.trim().is_empty());
            if !present {
                return Err(OrchestrationError::Validation(format!("{} requires `{key}`", run.recipe)));
            }
        }

        let requirement = recipe.dataset();
        match (&run.dataset, requirement) {
            (None, DatasetRequirement::Required(_)) => {
                return Err(OrchestrationError::Validation(format!("{} requires a dataset", run.recipe)));
            }
            (Some(_), DatasetRequirement::None) => {
                return Err(OrchestrationError::Validation(format!("{} does not take a dataset", run.recipe)));
            }
            (Some(dataset), _) => {
                dataset.validate()?;
                let formats = requirement.formats();
                if let Some(format) = dataset.format() {
                    if !formats.is_empty() && !formats.contains(&format) {
                        return Err(OrchestrationError::Validation(format!(
                            "{} cannot train on a {format} dataset, expected {requirement}",
                            run.recipe
                        )));
                    }
                }
            }
            (None, _) => {}
        }

        recipe.validate(&run.config)?;
        Ok(recipe)
    }
}

fn validate_common(kind: RecipeKind, config: &RunConfig) -> Result<()> {
    if config.base_model().is_none() {
        return Err(OrchestrationError::Validation(format!("{kind} requires a non-empty `base_model`")));
    }

    if let Some(value) = config.get("learning_rate") {
        let valid = value.as_f64().is_some_and(|lr| lr.is_finite() && lr > 0.0);
        if !valid {
            return Err(OrchestrationError::Validation(format!(
                "`learning_rate` must be a positive number, got {value}"
            )));
        }
    }

    for key in POSITIVE_INTEGER_KEYS {
        if let Some(value) = config.get(key) {
            if !config.get_u64(key).is_some_and(|n| n > 0) {
                return Err(OrchestrationError::Validation(format!(
                    "`{key}` must be a positive integer, got {value}"
                )));
            }
        }
    }
    Ok(())
}

/// Builds the provider invocation for one attempt.
pub fn translate(
    recipe: &dyn Recipe,
    run: &Run,
    attempt: u32,
    dataset: Option<DatasetHandle>,
    cadence: CheckpointCadence,
    resume_from: Option<ResumePoint>,
) -> Result<ProviderParams> {
    let base_model = run
        .config
        .base_model()
        .ok_or_else(|| OrchestrationError::Validation(format!("{} requires a non-empty `base_model`", run.recipe)))?
        .to_string();

    let mut hyperparameters = run.config.hyperparameters();
    hyperparameters.remove("save_every");

    let recommended = recommend(&base_model, run.recipe.family());
    let mut fill = |key: &str, value: Value| {
        hyperparameters.entry(key.to_string()).or_insert(value);
    };
    for (key, value) in recipe.defaults(&run.config) {
        fill(key, value);
    }
    fill("learning_rate", Value::from(recommended_learning_rate(&base_model, true)));
    fill("batch_size", Value::from(recommended.batch_size));
    fill("lora_rank", Value::from(recommended.lora_rank));
    if let Some(every) = cadence.save_every() {
        hyperparameters.insert("save_every".to_string(), Value::from(every));
    }

    let start_step = resume_from.as_ref().map_or(0, |point| point.step);
    Ok(ProviderParams {
        run_id: run.id.clone(),
        attempt,
        recipe: run.recipe,
        base_model,
        dataset,
        hyperparameters,
        cadence,
        resume_from,
        start_step,
    })
}
