use crate::checkpoint::CheckpointId;
use crate::dataset::DatasetRef;
use crate::error::{TrainingError, TrainingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier for a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Owning project of a run. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub String);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ProjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Training algorithm family a run is executed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecipeKind {
    Sft,
    ChatSl,
    Dpo,
    Rl,
    MathRl,
    Distillation,
    OnPolicyDistillation,
    Ppo,
    Grpo,
    ToolUse,
    MultiplayerRl,
}

/// Coarse grouping used for hyperparameter recommendations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeFamily {
    Supervised,
    Preference,
    Reinforcement,
}

impl RecipeKind {
    pub const ALL: [RecipeKind; 11] = [
        Self::Sft,
        Self::ChatSl,
        Self::Dpo,
        Self::Rl,
        Self::MathRl,
        Self::Distillation,
        Self::OnPolicyDistillation,
        Self::Ppo,
        Self::Grpo,
        Self::ToolUse,
        Self::MultiplayerRl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sft => "SFT",
            Self::ChatSl => "CHAT_SL",
            Self::Dpo => "DPO",
            Self::Rl => "RL",
            Self::MathRl => "MATH_RL",
            Self::Distillation => "DISTILLATION",
            Self::OnPolicyDistillation => "ON_POLICY_DISTILLATION",
            Self::Ppo => "PPO",
            Self::Grpo => "GRPO",
            Self::ToolUse => "TOOL_USE",
            Self::MultiplayerRl => "MULTIPLAYER_RL",
        }
    }

    /// Kinds announced but not executable yet. Rejected at submission.
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Ppo | Self::Grpo | Self::ToolUse | Self::MultiplayerRl)
    }

    pub fn family(&self) -> RecipeFamily {
        match self {
            Self::Sft | Self::ChatSl | Self::Distillation => RecipeFamily::Supervised,
            Self::Dpo => RecipeFamily::Preference,
            Self::Rl
            | Self::MathRl
            | Self::OnPolicyDistillation
            | Self::Ppo
            | Self::Grpo
            | Self::ToolUse
            | Self::MultiplayerRl => RecipeFamily::Reinforcement,
        }
    }
}

impl fmt::Display for RecipeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecipeKind {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        if normalized == "PREFERENCE" {
            return Ok(Self::Dpo);
        }
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| TrainingError::InvalidConfig(format!("unknown recipe kind: {s}")))
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving from `self` to `target` is a legal transition.
    ///
    /// `Running -> Running` is the internal retry edge.
    pub fn can_transition_to(&self, target: RunStatus) -> bool {
        matches!(
            (self, target),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Running | Self::Completed | Self::Failed | Self::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TrainingError::Storage(format!("unknown run status: {other}"))),
        }
    }
}

/// Keys of the configuration blob that are not hyperparameters.
const RESERVED_KEYS: &[&str] = &["base_model", "dataset", "hyperparameters"];

/// Opaque configuration blob of a run.
///
/// Only `base_model` and the recipe's required keys are interpreted. Hyperparameters
/// may sit at the top level or inside a `hyperparameters` object; nested values win.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunConfig(Map<String, Value>);

impl RunConfig {
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_value(value: Value) -> TrainingResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(TrainingError::InvalidConfig(format!(
                "run configuration must be an object, got {other}"
            ))),
        }
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn base_model(&self) -> Option<&str> {
        self.0.get("base_model").and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
    }

    /// Looks a key up in `hyperparameters` first, then at the top level.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0
            .get("hyperparameters")
            .and_then(Value::as_object)
            .and_then(|nested| nested.get(key))
            .or_else(|| self.0.get(key))
            .filter(|value| !value.is_null())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    /// Integer lookup that also accepts integral floats such as `32.0`.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        let value = self.get(key)?;
        value.as_u64().or_else(|| {
            value.as_f64().filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)
        })
    }

    /// Flattened hyperparameter view with nested values overriding top-level ones.
    pub fn hyperparameters(&self) -> BTreeMap<String, Value> {
        let mut merged: BTreeMap<String, Value> = self
            .0
            .iter()
            .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if let Some(nested) = self.0.get("hyperparameters").and_then(Value::as_object) {
            for (key, value) in nested {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

/// One logical training job across one or more execution attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub project_id: ProjectId,
    pub recipe: RecipeKind,
    pub config: RunConfig,
    #[serde(default)]
    pub dataset: Option<DatasetRef>,
    pub status: RunStatus,
    /// Zero until the first attempt starts.
    pub attempt: u32,
    #[serde(default)]
    pub current_step: Option<u64>,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub stalled: bool,
    /// Checkpoint the first attempt resumes from, when explicitly requested.
    #[serde(default)]
    pub resume_from: Option<CheckpointId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    #[must_use]
    pub fn new(
        project_id: ProjectId,
        recipe: RecipeKind,
        config: RunConfig,
        dataset: Option<DatasetRef>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            project_id,
            recipe,
            config,
            dataset,
            status: RunStatus::Pending,
            attempt: 0,
            current_step: None,
            progress: 0.0,
            last_error: None,
            stalled: false,
            resume_from: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recipe_kind_parsing_accepts_aliases_and_case() {
        assert_eq!("sft".parse::<RecipeKind>().unwrap(), RecipeKind::Sft);
        assert_eq!("chat-sl".parse::<RecipeKind>().unwrap(), RecipeKind::ChatSl);
        assert_eq!("PREFERENCE".parse::<RecipeKind>().unwrap(), RecipeKind::Dpo);
        assert_eq!(
            "on_policy_distillation".parse::<RecipeKind>().unwrap(),
            RecipeKind::OnPolicyDistillation
        );
        assert!("unknown".parse::<RecipeKind>().is_err());
    }

    #[test]
    fn test_recipe_kind_serializes_screaming_snake_case() {
        let encoded = serde_json::to_string(&RecipeKind::MathRl).unwrap();
        assert_eq!(encoded, "\"MATH_RL\"");
        assert!(!RecipeKind::Grpo.is_supported());
        assert!(RecipeKind::Distillation.is_supported());
    }

    #[test]
    fn test_status_transitions() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Cancelled));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Completed));
        for terminal in [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(RunStatus::Running));
        }
    }

    #[test]
    fn test_run_config_nested_hyperparameters_win() {
        let config = RunConfig::from_value(json!({
            "base_model": "meta-llama/Llama-3.1-8B",
            "learning_rate": 1e-4,
            "batch_size": 8,
            "hyperparameters": { "learning_rate": 5e-5, "lora_rank": 32.0 }
        }))
        .unwrap();

        assert_eq!(config.base_model(), Some("meta-llama/Llama-3.1-8B"));
        assert_eq!(config.get_f64("learning_rate"), Some(5e-5));
        assert_eq!(config.get_u64("batch_size"), Some(8));
        assert_eq!(config.get_u64("lora_rank"), Some(32));

        let merged = config.hyperparameters();
        assert!(!merged.contains_key("base_model"));
        assert_eq!(merged["learning_rate"], json!(5e-5));
    }

    #[test]
    fn test_run_config_rejects_non_object() {
        assert!(RunConfig::from_value(json!([1, 2])).is_err());
        assert_eq!(RunConfig::new().with("base_model", "  ").base_model(), None);
    }
}
