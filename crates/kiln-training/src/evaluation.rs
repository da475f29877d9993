use crate::checkpoint::CheckpointId;
use crate::error::{TrainingError, TrainingResult};
use crate::run::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvaluationId(pub String);

impl EvaluationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for EvaluationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EvaluationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What an evaluation samples from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum EvaluationTarget {
    /// Resolved to the run's final checkpoint, else its latest.
    Run(RunId),
    Checkpoint(CheckpointId),
}

impl fmt::Display for EvaluationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(id) => write!(f, "run {id}"),
            Self::Checkpoint(id) => write!(f, "checkpoint {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalPrompt {
    pub prompt: String,
    /// Substring a completion must contain to count as a success.
    #[serde(default)]
    pub expected: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSet {
    pub name: String,
    pub prompts: Vec<EvalPrompt>,
}

impl PromptSet {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.prompts.is_empty() {
            return Err(TrainingError::InvalidConfig(format!("prompt set '{}' is empty", self.name)));
        }
        if let Some(index) = self.prompts.iter().position(|p| p.prompt.trim().is_empty()) {
            return Err(TrainingError::InvalidConfig(format!(
                "prompt {index} of prompt set '{}' is blank",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptResult {
    pub index: usize,
    pub prompt: String,
    #[serde(default)]
    pub completion: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl PromptResult {
    pub fn sampled(index: usize, prompt: &EvalPrompt, completion: String) -> Self {
        let success = !completion.trim().is_empty()
            && prompt
                .expected
                .as_ref()
                .is_none_or(|expected| completion.to_lowercase().contains(&expected.to_lowercase()));
        Self { index, prompt: prompt.prompt.clone(), completion: Some(completion), success, error: None }
    }

    pub fn errored(index: usize, prompt: &EvalPrompt, error: String) -> Self {
        Self { index, prompt: prompt.prompt.clone(), completion: None, success: false, error: Some(error) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub success_rate: f64,
    /// Mean completion length in characters over sampled prompts.
    pub average_response_length: f64,
    pub sampled: usize,
    pub failed: usize,
}

impl EvaluationMetrics {
    pub fn from_results(results: &[PromptResult]) -> Self {
        let lengths: Vec<usize> =
            results.iter().filter_map(|r| r.completion.as_ref()).map(|c| c.chars().count()).collect();
        let successes = results.iter().filter(|r| r.success).count();
        let sampled = lengths.len();
        Self {
            success_rate: if results.is_empty() { 0.0 } else { successes as f64 / results.len() as f64 },
            average_response_length: if sampled == 0 {
                0.0
            } else {
                lengths.iter().sum::<usize>() as f64 / sampled as f64
            },
            sampled,
            failed: results.len() - sampled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl EvaluationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for EvaluationStatus {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(TrainingError::Storage(format!("unknown evaluation status: {other}"))),
        }
    }
}

/// A scored sampling session against a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: EvaluationId,
    pub target: EvaluationTarget,
    pub run_id: RunId,
    pub checkpoint_id: CheckpointId,
    pub prompt_set: String,
    #[serde(default)]
    pub results: Vec<PromptResult>,
    #[serde(default)]
    pub metrics: Option<EvaluationMetrics>,
    pub status: EvaluationStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Evaluation {
    #[must_use]
    pub fn new(target: EvaluationTarget, run_id: RunId, checkpoint_id: CheckpointId, prompt_set: String) -> Self {
        let now = Utc::now();
        Self {
            id: EvaluationId::new(),
            target,
            run_id,
            checkpoint_id,
            prompt_set,
            results: Vec::new(),
            metrics: None,
            status: EvaluationStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(expected: Option<&str>) -> EvalPrompt {
        EvalPrompt { prompt: "What is 2 + 2?".to_string(), expected: expected.map(str::to_string) }
    }

    #[test]
    fn test_success_requires_expected_substring() {
        assert!(PromptResult::sampled(0, &prompt(Some("four")), "It is Four.".to_string()).success);
        assert!(!PromptResult::sampled(0, &prompt(Some("four")), "5".to_string()).success);
        assert!(!PromptResult::sampled(0, &prompt(None), "   ".to_string()).success);
        assert!(PromptResult::sampled(0, &prompt(None), "4".to_string()).success);
    }

    #[test]
    fn test_metrics_aggregate() {
        let results = vec![
            PromptResult::sampled(0, &prompt(None), "abcd".to_string()),
            PromptResult::sampled(1, &prompt(Some("x")), "ab".to_string()),
            PromptResult::errored(2, &prompt(None), "timeout".to_string()),
        ];
        let metrics = EvaluationMetrics::from_results(&results);
        assert!((metrics.success_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((metrics.average_response_length - 3.0).abs() < 1e-9);
        assert_eq!(metrics.sampled, 2);
        assert_eq!(metrics.failed, 1);
    }

    #[test]
    fn test_prompt_set_validation() {
        let empty = PromptSet { name: "empty".to_string(), prompts: vec![] };
        assert!(empty.validate().is_err());
        let blank = PromptSet { name: "blank".to_string(), prompts: vec![EvalPrompt { prompt: " ".to_string(), expected: None }] };
        assert!(blank.validate().is_err());
    }
}
