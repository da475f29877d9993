use crate::run::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Named metric values captured at a step.
pub type MetricSnapshot = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub String);

impl CheckpointId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for CheckpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Opaque handle returned by artifact storage. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageRef(String);

impl StorageRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A registered artifact snapshot of a run at a given step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub run_id: RunId,
    pub step: u64,
    pub storage_ref: StorageRef,
    /// Provider-side location (e.g. a `tinker://` path) when one was reported.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub metrics: MetricSnapshot,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied().filter(|value| value.is_finite())
    }
}

/// JSON document written to artifact storage for every checkpoint.
///
/// Carries enough to rebuild the checkpoint record from a storage scan. The
/// encoding is deterministic, so recording the same event twice yields the
/// same storage reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub kind: String,
    pub run_id: RunId,
    pub step: u64,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub metrics: MetricSnapshot,
    pub is_final: bool,
}

impl CheckpointManifest {
    pub const KIND: &'static str = "kiln.checkpoint";

    #[must_use]
    pub fn new(run_id: RunId, step: u64, source: Option<String>, metrics: MetricSnapshot, is_final: bool) -> Self {
        Self { kind: Self::KIND.to_string(), run_id, step, source, metrics, is_final }
    }

    pub fn is_checkpoint(&self) -> bool {
        self.kind == Self::KIND
    }
}

/// Direction used when picking the best checkpoint by a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricObjective {
    Minimize,
    Maximize,
}

impl MetricObjective {
    /// Strictly better; ties keep the incumbent.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Minimize => candidate < incumbent,
            Self::Maximize => candidate > incumbent,
        }
    }
}

/// How often a recipe kind produces checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CadenceRepr", into = "CadenceRepr")]
pub enum CheckpointCadence {
    /// The run produces no checkpoints at all.
    Never,
    EndOnly,
    /// Every `n` steps, plus the final one.
    Every(u64),
}

impl CheckpointCadence {
    pub fn produces_checkpoints(self) -> bool {
        !matches!(self, Self::Never)
    }

    pub fn save_every(self) -> Option<u64> {
        match self {
            Self::Every(n) => Some(n),
            Self::Never | Self::EndOnly => None,
        }
    }
}

impl fmt::Display for CheckpointCadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("none"),
            Self::EndOnly => f.write_str("end"),
            Self::Every(n) => write!(f, "every {n} steps"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum CadenceRepr {
    Steps(u64),
    Keyword(String),
}

impl TryFrom<CadenceRepr> for CheckpointCadence {
    type Error = String;

    fn try_from(value: CadenceRepr) -> Result<Self, Self::Error> {
        match value {
            CadenceRepr::Steps(0) => Err("checkpoint cadence must be at least 1 step".to_string()),
            CadenceRepr::Steps(n) => Ok(Self::Every(n)),
            CadenceRepr::Keyword(word) => match word.to_ascii_lowercase().as_str() {
                "none" | "never" => Ok(Self::Never),
                "end" | "end_only" | "final" => Ok(Self::EndOnly),
                other => Err(format!("unknown checkpoint cadence: {other}")),
            },
        }
    }
}

impl From<CheckpointCadence> for CadenceRepr {
    fn from(value: CheckpointCadence) -> Self {
        match value {
            CheckpointCadence::Never => Self::Keyword("none".to_string()),
            CheckpointCadence::EndOnly => Self::Keyword("end".to_string()),
            CheckpointCadence::Every(n) => Self::Steps(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objective_ties_keep_incumbent() {
        assert!(MetricObjective::Minimize.is_better(0.4, 0.6));
        assert!(!MetricObjective::Minimize.is_better(0.4, 0.4));
        assert!(MetricObjective::Maximize.is_better(0.9, 0.1));
    }

    #[test]
    fn test_cadence_serde_accepts_keywords_and_steps() {
        let every: CheckpointCadence = serde_json::from_str("20").unwrap();
        assert_eq!(every, CheckpointCadence::Every(20));
        let end: CheckpointCadence = serde_json::from_str("\"end\"").unwrap();
        assert_eq!(end, CheckpointCadence::EndOnly);
        assert!(serde_json::from_str::<CheckpointCadence>("0").is_err());
        assert_eq!(serde_json::to_string(&CheckpointCadence::Never).unwrap(), "\"none\"");
    }

    #[test]
    fn test_metric_ignores_nan() {
        let checkpoint = Checkpoint {
            id: CheckpointId::new(),
            run_id: RunId::from("run"),
            step: 1,
            storage_ref: StorageRef::new("abc"),
            source: None,
            metrics: [("loss".to_string(), f64::NAN)].into_iter().collect(),
            is_final: false,
            created_at: Utc::now(),
        };
        assert_eq!(checkpoint.metric("loss"), None);
        assert_eq!(checkpoint.metric("reward"), None);
    }
}
