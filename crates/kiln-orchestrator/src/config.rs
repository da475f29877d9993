//! Orchestrator configuration.
//!
//! Precedence, lowest first:
//! 1. Defaults
//! 2. Global config file (~/.kiln/config.toml)
//! 3. Local config file (./kiln.toml)
//! 4. Explicit config file (`--config`)
//! 5. Environment variables (`KILN_*`)
//! 6. CLI flags, applied by the caller through [`ConfigLayer`]

use crate::error::{OrchestrationError, Result};
use kiln_training::{CheckpointCadence, RecipeKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Attempts per run, first attempt included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Idle time without a metric sample before an attempt counts as stalled.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,

    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    #[serde(default = "default_eval_concurrency")]
    pub eval_concurrency: usize,

    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,

    /// SQLite database path. In-memory stores are used when absent.
    #[serde(default)]
    pub database: Option<PathBuf>,

    #[serde(default)]
    pub log_level: Option<String>,

    /// Per recipe kind cadence overrides, keyed by kind name (e.g. `RL = 50`).
    #[serde(default)]
    pub checkpoint_cadence: BTreeMap<String, CheckpointCadence>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

fn default_stall_timeout_secs() -> u64 {
    600
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_eval_concurrency() -> usize {
    4
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from(".kiln").join("artifacts")
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            stall_timeout_secs: default_stall_timeout_secs(),
            max_concurrent_runs: default_max_concurrent_runs(),
            eval_concurrency: default_eval_concurrency(),
            artifact_root: default_artifact_root(),
            database: None,
            log_level: None,
            checkpoint_cadence: BTreeMap::new(),
        }
    }
}

/// A partial configuration read from one source. Unset fields leave the
/// lower layer untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigLayer {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub retry_backoff_ms: Option<u64>,
    #[serde(default)]
    pub stall_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_concurrent_runs: Option<usize>,
    #[serde(default)]
    pub eval_concurrency: Option<usize>,
    #[serde(default)]
    pub artifact_root: Option<PathBuf>,
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub checkpoint_cadence: BTreeMap<String, CheckpointCadence>,
}

impl ConfigLayer {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OrchestrationError::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&content).map_err(|e| OrchestrationError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Reads `KILN_*` variables through `lookup`.
    pub fn from_env_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Result<Option<T>> {
            raw.map(|value| {
                value
                    .trim()
                    .parse::<T>()
                    .map_err(|_| OrchestrationError::Config(format!("{name} has an invalid value: {value}")))
            })
            .transpose()
        }

        Ok(Self {
            max_attempts: parse("KILN_MAX_ATTEMPTS", lookup("KILN_MAX_ATTEMPTS"))?,
            retry_backoff_ms: parse("KILN_RETRY_BACKOFF_MS", lookup("KILN_RETRY_BACKOFF_MS"))?,
            stall_timeout_secs: parse("KILN_STALL_TIMEOUT_SECS", lookup("KILN_STALL_TIMEOUT_SECS"))?,
            max_concurrent_runs: parse("KILN_MAX_CONCURRENT_RUNS", lookup("KILN_MAX_CONCURRENT_RUNS"))?,
            eval_concurrency: parse("KILN_EVAL_CONCURRENCY", lookup("KILN_EVAL_CONCURRENCY"))?,
            artifact_root: lookup("KILN_ARTIFACT_ROOT").map(PathBuf::from),
            database: lookup("KILN_DATABASE").map(PathBuf::from),
            log_level: lookup("KILN_LOG_LEVEL"),
            checkpoint_cadence: BTreeMap::new(),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }
}

impl OrchestratorConfig {
    pub fn default_global_path() -> PathBuf {
        std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(".")).join(".kiln").join("config.toml")
    }

    pub fn default_local_path() -> PathBuf {
        PathBuf::from("kiln.toml")
    }

    /// Builds the effective configuration from every file and the environment.
    ///
    /// Missing global and local files are skipped; an explicit file must exist.
    pub fn discover_and_load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        for path in [Self::default_global_path(), Self::default_local_path()] {
            if path.is_file() {
                config.merge(&ConfigLayer::load_from_file(&path)?);
                tracing::debug!(path = %path.display(), "Loaded config layer");
            }
        }
        if let Some(path) = explicit {
            config.merge(&ConfigLayer::load_from_file(path)?);
        }
        config.merge(&ConfigLayer::from_env()?);

        config.validate()?;
        Ok(config)
    }

    pub fn merge(&mut self, layer: &ConfigLayer) {
        if let Some(value) = layer.max_attempts {
            self.max_attempts = value;
        }
        if let Some(value) = layer.retry_backoff_ms {
            self.retry_backoff_ms = value;
        }
        if let Some(value) = layer.stall_timeout_secs {
            self.stall_timeout_secs = value;
        }
        if let Some(value) = layer.max_concurrent_runs {
            self.max_concurrent_runs = value;
        }
        if let Some(value) = layer.eval_concurrency {
            self.eval_concurrency = value;
        }
        if let Some(ref value) = layer.artifact_root {
            self.artifact_root = value.clone();
        }
        if let Some(ref value) = layer.database {
            self.database = Some(value.clone());
        }
        if let Some(ref value) = layer.log_level {
            self.log_level = Some(value.clone());
        }
        self.checkpoint_cadence.extend(layer.checkpoint_cadence.clone());
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(OrchestrationError::Config("max_attempts must be >= 1".to_string()));
        }
        if self.max_concurrent_runs == 0 {
            return Err(OrchestrationError::Config("max_concurrent_runs must be >= 1".to_string()));
        }
        if self.eval_concurrency == 0 {
            return Err(OrchestrationError::Config("eval_concurrency must be >= 1".to_string()));
        }
        if self.stall_timeout_secs == 0 {
            return Err(OrchestrationError::Config("stall_timeout_secs must be >= 1".to_string()));
        }
        self.cadence_overrides().map(|_| ())
    }

    /// Cadence overrides resolved to recipe kinds.
    pub fn cadence_overrides(&self) -> Result<BTreeMap<RecipeKind, CheckpointCadence>> {
        self.checkpoint_cadence
            .iter()
            .map(|(name, cadence)| {
                name.parse::<RecipeKind>()
                    .map(|kind| (kind, *cadence))
                    .map_err(|_| OrchestrationError::Config(format!("unknown recipe kind in checkpoint_cadence: {name}")))
            })
            .collect()
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_backoff(), Duration::from_secs(2));
        assert_eq!(config.stall_timeout(), Duration::from_secs(600));
        assert!(config.database.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_load_and_merge_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("kiln.toml");
        std::fs::write(
            &path,
            r#"
max_attempts = 5
database = "runs.db"

[checkpoint_cadence]
SFT = "end"
rl = 50
"#,
        )
        .unwrap();

        let mut config = OrchestratorConfig::default();
        config.merge(&ConfigLayer::load_from_file(&path).unwrap());

        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retry_backoff_ms, 2000);
        assert_eq!(config.database, Some(PathBuf::from("runs.db")));
        let overrides = config.cadence_overrides().unwrap();
        assert_eq!(overrides[&RecipeKind::Rl], CheckpointCadence::Every(50));
        assert_eq!(overrides[&RecipeKind::Sft], CheckpointCadence::EndOnly);
    }

    #[test]
    fn test_env_layer_overrides_file_values() {
        let layer = ConfigLayer::from_env_with(|name| match name {
            "KILN_MAX_ATTEMPTS" => Some("7".to_string()),
            "KILN_ARTIFACT_ROOT" => Some("/tmp/kiln".to_string()),
            _ => None,
        })
        .unwrap();

        let mut config = OrchestratorConfig::default();
        config.merge(&layer);
        assert_eq!(config.max_attempts, 7);
        assert_eq!(config.artifact_root, PathBuf::from("/tmp/kiln"));
        assert_eq!(config.max_concurrent_runs, 4);

        let bad = ConfigLayer::from_env_with(|name| (name == "KILN_MAX_ATTEMPTS").then(|| "many".to_string()));
        assert!(matches!(bad, Err(OrchestrationError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = OrchestratorConfig { max_attempts: 0, ..OrchestratorConfig::default() };
        assert!(config.validate().is_err());

        config.max_attempts = 1;
        config.checkpoint_cadence.insert("NOPE".to_string(), CheckpointCadence::EndOnly);
        assert!(config.validate().is_err());
    }
}
