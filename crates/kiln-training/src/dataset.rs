use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Shape of the examples a dataset holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetFormat {
    /// Instruction/response pairs.
    Instruction,
    /// Multi-turn `messages` conversations.
    Chat,
    /// Prompt with `chosen` and `rejected` completions.
    Preference,
    /// Prompts only, completions are sampled during training.
    Prompts,
    Text,
}

impl fmt::Display for DatasetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Instruction => "instruction",
            Self::Chat => "chat",
            Self::Preference => "preference",
            Self::Prompts => "prompts",
            Self::Text => "text",
        };
        f.write_str(name)
    }
}

/// Where a run's dataset comes from. Resolution happens outside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DatasetRef {
    HuggingFace {
        name: String,
        #[serde(default)]
        split: Option<String>,
        #[serde(default)]
        format: Option<DatasetFormat>,
    },
    Local {
        path: PathBuf,
        #[serde(default)]
        format: Option<DatasetFormat>,
    },
    /// A dataset already registered with the platform.
    Registered {
        id: String,
        #[serde(default)]
        format: Option<DatasetFormat>,
    },
}

impl DatasetRef {
    pub fn format(&self) -> Option<DatasetFormat> {
        match self {
            Self::HuggingFace { format, .. } | Self::Local { format, .. } | Self::Registered { format, .. } => {
                *format
            }
        }
    }

    /// Structural validation only; existence is the resolver's concern.
    pub fn validate(&self) -> TrainingResult<()> {
        let empty = match self {
            Self::HuggingFace { name, .. } => name.trim().is_empty(),
            Self::Local { path, .. } => path.as_os_str().is_empty(),
            Self::Registered { id, .. } => id.trim().is_empty(),
        };
        if empty {
            return Err(TrainingError::Dataset(format!("dataset reference is empty: {self}")));
        }
        Ok(())
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HuggingFace { name, split: Some(split), .. } => write!(f, "hf://{name}@{split}"),
            Self::HuggingFace { name, split: None, .. } => write!(f, "hf://{name}"),
            Self::Local { path, .. } => write!(f, "file://{}", path.display()),
            Self::Registered { id, .. } => write!(f, "dataset://{id}"),
        }
    }
}

/// Concrete, recipe-consumable dataset returned by a resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetHandle {
    pub uri: String,
    #[serde(default)]
    pub format: Option<DatasetFormat>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_ref_tagged_serde() {
        let json = r#"{"source":"hugging_face","name":"tatsu-lab/alpaca","format":"instruction"}"#;
        let parsed: DatasetRef = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.format(), Some(DatasetFormat::Instruction));
        assert_eq!(parsed.to_string(), "hf://tatsu-lab/alpaca");
        parsed.validate().unwrap();
    }

    #[test]
    fn test_empty_reference_is_rejected() {
        let empty = DatasetRef::Registered { id: " ".to_string(), format: None };
        assert!(matches!(empty.validate(), Err(TrainingError::Dataset(_))));
    }
}
