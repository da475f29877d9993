//! Replay backend driven by a JSONL script.
//!
//! Each line is one step tagged by `event`. `{"event": "next_attempt"}` starts
//! the script of the following attempt; attempts past the last segment replay
//! the last one. Steps are numbered relative to the attempt's `start_step`.
//!
//! ```text
//! {"event": "log", "line": "warming up"}
//! {"event": "metrics", "values": {"step": 10, "progress": 0.1, "loss": 0.9}}
//! {"event": "checkpoint", "step": 10, "location": "remote://ckpt/10"}
//! {"event": "error", "kind": "transient", "message": "connection reset"}
//! {"event": "next_attempt"}
//! {"event": "completed", "final_checkpoint": {"step": 100, "is_final": true}}
//! ```

use super::{
    BackendError, ProviderCheckpoint, ProviderEvent, ProviderParams, ProviderSession, Sampler, SessionHandle,
    TrainingBackend,
};
use crate::error::{OrchestrationError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use kiln_training::{Checkpoint, CheckpointId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptErrorKind {
    Transient,
    Permanent,
    Unauthorized,
}

impl ScriptErrorKind {
    fn into_error(self, message: String) -> BackendError {
        match self {
            Self::Transient => BackendError::Transient(message),
            Self::Permanent => BackendError::Permanent(message),
            Self::Unauthorized => BackendError::Unauthorized(message),
        }
    }
}

/// One scripted backend action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScriptStep {
    Log {
        line: String,
    },
    Metrics {
        values: Value,
    },
    Checkpoint(ProviderCheckpoint),
    Completed {
        #[serde(default)]
        final_checkpoint: Option<ProviderCheckpoint>,
    },
    Failed {
        message: String,
        #[serde(default)]
        retryable: bool,
    },
    /// Stream-level error.
    Error {
        kind: ScriptErrorKind,
        message: String,
    },
    Delay {
        ms: u64,
    },
    /// Never emits again.
    Hang,
    /// Fails the submission itself. Only honoured as the first step.
    Reject {
        kind: ScriptErrorKind,
        message: String,
    },
    NextAttempt,
}

#[derive(Debug, Default)]
struct Recorded {
    submissions: Vec<ProviderParams>,
    cancelled: Vec<SessionHandle>,
}

/// Backend that replays a fixed script per attempt.
#[derive(Debug)]
pub struct ScriptedBackend {
    segments: Vec<Vec<ScriptStep>>,
    recorded: Mutex<Recorded>,
}

impl ScriptedBackend {
    /// One script segment per attempt.
    #[must_use]
    pub fn new(segments: Vec<Vec<ScriptStep>>) -> Self {
        Self { segments, recorded: Mutex::new(Recorded::default()) }
    }

    /// Parses a JSONL script. Blank lines and `#` comments are skipped.
    pub fn from_jsonl(script: &str) -> Result<Self> {
        let mut segments = vec![Vec::new()];
        for (number, line) in script.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let step: ScriptStep = serde_json::from_str(line)
                .map_err(|e| OrchestrationError::Config(format!("script line {}: {}", number + 1, e)))?;
            match step {
                ScriptStep::NextAttempt => segments.push(Vec::new()),
                step => {
                    if let Some(segment) = segments.last_mut() {
                        segment.push(step);
                    }
                }
            }
        }
        Ok(Self::new(segments))
    }

    /// Parameters of every submission so far, oldest first.
    pub fn submissions(&self) -> Vec<ProviderParams> {
        self.recorded.lock().map(|r| r.submissions.clone()).unwrap_or_default()
    }

    pub fn cancelled(&self) -> Vec<SessionHandle> {
        self.recorded.lock().map(|r| r.cancelled.clone()).unwrap_or_default()
    }

    fn segment_for(&self, attempt: u32) -> Vec<ScriptStep> {
        let index = (attempt.max(1) as usize - 1).min(self.segments.len().saturating_sub(1));
        self.segments.get(index).cloned().unwrap_or_default()
    }
}

fn shift_checkpoint(mut checkpoint: ProviderCheckpoint, start_step: u64) -> ProviderCheckpoint {
    checkpoint.step = checkpoint.step.saturating_add(start_step);
    checkpoint
}

fn shift_values(mut values: Value, start_step: u64) -> Value {
    if let Some(map) = values.as_object_mut() {
        if let Some(step) = map.get("step").and_then(Value::as_u64) {
            map.insert("step".to_string(), Value::from(step.saturating_add(start_step)));
        }
    }
    values
}

#[async_trait]
impl TrainingBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, params: &ProviderParams) -> std::result::Result<ProviderSession, BackendError> {
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.submissions.push(params.clone());
        }

        let steps = self.segment_for(params.attempt);
        if let Some(ScriptStep::Reject { kind, message }) = steps.first() {
            return Err(kind.into_error(message.clone()));
        }

        let handle = SessionHandle(format!("{}-attempt-{}", params.run_id, params.attempt));
        let start_step = params.start_step;
        debug!(handle = %handle, steps = steps.len(), start_step, "Scripted session submitted");

        let events = stream::unfold(steps.into_iter(), move |mut steps| async move {
            loop {
                let event = match steps.next()? {
                    ScriptStep::Log { line } => Ok(ProviderEvent::Output { line }),
                    ScriptStep::Metrics { values } => {
                        Ok(ProviderEvent::Metrics { values: shift_values(values, start_step) })
                    }
                    ScriptStep::Checkpoint(checkpoint) => {
                        Ok(ProviderEvent::Checkpoint(shift_checkpoint(checkpoint, start_step)))
                    }
                    ScriptStep::Completed { final_checkpoint } => Ok(ProviderEvent::Completed {
                        final_checkpoint: final_checkpoint.map(|c| shift_checkpoint(c, start_step)),
                    }),
                    ScriptStep::Failed { message, retryable } => Ok(ProviderEvent::Failed { message, retryable }),
                    ScriptStep::Error { kind, message } => Err(kind.into_error(message)),
                    ScriptStep::Delay { ms } => {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        continue;
                    }
                    ScriptStep::Hang => {
                        std::future::pending::<()>().await;
                        continue;
                    }
                    ScriptStep::Reject { .. } | ScriptStep::NextAttempt => continue,
                };
                return Some((event, steps));
            }
        })
        .boxed();

        Ok(ProviderSession { handle, events })
    }

    async fn cancel(&self, handle: &SessionHandle) -> std::result::Result<(), BackendError> {
        debug!(handle = %handle, "Scripted session cancelled");
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.cancelled.push(handle.clone());
        }
        Ok(())
    }
}

/// Sampler with canned answers. Unknown prompts are echoed back.
#[derive(Debug, Default)]
pub struct ScriptedSampler {
    responses: HashMap<String, std::result::Result<String, BackendError>>,
    calls: Mutex<Vec<(CheckpointId, String)>>,
}

impl ScriptedSampler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn respond(mut self, prompt: &str, completion: &str) -> Self {
        self.responses.insert(prompt.to_string(), Ok(completion.to_string()));
        self
    }

    #[must_use]
    pub fn fail(mut self, prompt: &str, message: &str) -> Self {
        self.responses.insert(prompt.to_string(), Err(BackendError::Transient(message.to_string())));
        self
    }

    /// `(checkpoint, prompt)` pairs sampled so far.
    pub fn calls(&self) -> Vec<(CheckpointId, String)> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sampler for ScriptedSampler {
    async fn sample(&self, checkpoint: &Checkpoint, prompt: &str) -> std::result::Result<String, BackendError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((checkpoint.id.clone(), prompt.to_string()));
        }
        self.responses.get(prompt).cloned().unwrap_or_else(|| Ok(prompt.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_training::{CheckpointCadence, RecipeKind, RunId};
    use std::collections::BTreeMap;

    fn params(attempt: u32, start_step: u64) -> ProviderParams {
        ProviderParams {
            run_id: RunId::from("run"),
            attempt,
            recipe: RecipeKind::Sft,
            base_model: "modelA".to_string(),
            dataset: None,
            hyperparameters: BTreeMap::new(),
            cadence: CheckpointCadence::EndOnly,
            resume_from: None,
            start_step,
        }
    }

    const SCRIPT: &str = r#"
# attempt 1
{"event": "metrics", "values": {"step": 10, "progress": 0.1}}
{"event": "error", "kind": "transient", "message": "reset"}
{"event": "next_attempt"}
{"event": "delay", "ms": 1}
{"event": "checkpoint", "step": 5}
{"event": "completed"}
"#;

    #[test]
    fn test_jsonl_splits_attempts() {
        let backend = ScriptedBackend::from_jsonl(SCRIPT).unwrap();
        assert_eq!(backend.segments.len(), 2);
        assert_eq!(backend.segments[1].len(), 3);

        let bad = ScriptedBackend::from_jsonl("{\"event\": \"explode\"}");
        assert!(matches!(bad, Err(OrchestrationError::Config(_))));
    }

    #[tokio::test]
    async fn test_attempts_replay_their_segment() {
        let backend = ScriptedBackend::from_jsonl(SCRIPT).unwrap();

        let first: Vec<_> = backend.submit(&params(1, 0)).await.unwrap().events.collect().await;
        assert_eq!(first.len(), 2);
        assert!(matches!(first[1], Err(BackendError::Transient(_))));

        let second: Vec<_> = backend.submit(&params(2, 40)).await.unwrap().events.collect().await;
        assert!(matches!(&second[0], Ok(ProviderEvent::Checkpoint(c)) if c.step == 45));
        assert!(matches!(second[1], Ok(ProviderEvent::Completed { .. })));

        // Past the last segment the last one repeats.
        let third: Vec<_> = backend.submit(&params(3, 0)).await.unwrap().events.collect().await;
        assert_eq!(third.len(), 2);
        assert_eq!(backend.submissions().len(), 3);
    }

    #[tokio::test]
    async fn test_metric_steps_are_offset() {
        let backend = ScriptedBackend::from_jsonl(r#"{"event": "metrics", "values": {"step": 3}}"#).unwrap();
        let events: Vec<_> = backend.submit(&params(1, 100)).await.unwrap().events.collect().await;
        assert!(matches!(&events[0], Ok(ProviderEvent::Metrics { values }) if values["step"] == 103));
    }

    #[tokio::test]
    async fn test_reject_fails_submission() {
        let backend = ScriptedBackend::from_jsonl(
            r#"{"event": "reject", "kind": "unauthorized", "message": "bad key"}"#,
        )
        .unwrap();
        let result = backend.submit(&params(1, 0)).await;
        assert!(matches!(result, Err(BackendError::Unauthorized(_))));
    }
}
