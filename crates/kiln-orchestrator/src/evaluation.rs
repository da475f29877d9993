//! Evaluation runner.
//!
//! Samples a prompt set against a checkpoint and scores the completions. Runs
//! and checkpoints are only read; an evaluation failure never touches the
//! status of the run it targets.

use crate::backend::Sampler;
use crate::checkpoint::CheckpointManager;
use crate::error::{OrchestrationError, Result};
use chrono::Utc;
use futures::StreamExt;
use futures::future::join_all;
use futures::stream;
use kiln_training::{
    Checkpoint, Evaluation, EvaluationId, EvaluationMetrics, EvaluationStatus, EvaluationStore, EvaluationTarget,
    PromptResult, PromptSet, RunId,
};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

pub struct EvaluationRunner {
    store: Arc<dyn EvaluationStore>,
    checkpoints: Arc<CheckpointManager>,
    sampler: Arc<dyn Sampler>,
    concurrency: usize,
}

impl fmt::Debug for EvaluationRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluationRunner").field("concurrency", &self.concurrency).finish_non_exhaustive()
    }
}

impl EvaluationRunner {
    pub fn new(
        store: Arc<dyn EvaluationStore>,
        checkpoints: Arc<CheckpointManager>,
        sampler: Arc<dyn Sampler>,
        concurrency: usize,
    ) -> Self {
        Self { store, checkpoints, sampler, concurrency: concurrency.max(1) }
    }

    /// Resolves a target to the checkpoint it samples from.
    ///
    /// A run resolves to its final checkpoint, else its latest.
    pub async fn resolve(&self, target: &EvaluationTarget) -> Result<Checkpoint> {
        match target {
            EvaluationTarget::Checkpoint(id) => self.checkpoints.get(id).await,
            EvaluationTarget::Run(run_id) => {
                if let Some(checkpoint) = self.checkpoints.final_checkpoint(run_id).await? {
                    return Ok(checkpoint);
                }
                self.checkpoints
                    .latest(run_id)
                    .await?
                    .ok_or_else(|| OrchestrationError::NotFound(format!("run {run_id} has no checkpoint to evaluate")))
            }
        }
    }

    /// Runs one evaluation to a terminal status.
    ///
    /// # Errors
    /// * `Validation` - empty prompt set or blank prompt
    /// * `NotFound` - the target has no checkpoint
    pub async fn evaluate(&self, target: EvaluationTarget, prompt_set: PromptSet) -> Result<Evaluation> {
        prompt_set.validate()?;
        let checkpoint = self.resolve(&target).await?;

        let mut evaluation =
            Evaluation::new(target, checkpoint.run_id.clone(), checkpoint.id.clone(), prompt_set.name.clone());
        self.store.insert_evaluation(&evaluation).await?;
        evaluation.status = EvaluationStatus::Running;
        evaluation.updated_at = Utc::now();
        self.store.update_evaluation(&evaluation).await?;

        info!(
            evaluation_id = %evaluation.id,
            checkpoint_id = %checkpoint.id,
            prompts = prompt_set.prompts.len(),
            "Evaluation started"
        );

        let checkpoint = &checkpoint;
        let results: Vec<PromptResult> = stream::iter(prompt_set.prompts.iter().enumerate())
            .map(|(index, prompt)| async move {
                match self.sampler.sample(checkpoint, &prompt.prompt).await {
                    Ok(completion) => PromptResult::sampled(index, prompt, completion),
                    Err(e) => {
                        warn!(index, error = %e, "Prompt sampling failed");
                        PromptResult::errored(index, prompt, e.to_string())
                    }
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let metrics = EvaluationMetrics::from_results(&results);
        if metrics.failed == results.len() {
            let first = results.iter().find_map(|r| r.error.clone()).unwrap_or_default();
            evaluation.status = EvaluationStatus::Failed;
            evaluation.error = Some(format!("all {} prompts failed: {first}", results.len()));
        } else {
            evaluation.status = EvaluationStatus::Completed;
        }
        evaluation.results = results;
        evaluation.metrics = Some(metrics);
        evaluation.updated_at = Utc::now();
        self.store.update_evaluation(&evaluation).await?;

        info!(
            evaluation_id = %evaluation.id,
            status = evaluation.status.as_str(),
            success_rate = evaluation.metrics.as_ref().map_or(0.0, |m| m.success_rate),
            "Evaluation finished"
        );
        Ok(evaluation)
    }

    /// Evaluates several targets concurrently. Results keep the request order.
    pub async fn evaluate_many(&self, requests: Vec<(EvaluationTarget, PromptSet)>) -> Vec<Result<Evaluation>> {
        join_all(requests.into_iter().map(|(target, prompts)| self.evaluate(target, prompts))).await
    }

    pub async fn get(&self, id: &EvaluationId) -> Result<Evaluation> {
        Ok(self.store.get_evaluation(id).await?)
    }

    pub async fn list(&self, run_id: &RunId) -> Result<Vec<Evaluation>> {
        Ok(self.store.list_evaluations(run_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedSampler;
    use crate::executor::CheckpointEvent;
    use kiln_training::{EvalPrompt, MemoryArtifactStorage, MemoryStore, MetricSnapshot};

    fn prompt(text: &str, expected: Option<&str>) -> EvalPrompt {
        EvalPrompt { prompt: text.to_string(), expected: expected.map(str::to_string) }
    }

    async fn setup(sampler: ScriptedSampler) -> (EvaluationRunner, Arc<CheckpointManager>, Arc<ScriptedSampler>) {
        let store = Arc::new(MemoryStore::new());
        let checkpoints = Arc::new(CheckpointManager::new(store.clone(), Arc::new(MemoryArtifactStorage::new())));
        let sampler = Arc::new(sampler);
        let runner = EvaluationRunner::new(store, checkpoints.clone(), sampler.clone(), 2);
        (runner, checkpoints, sampler)
    }

    async fn checkpoint(manager: &CheckpointManager, run: &str, step: u64, is_final: bool) -> Checkpoint {
        manager
            .record(&RunId::from(run), &CheckpointEvent { step, location: None, metrics: MetricSnapshot::new(), is_final })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_target_prefers_final_checkpoint() {
        let (runner, manager, sampler) = setup(ScriptedSampler::new().respond("2+2?", "It is 4.")).await;
        checkpoint(&manager, "r", 10, false).await;
        let last = checkpoint(&manager, "r", 20, true).await;

        let prompts = PromptSet {
            name: "arith".to_string(),
            prompts: vec![prompt("2+2?", Some("4")), prompt("3+3?", Some("seven"))],
        };
        let evaluation = runner.evaluate(EvaluationTarget::Run(RunId::from("r")), prompts).await.unwrap();

        assert_eq!(evaluation.status, EvaluationStatus::Completed);
        assert_eq!(evaluation.checkpoint_id, last.id);
        let metrics = evaluation.metrics.unwrap();
        assert!((metrics.success_rate - 0.5).abs() < f64::EPSILON);
        assert!(sampler.calls().iter().all(|(id, _)| *id == last.id));
        assert_eq!(evaluation.results[0].index, 0);
    }

    #[tokio::test]
    async fn test_all_prompts_erroring_fails_the_evaluation() {
        let (runner, manager, _) = setup(ScriptedSampler::new().fail("a", "down").fail("b", "down")).await;
        let target = checkpoint(&manager, "r", 1, false).await;

        let prompts = PromptSet { name: "p".to_string(), prompts: vec![prompt("a", None), prompt("b", None)] };
        let evaluation = runner.evaluate(EvaluationTarget::Checkpoint(target.id), prompts).await.unwrap();
        assert_eq!(evaluation.status, EvaluationStatus::Failed);
        assert!(evaluation.error.unwrap().contains("all 2 prompts failed"));

        let stored = runner.get(&evaluation.id).await.unwrap();
        assert_eq!(stored.status, EvaluationStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_checkpoint_and_empty_prompt_set() {
        let (runner, manager, _) = setup(ScriptedSampler::new()).await;
        let prompts = PromptSet { name: "p".to_string(), prompts: vec![prompt("hi", None)] };
        let missing = runner.evaluate(EvaluationTarget::Run(RunId::from("none")), prompts).await;
        assert!(matches!(missing, Err(OrchestrationError::NotFound(_))));

        checkpoint(&manager, "r", 1, false).await;
        let empty = PromptSet { name: "p".to_string(), prompts: Vec::new() };
        let result = runner.evaluate(EvaluationTarget::Run(RunId::from("r")), empty).await;
        assert!(matches!(result, Err(OrchestrationError::Validation(_))));
    }

    #[tokio::test]
    async fn test_evaluate_many_keeps_order() {
        let (runner, manager, _) = setup(ScriptedSampler::new()).await;
        let first = checkpoint(&manager, "a", 1, true).await;
        let second = checkpoint(&manager, "b", 1, true).await;
        let prompts = PromptSet { name: "p".to_string(), prompts: vec![prompt("echo", Some("echo"))] };

        let results = runner
            .evaluate_many(vec![
                (EvaluationTarget::Checkpoint(first.id.clone()), prompts.clone()),
                (EvaluationTarget::Run(RunId::from("b")), prompts.clone()),
                (EvaluationTarget::Run(RunId::from("missing")), prompts),
            ])
            .await;

        assert_eq!(results[0].as_ref().unwrap().checkpoint_id, first.id);
        assert_eq!(results[1].as_ref().unwrap().checkpoint_id, second.id);
        assert!(results[2].is_err());
        assert_eq!(runner.list(&RunId::from("a")).await.unwrap().len(), 1);
    }
}
