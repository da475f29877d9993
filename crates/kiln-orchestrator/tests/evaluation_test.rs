//! Evaluations against finished runs.

mod common;

use common::{config, finish, harness, submit};
use kiln_orchestrator::OrchestrationError;
use kiln_training::{EvalPrompt, EvaluationStatus, EvaluationTarget, PromptSet, RecipeKind, RunStatus};

const SCRIPT: &str = r#"
{"event": "checkpoint", "step": 20}
{"event": "completed", "final_checkpoint": {"step": 40}}
"#;

fn prompt_set(prompts: &[(&str, Option<&str>)]) -> PromptSet {
    PromptSet {
        name: "smoke".to_string(),
        prompts: prompts
            .iter()
            .map(|(prompt, expected)| EvalPrompt {
                prompt: (*prompt).to_string(),
                expected: expected.map(str::to_string),
            })
            .collect(),
    }
}

#[tokio::test]
async fn test_evaluate_finished_run() {
    let h = harness(SCRIPT);
    let run = submit(&h.orchestrator, RecipeKind::Rl, config("m")).await;
    h.orchestrator.start_run(&run.id).await.unwrap();
    finish(&h.orchestrator, &run.id).await;

    let prompts = prompt_set(&[("What is 2+2?", Some("4")), ("Name a colour", Some("blue"))]);
    let evaluation = h.orchestrator.request_evaluation(EvaluationTarget::Run(run.id.clone()), prompts).await.unwrap();

    let final_checkpoint = h.orchestrator.latest_checkpoint(&run.id).await.unwrap().unwrap();
    assert_eq!(evaluation.checkpoint_id, final_checkpoint.id);
    assert_eq!(evaluation.status, EvaluationStatus::Completed);
    let metrics = evaluation.metrics.as_ref().unwrap();
    assert!((metrics.success_rate - 0.5).abs() < f64::EPSILON);
    assert_eq!(metrics.sampled, 2);

    let stored = h.orchestrator.list_evaluations(&run.id).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(h.orchestrator.get_evaluation(&evaluation.id).await.unwrap(), evaluation);
}

#[tokio::test]
async fn test_failed_evaluation_leaves_run_untouched() {
    let h = harness(SCRIPT);
    let run = submit(&h.orchestrator, RecipeKind::Rl, config("m")).await;
    h.orchestrator.start_run(&run.id).await.unwrap();
    finish(&h.orchestrator, &run.id).await;

    let checkpoints = h.orchestrator.list_checkpoints(&run.id).await.unwrap();
    let target = EvaluationTarget::Checkpoint(checkpoints[0].id.clone());
    let evaluation = h.orchestrator.request_evaluation(target, prompt_set(&[("broken", None)])).await.unwrap();

    assert_eq!(evaluation.status, EvaluationStatus::Failed);
    assert_eq!(evaluation.checkpoint_id, checkpoints[0].id);
    assert!(evaluation.error.unwrap().contains("sampler offline"));
    assert_eq!(h.orchestrator.get_run(&run.id).await.unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn test_evaluate_unknown_targets() {
    let h = harness(SCRIPT);
    let pending = submit(&h.orchestrator, RecipeKind::Rl, config("m")).await;

    let results = h
        .orchestrator
        .evaluate_many(vec![
            (EvaluationTarget::Run(pending.id.clone()), prompt_set(&[("hi", None)])),
            (EvaluationTarget::Checkpoint("missing".into()), prompt_set(&[("hi", None)])),
        ])
        .await
        .unwrap();
    assert!(results.iter().all(|r| matches!(r, Err(OrchestrationError::NotFound(_)))));
    assert_eq!(h.orchestrator.get_run(&pending.id).await.unwrap().status, RunStatus::Pending);
}
