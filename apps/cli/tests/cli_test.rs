//! Integration tests for the `kiln` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

const SFT_SCRIPT: &str = r#"
{"event": "log", "line": "[METRICS] step=10, loss=1.5, progress=0.1"}
{"event": "checkpoint", "step": 10, "location": "remote://ckpt/10", "metrics": {"loss": 1.5}}
{"event": "metrics", "values": {"step": 20, "loss": 0.9, "progress": 0.2}}
{"event": "checkpoint", "step": 20, "location": "remote://ckpt/20", "metrics": {"loss": 0.9}}
{"event": "completed", "final_checkpoint": {"step": 100, "location": "remote://ckpt/100", "metrics": {"loss": 1.1}}}
"#;

/// `kiln` isolated from the developer's config files and environment.
fn kiln(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("kiln").unwrap();
    cmd.current_dir(dir.path())
        .env("HOME", dir.path())
        .env("KILN_RETRY_BACKOFF_MS", "0")
        .env_remove("RUST_LOG")
        .env_remove("KILN_DATABASE")
        .env_remove("KILN_ARTIFACT_ROOT")
        .env_remove("KILN_MAX_ATTEMPTS");
    cmd
}

fn write(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path.to_str().unwrap().to_string()
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_recipes_lists_every_kind() {
    let dir = TempDir::new().unwrap();
    kiln(&dir)
        .arg("recipes")
        .assert()
        .success()
        .stdout(predicate::str::contains("ON_POLICY_DISTILLATION"))
        .stdout(predicate::str::contains("coming soon"));
}

#[test]
fn test_recipes_json() {
    let dir = TempDir::new().unwrap();
    let output = kiln(&dir).args(["recipes", "--json"]).output().unwrap();
    assert!(output.status.success());

    let rows = stdout_json(&output);
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 11);

    let dpo = rows.iter().find(|r| r["kind"] == "DPO").unwrap();
    assert_eq!(dpo["supported"], true);
    assert_eq!(dpo["family"], "preference");

    let ppo = rows.iter().find(|r| r["kind"] == "PPO").unwrap();
    assert_eq!(ppo["supported"], false);
}

#[test]
fn test_hyperparams_json() {
    let dir = TempDir::new().unwrap();
    let output = kiln(&dir)
        .args(["hyperparams", "--model", "meta-llama/Llama-3.1-8B", "--recipe", "rl", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value = stdout_json(&output);
    assert_eq!(value["model"], "meta-llama/Llama-3.1-8B");
    assert_eq!(value["recipe"], "RL");
    assert!(value["learning_rate"].as_f64().unwrap() > 0.0);
    assert!(value["full_finetune_learning_rate"].as_f64().unwrap() < value["learning_rate"].as_f64().unwrap());
}

#[test]
fn test_invalid_recipe_is_rejected() {
    let dir = TempDir::new().unwrap();
    kiln(&dir).args(["hyperparams", "--model", "m", "--recipe", "BOGUS"]).assert().failure();
}

#[test]
fn test_parse_metrics_from_file() {
    let dir = TempDir::new().unwrap();
    let log = write(
        dir.path(),
        "train.log",
        "loading model\n[METRICS] step=5, loss=2.0\nnothing here\n{\"step\": 10, \"loss\": 1.5, \"progress\": 0.5}\n",
    );

    let output = kiln(&dir).args(["parse-metrics", &log, "--json"]).output().unwrap();
    assert!(output.status.success());

    let samples = stdout_json(&output);
    let samples = samples.as_array().unwrap();
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0]["step"], 5);
    assert_eq!(samples[1]["progress"], 0.5);
}

#[test]
fn test_parse_metrics_from_stdin() {
    let dir = TempDir::new().unwrap();
    kiln(&dir)
        .args(["parse-metrics", "-"])
        .write_stdin("Training step: 200, loss: 0.45\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 samples from 1 lines"));
}

#[test]
fn test_run_then_inspect() {
    let dir = TempDir::new().unwrap();
    let script = write(dir.path(), "sft.jsonl", SFT_SCRIPT);
    let run_config = write(dir.path(), "run.toml", "base_model = \"meta-llama/Llama-3.2-1B\"\n");

    let output = kiln(&dir)
        .args(["--database", "kiln.db", "--json", "run", "--recipe", "SFT"])
        .args(["--run-config", &run_config, "--script", &script])
        .args(["--dataset", "hf://allenai/tulu-3-sft-mixture@train", "--dataset-format", "chat"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let value = stdout_json(&output);
    assert_eq!(value["run"]["status"], "completed");
    assert_eq!(value["run"]["attempt"], 1);
    let checkpoints = value["checkpoints"].as_array().unwrap();
    assert_eq!(checkpoints.len(), 3);
    let run_id = value["run"]["id"].as_str().unwrap().to_string();

    let output = kiln(&dir)
        .args(["--database", "kiln.db", "--json", "checkpoints", &run_id, "--best", "loss"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let best = stdout_json(&output);
    assert_eq!(best[0]["step"], 20);

    kiln(&dir)
        .args(["--database", "kiln.db", "show", &run_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"))
        .stdout(predicate::str::contains("remote://ckpt/100"));
}

#[test]
fn test_failed_run_exits_non_zero() {
    let dir = TempDir::new().unwrap();
    let script = write(dir.path(), "oom.jsonl", r#"{"event": "failed", "message": "CUDA out of memory", "retryable": false}"#);
    let run_config = write(dir.path(), "run.json", r#"{"base_model": "Qwen/Qwen3-8B"}"#);

    kiln(&dir)
        .args(["run", "--recipe", "SFT", "--run-config", &run_config, "--script", &script])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ended failed"))
        .stderr(predicate::str::contains("CUDA out of memory"));
}

#[test]
fn test_run_rejects_missing_base_model() {
    let dir = TempDir::new().unwrap();
    let script = write(dir.path(), "s.jsonl", r#"{"event": "completed"}"#);
    let run_config = write(dir.path(), "run.json", r#"{"learning_rate": 0.0001}"#);

    kiln(&dir)
        .args(["run", "--recipe", "SFT", "--run-config", &run_config, "--script", &script])
        .assert()
        .failure()
        .stderr(predicate::str::contains("base_model"));
}

#[test]
fn test_checkpoints_without_database_fails() {
    let dir = TempDir::new().unwrap();
    kiln(&dir)
        .args(["checkpoints", "run-123"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No database configured"));
}
