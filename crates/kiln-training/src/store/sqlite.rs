use super::{CheckpointStore, EvaluationStore, RunStore};
use crate::checkpoint::{Checkpoint, CheckpointId, StorageRef};
use crate::error::{TrainingError, TrainingResult};
use crate::evaluation::{Evaluation, EvaluationId};
use crate::run::{Run, RunId, RunStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

/// SQLite-backed store.
///
/// JSON columns hold the configuration blob, dataset reference, metrics and
/// evaluation results. `UNIQUE(run_id, step)` backs the checkpoint step invariant.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> TrainingResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { conn: Mutex::new(Connection::open(path)?) };
        store.init_schema()?;
        Ok(store)
    }

    /// Opens an in-memory database for testing.
    pub fn open_in_memory() -> TrainingResult<Self> {
        let store = Self { conn: Mutex::new(Connection::open_in_memory()?) };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> TrainingResult<()> {
        info!("Initializing run store schema");
        self.conn().execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                recipe TEXT NOT NULL,
                config_json TEXT NOT NULL,
                dataset_json TEXT,
                status TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                current_step INTEGER,
                progress REAL NOT NULL,
                last_error TEXT,
                stalled INTEGER NOT NULL,
                resume_from TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);

            CREATE TABLE IF NOT EXISTS checkpoints (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                step INTEGER NOT NULL,
                storage_ref TEXT NOT NULL,
                source TEXT,
                metrics_json TEXT NOT NULL,
                is_final INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(run_id, step)
            );

            CREATE TABLE IF NOT EXISTS evaluations (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                checkpoint_id TEXT NOT NULL,
                target_json TEXT NOT NULL,
                prompt_set TEXT NOT NULL,
                results_json TEXT NOT NULL,
                metrics_json TEXT,
                status TEXT NOT NULL,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_evaluations_run ON evaluations(run_id);
            ",
        )?;
        Ok(())
    }
}

// ============================================================================
// Row Parsing Helpers
// ============================================================================

fn parse_json_field<T>(row: &Row, idx: usize, column_name: &str) -> rusqlite::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let json_str: String = row.get(idx)?;
    serde_json::from_str(&json_str).map_err(|_| {
        rusqlite::Error::InvalidColumnType(idx, column_name.to_string(), rusqlite::types::Type::Text)
    })
}

fn parse_optional_json_field<T>(row: &Row, idx: usize, column_name: &str) -> rusqlite::Result<Option<T>>
where
    T: serde::de::DeserializeOwned,
{
    let json_str: Option<String> = row.get(idx)?;
    json_str
        .map(|s| {
            serde_json::from_str(&s).map_err(|_| {
                rusqlite::Error::InvalidColumnType(idx, column_name.to_string(), rusqlite::types::Type::Text)
            })
        })
        .transpose()
}

fn parse_timestamp(row: &Row, idx: usize, column_name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let timestamp_str: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&timestamp_str).map(|dt| dt.with_timezone(&Utc)).map_err(|_| {
        rusqlite::Error::InvalidColumnType(idx, column_name.to_string(), rusqlite::types::Type::Text)
    })
}

fn parse_enum<T: std::str::FromStr>(row: &Row, idx: usize, column_name: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|_| {
        rusqlite::Error::InvalidColumnType(idx, column_name.to_string(), rusqlite::types::Type::Text)
    })
}

/// SQLite integers are signed; steps past `i64::MAX` are rejected.
fn step_to_sql(step: u64) -> TrainingResult<i64> {
    i64::try_from(step).map_err(|_| TrainingError::Storage(format!("step {step} exceeds the storable range")))
}

const RUN_COLUMNS: &str = "id, project_id, recipe, config_json, dataset_json, status, attempt, current_step, \
                           progress, last_error, stalled, resume_from, created_at, updated_at";

fn row_to_run(row: &Row) -> rusqlite::Result<Run> {
    Ok(Run {
        id: RunId(row.get(0)?),
        project_id: crate::run::ProjectId(row.get(1)?),
        recipe: parse_enum(row, 2, "recipe")?,
        config: parse_json_field(row, 3, "config_json")?,
        dataset: parse_optional_json_field(row, 4, "dataset_json")?,
        status: parse_enum(row, 5, "status")?,
        attempt: row.get(6)?,
        current_step: row.get::<_, Option<i64>>(7)?.map(|s| s as u64),
        progress: row.get(8)?,
        last_error: row.get(9)?,
        stalled: row.get(10)?,
        resume_from: row.get::<_, Option<String>>(11)?.map(CheckpointId),
        created_at: parse_timestamp(row, 12, "created_at")?,
        updated_at: parse_timestamp(row, 13, "updated_at")?,
    })
}

const CHECKPOINT_COLUMNS: &str = "id, run_id, step, storage_ref, source, metrics_json, is_final, created_at";

fn row_to_checkpoint(row: &Row) -> rusqlite::Result<Checkpoint> {
    Ok(Checkpoint {
        id: CheckpointId(row.get(0)?),
        run_id: RunId(row.get(1)?),
        step: row.get::<_, i64>(2)? as u64,
        storage_ref: StorageRef::new(row.get::<_, String>(3)?),
        source: row.get(4)?,
        metrics: parse_json_field(row, 5, "metrics_json")?,
        is_final: row.get(6)?,
        created_at: parse_timestamp(row, 7, "created_at")?,
    })
}

const EVALUATION_COLUMNS: &str = "id, run_id, checkpoint_id, target_json, prompt_set, results_json, metrics_json, \
                                  status, error, created_at, updated_at";

fn row_to_evaluation(row: &Row) -> rusqlite::Result<Evaluation> {
    Ok(Evaluation {
        id: EvaluationId(row.get(0)?),
        run_id: RunId(row.get(1)?),
        checkpoint_id: CheckpointId(row.get(2)?),
        target: parse_json_field(row, 3, "target_json")?,
        prompt_set: row.get(4)?,
        results: parse_json_field(row, 5, "results_json")?,
        metrics: parse_optional_json_field(row, 6, "metrics_json")?,
        status: parse_enum(row, 7, "status")?,
        error: row.get(8)?,
        created_at: parse_timestamp(row, 9, "created_at")?,
        updated_at: parse_timestamp(row, 10, "updated_at")?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

// ============================================================================
// Store Implementations
// ============================================================================

#[async_trait]
impl RunStore for SqliteStore {
    async fn insert_run(&self, run: &Run) -> TrainingResult<()> {
        let config_json = serde_json::to_string(&run.config)?;
        let dataset_json = run.dataset.as_ref().map(serde_json::to_string).transpose()?;
        let current_step = run.current_step.map(step_to_sql).transpose()?;
        self.conn().execute(
            &format!("INSERT INTO runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"),
            params![
                run.id.0,
                run.project_id.0,
                run.recipe.as_str(),
                config_json,
                dataset_json,
                run.status.as_str(),
                run.attempt,
                current_step,
                run.progress,
                run.last_error,
                run.stalled,
                run.resume_from.as_ref().map(|c| c.0.clone()),
                run.created_at.to_rfc3339(),
                run.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> TrainingResult<Run> {
        self.conn()
            .query_row(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"), params![id.0], row_to_run)
            .optional()?
            .ok_or_else(|| TrainingError::NotFound(format!("run {id}")))
    }

    async fn update_run(&self, run: &Run) -> TrainingResult<()> {
        let current_step = run.current_step.map(step_to_sql).transpose()?;
        let updated = self.conn().execute(
            "UPDATE runs SET status = ?2, attempt = ?3, current_step = ?4, progress = ?5, last_error = ?6, \
             stalled = ?7, resume_from = ?8, updated_at = ?9 WHERE id = ?1",
            params![
                run.id.0,
                run.status.as_str(),
                run.attempt,
                current_step,
                run.progress,
                run.last_error,
                run.stalled,
                run.resume_from.as_ref().map(|c| c.0.clone()),
                run.updated_at.to_rfc3339(),
            ],
        )?;
        if updated == 0 {
            return Err(TrainingError::NotFound(format!("run {}", run.id)));
        }
        Ok(())
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> TrainingResult<Vec<Run>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at, id"
        ))?;
        let runs = stmt
            .query_map(params![status.map(|s| s.as_str())], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> TrainingResult<()> {
        let metrics_json = serde_json::to_string(&checkpoint.metrics)?;
        let step = step_to_sql(checkpoint.step)?;
        let conn = self.conn();
        let inserted = conn.execute(
            &format!("INSERT INTO checkpoints ({CHECKPOINT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                checkpoint.id.0,
                checkpoint.run_id.0,
                step,
                checkpoint.storage_ref.as_str(),
                checkpoint.source,
                metrics_json,
                checkpoint.is_final,
                checkpoint.created_at.to_rfc3339(),
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => {
                let max_step: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(step), 0) FROM checkpoints WHERE run_id = ?1",
                    params![checkpoint.run_id.0],
                    |row| row.get(0),
                )?;
                Err(TrainingError::InvalidStepOrder {
                    run_id: checkpoint.run_id.clone(),
                    step: checkpoint.step,
                    max_step: max_step as u64,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_checkpoint(&self, id: &CheckpointId) -> TrainingResult<Checkpoint> {
        self.conn()
            .query_row(
                &format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = ?1"),
                params![id.0],
                row_to_checkpoint,
            )
            .optional()?
            .ok_or_else(|| TrainingError::NotFound(format!("checkpoint {id}")))
    }

    async fn list_checkpoints(&self, run_id: &RunId) -> TrainingResult<Vec<Checkpoint>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE run_id = ?1 ORDER BY step"))?;
        let checkpoints = stmt.query_map(params![run_id.0], row_to_checkpoint)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(checkpoints)
    }
}

#[async_trait]
impl EvaluationStore for SqliteStore {
    async fn insert_evaluation(&self, evaluation: &Evaluation) -> TrainingResult<()> {
        self.conn().execute(
            &format!("INSERT INTO evaluations ({EVALUATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
            params![
                evaluation.id.0,
                evaluation.run_id.0,
                evaluation.checkpoint_id.0,
                serde_json::to_string(&evaluation.target)?,
                evaluation.prompt_set,
                serde_json::to_string(&evaluation.results)?,
                evaluation.metrics.as_ref().map(serde_json::to_string).transpose()?,
                evaluation.status.as_str(),
                evaluation.error,
                evaluation.created_at.to_rfc3339(),
                evaluation.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn update_evaluation(&self, evaluation: &Evaluation) -> TrainingResult<()> {
        let updated = self.conn().execute(
            "UPDATE evaluations SET results_json = ?2, metrics_json = ?3, status = ?4, error = ?5, updated_at = ?6 \
             WHERE id = ?1",
            params![
                evaluation.id.0,
                serde_json::to_string(&evaluation.results)?,
                evaluation.metrics.as_ref().map(serde_json::to_string).transpose()?,
                evaluation.status.as_str(),
                evaluation.error,
                evaluation.updated_at.to_rfc3339(),
            ],
        )?;
        if updated == 0 {
            return Err(TrainingError::NotFound(format!("evaluation {}", evaluation.id)));
        }
        Ok(())
    }

    async fn get_evaluation(&self, id: &EvaluationId) -> TrainingResult<Evaluation> {
        self.conn()
            .query_row(
                &format!("SELECT {EVALUATION_COLUMNS} FROM evaluations WHERE id = ?1"),
                params![id.0],
                row_to_evaluation,
            )
            .optional()?
            .ok_or_else(|| TrainingError::NotFound(format!("evaluation {id}")))
    }

    async fn list_evaluations(&self, run_id: &RunId) -> TrainingResult<Vec<Evaluation>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("SELECT {EVALUATION_COLUMNS} FROM evaluations WHERE run_id = ?1 ORDER BY created_at"))?;
        let evaluations = stmt.query_map(params![run_id.0], row_to_evaluation)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(evaluations)
    }
}
