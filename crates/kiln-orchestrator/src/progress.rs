//! Push-based progress delivery.
//!
//! Every attempt publishes [`RunEvent`]s on one broadcast channel. The
//! reporter also keeps the last known [`RunSnapshot`] per active run so polling
//! readers never have to replay the stream.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kiln_training::{Checkpoint, MetricSample, Run, RunId, RunStatus};
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

/// Progress event types.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    StatusChanged {
        run_id: RunId,
        status: RunStatus,
        attempt: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Progress {
        run_id: RunId,
        attempt: u32,
        sample: MetricSample,
    },
    CheckpointRegistered {
        checkpoint: Checkpoint,
    },
    /// No sample within the stall timeout. A retry follows.
    Stalled {
        run_id: RunId,
        attempt: u32,
        idle_secs: u64,
    },
    Log {
        run_id: RunId,
        attempt: u32,
        line: String,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::StatusChanged { run_id, .. }
            | Self::Progress { run_id, .. }
            | Self::Stalled { run_id, .. }
            | Self::Log { run_id, .. } => run_id,
            Self::CheckpointRegistered { checkpoint } => &checkpoint.run_id,
        }
    }
}

/// Last known state of a run, served to polling readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub status: RunStatus,
    pub attempt: u32,
    pub current_step: Option<u64>,
    pub progress: f64,
    pub last_sample: Option<MetricSample>,
    pub stalled: bool,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn from_run(run: &Run) -> Self {
        Self {
            run_id: run.id.clone(),
            status: run.status,
            attempt: run.attempt,
            current_step: run.current_step,
            progress: run.progress,
            last_sample: None,
            stalled: run.stalled,
            last_error: run.last_error.clone(),
            updated_at: run.updated_at,
        }
    }

    fn refresh(&mut self, run: &Run) {
        self.status = run.status;
        self.attempt = run.attempt;
        self.current_step = run.current_step;
        self.progress = run.progress;
        self.stalled = run.stalled;
        self.last_error = run.last_error.clone();
        self.updated_at = run.updated_at;
    }
}

/// Progress reporter shared by every worker.
pub struct ProgressReporter {
    broadcast_tx: broadcast::Sender<RunEvent>,
    snapshots: DashMap<RunId, RunSnapshot>,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("subscribers", &self.broadcast_tx.receiver_count())
            .field("tracked_runs", &self.snapshots.len())
            .finish()
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    #[must_use]
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(100);
        Self { broadcast_tx, snapshots: DashMap::new() }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.broadcast_tx.subscribe()
    }

    pub fn snapshot(&self, run_id: &RunId) -> Option<RunSnapshot> {
        self.snapshots.get(run_id).map(|entry| entry.value().clone())
    }

    fn emit(&self, event: RunEvent) {
        debug!(run_id = %event.run_id(), "Progress event: {:?}", event);
        let _ = self.broadcast_tx.send(event);
    }

    fn update(&self, run: &Run) {
        self.snapshots
            .entry(run.id.clone())
            .and_modify(|snapshot| snapshot.refresh(run))
            .or_insert_with(|| RunSnapshot::from_run(run));
    }

    /// Records a status transition of `run`. A terminal status drops the
    /// run's snapshot; later reads go to the store.
    pub fn status_changed(&self, run: &Run) {
        if run.status.is_terminal() {
            self.snapshots.remove(&run.id);
        } else {
            self.update(run);
        }
        self.emit(RunEvent::StatusChanged {
            run_id: run.id.clone(),
            status: run.status,
            attempt: run.attempt,
            error: run.last_error.clone().filter(|_| run.status == RunStatus::Failed),
        });
    }

    /// Records a sample already folded into `run`.
    pub fn progress(&self, run: &Run, sample: &MetricSample) {
        self.update(run);
        if let Some(mut snapshot) = self.snapshots.get_mut(&run.id) {
            snapshot.last_sample = Some(sample.clone());
        }
        self.emit(RunEvent::Progress { run_id: run.id.clone(), attempt: run.attempt, sample: sample.clone() });
    }

    pub fn checkpoint_registered(&self, checkpoint: &Checkpoint) {
        self.emit(RunEvent::CheckpointRegistered { checkpoint: checkpoint.clone() });
    }

    pub fn stalled(&self, run: &Run, idle_secs: u64) {
        self.update(run);
        self.emit(RunEvent::Stalled { run_id: run.id.clone(), attempt: run.attempt, idle_secs });
    }

    pub fn log(&self, run_id: &RunId, attempt: u32, line: &str) {
        self.emit(RunEvent::Log { run_id: run_id.clone(), attempt, line: line.to_string() });
    }

    /// Waits on `rx` for a terminal status change of `run_id`.
    ///
    /// Returns `false` when events were dropped, in which case the caller
    /// must re-read the run before waiting again.
    pub async fn wait_for_terminal(mut rx: broadcast::Receiver<RunEvent>, run_id: &RunId) -> bool {
        loop {
            match rx.recv().await {
                Ok(RunEvent::StatusChanged { run_id: id, status, .. }) if id == *run_id && status.is_terminal() => {
                    return true;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(run_id = %run_id, skipped, "Terminal wait lagged");
                    return false;
                }
                Err(RecvError::Closed) => return true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_training::{ProjectId, RecipeKind, RunConfig};
    use std::sync::Arc;

    fn running_run() -> Run {
        let mut run = Run::new(ProjectId::from("p"), RecipeKind::Sft, RunConfig::new(), None);
        run.status = RunStatus::Running;
        run.attempt = 1;
        run
    }

    #[tokio::test]
    async fn test_snapshot_tracks_progress() {
        let reporter = ProgressReporter::new();
        let mut rx = reporter.subscribe();
        let mut run = running_run();
        reporter.status_changed(&run);

        let sample = MetricSample { progress: Some(0.25), ..MetricSample::empty(Utc::now()) };
        run.progress = 0.25;
        reporter.progress(&run, &sample);

        let snapshot = reporter.snapshot(&run.id).unwrap();
        assert!((snapshot.progress - 0.25).abs() < f64::EPSILON);
        assert_eq!(snapshot.last_sample, Some(sample));

        assert!(matches!(rx.recv().await.unwrap(), RunEvent::StatusChanged { status: RunStatus::Running, .. }));
        assert!(matches!(rx.recv().await.unwrap(), RunEvent::Progress { attempt: 1, .. }));
    }

    #[tokio::test]
    async fn test_terminal_status_drops_snapshot() {
        let reporter = ProgressReporter::new();
        let mut run = running_run();
        reporter.status_changed(&run);
        assert!(reporter.snapshot(&run.id).is_some());

        run.status = RunStatus::Completed;
        reporter.status_changed(&run);
        assert!(reporter.snapshot(&run.id).is_none());
    }

    #[tokio::test]
    async fn test_wait_for_terminal() {
        let reporter = Arc::new(ProgressReporter::new());
        let mut run = running_run();
        reporter.status_changed(&run);

        let waiter = {
            let rx = reporter.subscribe();
            let run_id = run.id.clone();
            tokio::spawn(async move { ProgressReporter::wait_for_terminal(rx, &run_id).await })
        };

        reporter.log(&run.id, 1, "still going");
        run.status = RunStatus::Failed;
        run.last_error = Some("boom".to_string());
        reporter.status_changed(&run);

        assert!(waiter.await.unwrap());
    }
}
