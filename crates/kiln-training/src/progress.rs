//! Sinks for raw training log lines.

use crate::layout::ArtifactLayout;
use crate::metrics::strip_ansi;
use crate::run::RunId;
use std::io::Write;
use std::sync::Mutex;

/// Receives every raw output line of every attempt.
///
/// Sinks must not fail a run; write errors are logged and dropped.
pub trait LogSink: Send + Sync {
    fn write_line(&self, run_id: &RunId, attempt: u32, line: &str);
}

/// Forwards lines to `tracing` under the `kiln::run_log` target.
#[derive(Debug, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn write_line(&self, run_id: &RunId, attempt: u32, line: &str) {
        tracing::info!(target: "kiln::run_log", run_id = %run_id, attempt, "{}", strip_ansi(line));
    }
}

/// Appends lines to `runs/<run_id>/logs/run.log` with escape codes stripped.
#[derive(Debug)]
pub struct FileLogSink {
    layout: ArtifactLayout,
    // Serializes appends from concurrent runs.
    lock: Mutex<()>,
}

impl FileLogSink {
    #[must_use]
    pub fn new(layout: ArtifactLayout) -> Self {
        Self { layout, lock: Mutex::new(()) }
    }

    fn append(&self, run_id: &RunId, attempt: u32, line: &str) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(parent) = self.layout.run_log_path(run_id).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.run_log_path(run_id))?;
        writeln!(file, "[attempt {attempt}] {}", strip_ansi(line))
    }
}

impl LogSink for FileLogSink {
    fn write_line(&self, run_id: &RunId, attempt: u32, line: &str) {
        if let Err(e) = self.append(run_id, attempt, line) {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to append run log line");
        }
    }
}

/// Keeps lines in memory, for tests and the CLI.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    lines: Mutex<Vec<(RunId, u32, String)>>,
}

impl MemoryLogSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines_for(&self, run_id: &RunId) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|(id, _, _)| id == run_id)
            .map(|(_, _, line)| line.clone())
            .collect()
    }
}

impl LogSink for MemoryLogSink {
    fn write_line(&self, run_id: &RunId, attempt: u32, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((run_id.clone(), attempt, line.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_sink_strips_ansi() {
        let temp = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(temp.path().to_path_buf());
        let sink = FileLogSink::new(layout.clone());
        let run = RunId::from("run-a");

        sink.write_line(&run, 1, "\x1b[31mwarming up\x1b[0m");
        sink.write_line(&run, 2, "step: 1");

        let contents = std::fs::read_to_string(layout.run_log_path(&run)).unwrap();
        assert_eq!(contents, "[attempt 1] warming up\n[attempt 2] step: 1\n");
    }

    #[test]
    fn test_memory_sink_filters_by_run() {
        let sink = MemoryLogSink::new();
        sink.write_line(&RunId::from("a"), 1, "one");
        sink.write_line(&RunId::from("b"), 1, "two");
        assert_eq!(sink.lines_for(&RunId::from("a")), vec!["one".to_string()]);
    }
}
