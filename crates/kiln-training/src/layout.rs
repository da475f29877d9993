use crate::error::TrainingResult;
use crate::run::RunId;
use std::path::{Path, PathBuf};

/// Filesystem layout for run artifacts and logs.
///
/// Default layout is under `.kiln/artifacts/`, with content-addressed objects in
/// `objects/` and per-run logs in `runs/<run_id>/logs/`.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Create a layout rooted in a workspace directory.
    #[must_use]
    pub fn for_workspace_root(workspace_root: &Path) -> Self {
        Self::new(workspace_root.join(".kiln").join("artifacts"))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    #[must_use]
    pub fn object_path(&self, digest: &str) -> PathBuf {
        self.objects_dir().join(format!("{digest}.json"))
    }

    #[must_use]
    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join("runs").join(run_id.as_str())
    }

    #[must_use]
    pub fn run_log_path(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join("logs").join("run.log")
    }

    pub fn ensure_run_dirs(&self, run_id: &RunId) -> TrainingResult<()> {
        std::fs::create_dir_all(self.run_dir(run_id).join("logs"))?;
        Ok(())
    }
}
