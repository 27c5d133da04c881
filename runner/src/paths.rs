use std::path::{Path, PathBuf};

/// Runner-level paths derived from the base directory.
pub struct RunnerPaths {
    base_dir: PathBuf,
}

impl RunnerPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn status(&self) -> PathBuf {
        self.base_dir.join("status.json")
    }

    pub fn lock(&self) -> PathBuf {
        self.base_dir.join("runner.lock")
    }

    /// Root of the process backend (per-job workspaces live below it).
    pub fn sandboxes(&self) -> PathBuf {
        self.base_dir.join("sandboxes")
    }

    pub fn spool(&self) -> PathBuf {
        self.base_dir.join("spool")
    }

    pub fn outputs(&self) -> PathBuf {
        self.base_dir.join("outputs")
    }
}
