use std::path::{Path, PathBuf};

/// Factory-level paths derived from the base directory.
pub struct FactoryPaths {
    base_dir: PathBuf,
}

impl FactoryPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn workspaces(&self) -> PathBuf {
        self.base_dir.join("workspaces")
    }

    pub fn workspace(&self, id: &str) -> PathBuf {
        self.workspaces().join(id)
    }
}

/// Per-sandbox workspace paths. Everything here is deleted on destroy.
#[derive(Debug, Clone)]
pub struct SandboxPaths {
    workspace: PathBuf,
}

impl SandboxPaths {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Scratch space exported as `TMPDIR`.
    pub fn tmp(&self) -> PathBuf {
        self.workspace.join("tmp")
    }

    pub fn script(&self, file_name: &str) -> PathBuf {
        self.workspace.join(file_name)
    }

    /// Resolve an artifact name to a file directly inside the workspace.
    /// Only single-component names are accepted so no intermediate
    /// symlink can redirect the read outside the workspace.
    pub fn artifact(&self, name: &str) -> Option<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(std::path::Component::Normal(file)), None) => Some(self.workspace.join(file)),
            _ => None,
        }
    }
}
