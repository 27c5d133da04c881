use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sandbox::{Sandbox, SandboxConfig, SandboxError, SandboxFactory};
use tracing::{info, warn};

use crate::config::ProcessFactoryConfig;
use crate::paths::{FactoryPaths, SandboxPaths};
use crate::sandbox::ProcessSandbox;

/// Runs each script as a contained child process of the engine host.
pub struct ProcessFactory {
    config: ProcessFactoryConfig,
    factory_paths: FactoryPaths,
    started: AtomicBool,
}

impl ProcessFactory {
    /// Create a new factory without touching the filesystem.
    /// Call `startup()` before use.
    pub fn new(config: ProcessFactoryConfig) -> Self {
        let factory_paths = FactoryPaths::new(config.base_dir.clone());
        Self {
            config,
            factory_paths,
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ProcessFactoryConfig {
        &self.config
    }

    async fn populate(paths: &SandboxPaths, config: &SandboxConfig) -> std::io::Result<()> {
        tokio::fs::create_dir_all(paths.tmp()).await?;
        tokio::fs::write(
            paths.script(&config.script.file_name),
            config.script.contents.as_bytes(),
        )
        .await
    }
}

#[async_trait]
impl SandboxFactory for ProcessFactory {
    fn name(&self) -> &str {
        "process"
    }

    async fn startup(&mut self) -> sandbox::Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(SandboxError::CreationFailed(
                "factory already started".into(),
            ));
        }

        crate::prerequisites::check_prerequisites(&self.config).await?;

        // Workspaces left behind by a crashed engine are never resumed.
        let workspaces = self.factory_paths.workspaces();
        if workspaces.exists()
            && let Err(e) = tokio::fs::remove_dir_all(&workspaces).await
        {
            warn!(error = %e, "failed to clean stale workspaces");
        }
        tokio::fs::create_dir_all(&workspaces)
            .await
            .map_err(|e| SandboxError::CreationFailed(format!("mkdir workspaces: {e}")))?;

        self.started.store(true, Ordering::Release);
        info!(
            interpreter = ?self.config.interpreter,
            network = ?self.config.network,
            containment = ?self.config.containment,
            filesystem = ?self.config.filesystem,
            "factory started"
        );
        Ok(())
    }

    async fn create(&self, config: SandboxConfig) -> sandbox::Result<Box<dyn Sandbox>> {
        if !self.started.load(Ordering::Acquire) {
            return Err(SandboxError::BackendNotAvailable(
                "factory not started".into(),
            ));
        }
        if SandboxPaths::new(Default::default())
            .artifact(&config.script.file_name)
            .is_none()
        {
            return Err(SandboxError::InvalidConfig(format!(
                "invalid script file name: {}",
                config.script.file_name
            )));
        }

        let id = config.id.to_string();
        let sandbox_paths = SandboxPaths::new(self.factory_paths.workspace(&id));

        if let Err(e) = Self::populate(&sandbox_paths, &config).await {
            // Roll back: nothing may be left behind on failure.
            if let Err(rm_err) = tokio::fs::remove_dir_all(sandbox_paths.workspace()).await
                && rm_err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(id = %id, error = %rm_err, "failed to remove workspace during rollback");
            }
            return Err(SandboxError::CreationFailed(format!("workspace: {e}")));
        }

        info!(id = %id, "sandbox created");

        Ok(Box::new(ProcessSandbox::new(
            config,
            self.config.clone(),
            sandbox_paths,
        )))
    }

    async fn destroy(&self, sandbox: Box<dyn Sandbox>) {
        let mut sandbox = match (sandbox as Box<dyn std::any::Any>).downcast::<ProcessSandbox>() {
            Ok(s) => *s,
            Err(_) => {
                warn!("destroy called with non-process sandbox, ignoring");
                return;
            }
        };

        // Ensure nothing still runs before deleting the workspace.
        let _ = sandbox.kill().await;

        if let Err(e) = tokio::fs::remove_dir_all(sandbox.paths.workspace()).await {
            warn!(id = %sandbox.id, error = %e, "failed to delete workspace");
        }

        info!(id = %sandbox.id, "sandbox destroyed");
    }

    async fn shutdown(&mut self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(self.factory_paths.workspaces()).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(error = %e, "failed to remove workspaces");
        }
        info!("factory shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use sandbox::{ResourceLimits, ScriptSource};
    use uuid::Uuid;

    use super::*;
    use crate::config::FilesystemPolicy;

    fn factory_config(base: &std::path::Path) -> ProcessFactoryConfig {
        let mut config = ProcessFactoryConfig::new(base.to_path_buf());
        config.interpreter = vec!["/bin/sh".into()];
        config.filesystem = FilesystemPolicy::Unrestricted;
        config
    }

    fn sandbox_config(file_name: &str) -> SandboxConfig {
        SandboxConfig {
            id: Uuid::new_v4(),
            resources: ResourceLimits {
                cpu_count: 1,
                memory_mb: 256,
                cpu_time_secs: 10,
                max_output_bytes: 1024 * 1024,
            },
            script: ScriptSource {
                file_name: file_name.into(),
                contents: "echo hi\n".into(),
            },
            env: Vec::new(),
            output_file: "output".into(),
        }
    }

    #[tokio::test]
    async fn create_before_startup_fails() {
        let dir = tempfile::tempdir().unwrap();
        let factory = ProcessFactory::new(factory_config(dir.path()));
        let err = factory.create(sandbox_config("script.sh")).await.err();
        assert!(matches!(err, Some(SandboxError::BackendNotAvailable(_))));
    }

    #[tokio::test]
    async fn create_writes_script_and_destroy_removes_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let mut factory = ProcessFactory::new(factory_config(dir.path()));
        factory.startup().await.unwrap();

        let config = sandbox_config("script.sh");
        let workspace = FactoryPaths::new(dir.path().to_path_buf()).workspace(&config.id.to_string());
        let sandbox = factory.create(config).await.unwrap();

        let script = std::fs::read_to_string(workspace.join("script.sh")).unwrap();
        assert_eq!(script, "echo hi\n");
        assert!(workspace.join("tmp").is_dir());

        factory.destroy(sandbox).await;
        assert!(!workspace.exists());
        factory.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_script_names_with_separators() {
        let dir = tempfile::tempdir().unwrap();
        let mut factory = ProcessFactory::new(factory_config(dir.path()));
        factory.startup().await.unwrap();
        let err = factory.create(sandbox_config("../escape.sh")).await.err();
        assert!(matches!(err, Some(SandboxError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn double_startup_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut factory = ProcessFactory::new(factory_config(dir.path()));
        factory.startup().await.unwrap();
        assert!(factory.startup().await.is_err());
    }
}
