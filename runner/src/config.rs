use std::path::{Path, PathBuf};
use std::time::Duration;

use engine::{EngineConfig, ProfilesConfig};
use sandbox_proc::{
    DEFAULT_READ_ONLY_PATHS, FilesystemPolicy, NetworkPolicy, ProcessContainment,
    ProcessFactoryConfig,
};
use serde::{Deserialize, Serialize};

use crate::error::{RunnerError, RunnerResult};

pub(crate) const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub base_dir: PathBuf,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub profiles: ProfilesConfig,
    #[serde(default)]
    pub spool: SpoolConfig,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter command; the script path is appended.
    pub interpreter: Vec<String>,
    pub network: NetworkPolicy,
    pub containment: ProcessContainment,
    pub filesystem: FilesystemPolicy,
    pub read_only_paths: Vec<PathBuf>,
    /// `PATH` exported to scripts; the backend default when unset.
    pub path_env: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".into()],
            network: NetworkPolicy::default(),
            containment: ProcessContainment::default(),
            filesystem: FilesystemPolicy::default(),
            read_only_paths: DEFAULT_READ_ONLY_PATHS.iter().map(PathBuf::from).collect(),
            path_env: None,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub poll_interval_ms: u64,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl SpoolConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

/// Load and validate a runner config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> RunnerResult<RunnerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: RunnerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

impl RunnerConfig {
    /// Defaults for everything, rooted at `base_dir`.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            engine: EngineConfig::default(),
            sandbox: SandboxConfig::default(),
            profiles: ProfilesConfig::default(),
            spool: SpoolConfig::default(),
        }
    }

    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.base_dir);
        self.sandbox.read_only_paths.iter_mut().for_each(resolve);
    }

    fn validate(&self) -> RunnerResult<()> {
        self.engine.validate().map_err(RunnerError::Config)?;
        if self.sandbox.interpreter.is_empty() {
            return Err(RunnerError::Config("sandbox.interpreter must not be empty".into()));
        }
        if self.profiles.max_timeout.is_zero() {
            return Err(RunnerError::Config(
                "profiles.max_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Build the process backend config, with workspaces under `sandboxes_dir`.
    pub fn factory_config(&self, sandboxes_dir: PathBuf) -> ProcessFactoryConfig {
        let mut config = ProcessFactoryConfig::new(sandboxes_dir);
        config.interpreter = self.sandbox.interpreter.clone();
        config.network = self.sandbox.network;
        config.containment = self.sandbox.containment;
        config.filesystem = self.sandbox.filesystem;
        config.read_only_paths = self.sandbox.read_only_paths.clone();
        if let Some(path_env) = &self.sandbox.path_env {
            config.path_env = path_env.clone();
        }
        config
    }
}
