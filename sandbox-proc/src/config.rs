use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// System directories a confined script may read and execute from.
pub const DEFAULT_READ_ONLY_PATHS: &[&str] = &[
    "/bin", "/sbin", "/usr", "/lib", "/lib64", "/etc", "/opt", "/proc", "/dev",
];

const DEFAULT_PATH_ENV: &str = "/usr/local/bin:/usr/bin:/bin";

/// Whether the script may reach the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    /// Share the host network stack (scrapers need their target).
    #[default]
    Allow,
    /// Run inside a fresh, empty network namespace.
    Deny,
}

/// What the engine can still reach once the script itself is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessContainment {
    /// The script is init of its own PID namespace; every descendant dies
    /// with it, including ones that called `setsid`.
    #[default]
    PidNamespace,
    /// Kill the script's process group only. Needs no user namespaces, but a
    /// descendant that starts a new session survives teardown.
    ProcessGroup,
}

/// How far the script can see the host filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemPolicy {
    Unrestricted,
    /// Landlock: read/execute on `read_only_paths`, full access to the workspace only.
    #[default]
    Confined,
}

#[derive(Debug, Clone)]
pub struct ProcessFactoryConfig {
    /// Base directory for runtime data (per-job workspaces live below it).
    pub base_dir: PathBuf,
    /// Interpreter command; the script path is appended as the last argument.
    pub interpreter: Vec<String>,
    pub network: NetworkPolicy,
    pub containment: ProcessContainment,
    pub filesystem: FilesystemPolicy,
    pub read_only_paths: Vec<PathBuf>,
    /// `PATH` exported to the script.
    pub path_env: String,
}

impl ProcessFactoryConfig {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            interpreter: vec!["python3".into()],
            network: NetworkPolicy::default(),
            containment: ProcessContainment::default(),
            filesystem: FilesystemPolicy::default(),
            read_only_paths: DEFAULT_READ_ONLY_PATHS.iter().map(PathBuf::from).collect(),
            path_env: DEFAULT_PATH_ENV.into(),
        }
    }
}
