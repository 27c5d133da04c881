use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{
    Artifact, ProcessExit, ResourceLimits, Sandbox, SandboxConfig, SandboxError, WaitOutcome,
};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::capture::{Captured, read_capped};
use crate::config::ProcessFactoryConfig;
use crate::limits::ChildSetup;
use crate::paths::SandboxPaths;
use crate::process::{exit_parts, kill_process_group};

/// Cap on captured stderr; only the tail is shown in diagnostics anyway.
const STDERR_LIMIT: usize = 64 * 1024;

/// How long to wait for pipe readers after the script exits.
const READER_GRACE: Duration = Duration::from_secs(2);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SandboxState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl SandboxState {
    fn from_u8(v: u8) -> Self {
        debug_assert!(v <= 3, "invalid SandboxState: {v}");
        match v {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Running => f.write_str("running"),
            Self::Stopping => f.write_str("stopping"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

pub struct ProcessSandbox {
    /// Cached `config.id.to_string()`.
    pub(crate) id: String,
    limits: ResourceLimits,
    factory_config: ProcessFactoryConfig,
    /// Workspace paths (used by factory to delete the workspace on destroy).
    pub(crate) paths: SandboxPaths,
    script_file: String,
    output_file: String,
    env: Vec<(String, String)>,
    process: Option<tokio::process::Child>,
    pid: Option<u32>,
    started_at: Option<Instant>,
    state: AtomicU8,
    stdout_task: Option<JoinHandle<Captured>>,
    stderr_task: Option<JoinHandle<Captured>>,
}

impl ProcessSandbox {
    pub(crate) fn new(
        config: SandboxConfig,
        factory_config: ProcessFactoryConfig,
        paths: SandboxPaths,
    ) -> Self {
        Self {
            id: config.id.to_string(),
            limits: config.resources,
            factory_config,
            paths,
            script_file: config.script.file_name,
            output_file: config.output_file,
            env: config.env,
            process: None,
            pid: None,
            started_at: None,
            state: AtomicU8::new(SandboxState::Created as u8),
            stdout_task: None,
            stderr_task: None,
        }
    }

    fn current_state(&self) -> SandboxState {
        SandboxState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically transition between states using CAS. Returns `true` if the
    /// transition succeeded, `false` if the current state did not match `from`.
    fn transition(&self, from: SandboxState, to: SandboxState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Environment for the script. Nothing is inherited from the host.
    fn script_env(&self) -> Vec<(String, String)> {
        let workspace = self.paths.workspace().display().to_string();
        let mut env = vec![
            ("PATH".to_string(), self.factory_config.path_env.clone()),
            ("HOME".to_string(), workspace.clone()),
            ("TMPDIR".to_string(), self.paths.tmp().display().to_string()),
            ("LANG".to_string(), "C.UTF-8".to_string()),
            (
                "OUTPUT_FILE".to_string(),
                self.paths.script(&self.output_file).display().to_string(),
            ),
        ];
        env.extend(self.env.iter().cloned());
        env
    }

    fn output_limit(&self) -> usize {
        usize::try_from(self.limits.max_output_bytes).unwrap_or(usize::MAX)
    }

    /// Kill the process group, reap the leader, and stop the pipe readers.
    async fn kill_process(&mut self) {
        if let Some(pid) = self.pid {
            kill_process_group(pid);
        }
        if let Some(mut child) = self.process.take() {
            if let Err(e) = child.start_kill() {
                warn!(id = %self.id, error = %e, "kill failed");
            }
            // Reap the zombie process.
            let _ = child.wait().await;
        }
        for task in [self.stdout_task.take(), self.stderr_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

/// Await a pipe reader, giving up after a short grace period.
///
/// Descendants that escaped the process group kill could hold the pipe open;
/// the script's own output is already complete at this point.
async fn join_capture(id: &str, task: Option<JoinHandle<Captured>>) -> Captured {
    let Some(mut task) = task else {
        return Captured::default();
    };
    match tokio::time::timeout(READER_GRACE, &mut task).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            warn!(id = %id, error = %e, "pipe reader failed");
            Captured::default()
        }
        Err(_) => {
            warn!(id = %id, "pipe reader did not finish, abandoning");
            task.abort();
            Captured {
                bytes: Vec::new(),
                truncated: true,
            }
        }
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    fn is_alive(&self) -> bool {
        self.current_state() == SandboxState::Running
    }

    async fn start(&mut self) -> sandbox::Result<()> {
        if self.current_state() != SandboxState::Created {
            return Err(SandboxError::StartFailed("sandbox already started".into()));
        }

        let (program, args) = self
            .factory_config
            .interpreter
            .split_first()
            .ok_or_else(|| SandboxError::InvalidConfig("interpreter command is empty".into()))?;

        let setup = ChildSetup::new(&self.limits, &self.factory_config, self.paths.workspace())?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .arg(self.paths.script(&self.script_file))
            .current_dir(self.paths.workspace())
            .env_clear()
            .envs(self.script_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        // SAFETY: `ChildSetup::apply` only issues syscalls on state prepared
        // in the parent and does not allocate.
        unsafe {
            command.pre_exec(move || setup.apply());
        }

        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::StartFailed(format!("spawn {program}: {e}")))?;

        let limit = self.output_limit();
        self.stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_capped(stdout, limit)));
        self.stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_capped(stderr, STDERR_LIMIT)));

        self.pid = child.id();
        self.process = Some(child);
        self.started_at = Some(Instant::now());

        if !self.transition(SandboxState::Created, SandboxState::Running) {
            self.kill_process().await;
            return Err(SandboxError::StartFailed(
                "sandbox state changed during startup".into(),
            ));
        }

        info!(id = %self.id, pid = ?self.pid, "script started");
        Ok(())
    }

    async fn wait_exit(&mut self, deadline: Instant) -> sandbox::Result<WaitOutcome> {
        let state = self.current_state();
        let Some(child) = self.process.as_mut() else {
            return Err(SandboxError::WaitFailed(format!(
                "sandbox not running (state: {state})"
            )));
        };

        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Err(_) => return Ok(WaitOutcome::DeadlineExceeded),
            Ok(Err(e)) => return Err(SandboxError::WaitFailed(format!("wait: {e}"))),
            Ok(Ok(status)) => status,
        };
        self.process = None;

        // Nothing the script spawned may outlive it.
        let pid = self.pid.unwrap_or_default();
        kill_process_group(pid);
        self.state
            .store(SandboxState::Stopped as u8, Ordering::Release);

        let stdout = join_capture(&self.id, self.stdout_task.take()).await;
        let stderr = join_capture(&self.id, self.stderr_task.take()).await;
        let (exit_code, signal) = exit_parts(status);

        info!(id = %self.id, ?exit_code, ?signal, "script exited");

        Ok(WaitOutcome::Exited(ProcessExit {
            pid,
            exit_code,
            signal,
            stdout: stdout.bytes,
            stderr: stderr.bytes,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
        }))
    }

    async fn kill(&mut self) -> sandbox::Result<()> {
        if !self.transition(SandboxState::Running, SandboxState::Stopping) {
            return Ok(());
        }
        self.kill_process().await;
        self.state
            .store(SandboxState::Stopped as u8, Ordering::Release);
        info!(id = %self.id, "sandbox killed");
        Ok(())
    }

    async fn read_artifact(&self, name: &str, limit: u64) -> sandbox::Result<Option<Artifact>> {
        let path = self
            .paths
            .artifact(name)
            .ok_or_else(|| SandboxError::InvalidConfig(format!("invalid artifact name: {name}")))?;

        // O_NOFOLLOW: a script must not be able to point us at a host file.
        // O_NONBLOCK: a FIFO must not stall the supervisor.
        let file = match tokio::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(id = %self.id, artifact = name, error = %e, "artifact not readable");
                return Ok(None);
            }
        };
        if !file.metadata().await?.is_file() {
            warn!(id = %self.id, artifact = name, "artifact is not a regular file, ignoring");
            return Ok(None);
        }

        let mut bytes = Vec::new();
        file.take(limit.saturating_add(1))
            .read_to_end(&mut bytes)
            .await?;
        let truncated = bytes.len() as u64 > limit;
        bytes.truncate(usize::try_from(limit).unwrap_or(usize::MAX));

        Ok(Some(Artifact {
            name: name.to_string(),
            bytes,
            truncated,
        }))
    }
}
