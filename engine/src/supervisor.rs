//! Drives one job from `Starting` to its terminal result.

use std::sync::Arc;

use sandbox::{Artifact, ProcessExit, Sandbox, SandboxConfig, SandboxFactory, ScriptSource, WaitOutcome};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collector::{self, RawOutput};
use crate::job::{ExecutionJob, ExecutionResult, FailureKind, JobState};
use crate::registry::JobCell;

/// Bytes of stderr quoted in a script failure message.
const STDERR_TAIL_BYTES: usize = 4 * 1024;

pub(crate) struct Supervisor {
    factory: Arc<dyn SandboxFactory>,
    script_file: String,
}

impl Supervisor {
    pub(crate) fn new(factory: Arc<dyn SandboxFactory>, script_file: String) -> Self {
        Self {
            factory,
            script_file,
        }
    }

    /// Run the job and return its terminal result. Every sandbox created
    /// here is destroyed before this returns.
    pub(crate) async fn run(&self, cell: &JobCell) -> ExecutionResult {
        if !cell.advance(JobState::Starting) {
            // Finished (cancelled) while waiting for a slot.
            return ExecutionResult::Cancelled;
        }
        let job = cell.job();
        let cancel = cell.cancel_token().clone();
        let started = Instant::now();
        let deadline = started + job.profile.timeout;

        if cancel.is_cancelled() {
            return ExecutionResult::Cancelled;
        }

        let mut sandbox = match self.create(&job, deadline, &cancel).await {
            Ok(sandbox) => sandbox,
            Err(result) => return result,
        };

        // Cancellation that arrived during creation.
        if cancel.is_cancelled() {
            self.factory.destroy(sandbox).await;
            return ExecutionResult::Cancelled;
        }

        if let Err(e) = sandbox.start().await {
            warn!(job_id = %job.id, error = %e, "sandbox start failed");
            self.factory.destroy(sandbox).await;
            return ExecutionResult::failure(
                FailureKind::SandboxUnavailable,
                format!("could not start script: {e}"),
            );
        }
        cell.advance(JobState::Running);

        let waited = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            outcome = sandbox.wait_exit(deadline) => Some(outcome),
        };

        let exit = match waited {
            None => {
                info!(job_id = %job.id, "cancelling running job");
                self.kill_and_destroy(sandbox).await;
                return ExecutionResult::Cancelled;
            }
            Some(Err(e)) => {
                warn!(job_id = %job.id, error = %e, "waiting on sandbox failed");
                self.kill_and_destroy(sandbox).await;
                return ExecutionResult::failure(FailureKind::Internal, format!("wait: {e}"));
            }
            Some(Ok(WaitOutcome::DeadlineExceeded)) => {
                self.kill_and_destroy(sandbox).await;
                let duration = started.elapsed();
                info!(
                    job_id = %job.id,
                    timeout_secs = job.profile.timeout.as_secs(),
                    "wall-clock ceiling reached, sandbox killed"
                );
                return ExecutionResult::TimedOut { duration };
            }
            Some(Ok(WaitOutcome::Exited(exit))) => exit,
        };
        let duration = started.elapsed();
        cell.advance(JobState::Collecting);

        let artifact = if exit.success() {
            self.read_artifact(sandbox.as_ref(), &job).await
        } else {
            None
        };
        self.factory.destroy(sandbox).await;

        if cancel.is_cancelled() {
            return ExecutionResult::Cancelled;
        }
        interpret(&job, &exit, artifact.as_ref(), duration)
    }

    /// Create the sandbox, bounded by the job's deadline and its cancellation.
    /// A creation that is abandoned is left to finish in the background and
    /// torn down there.
    async fn create(
        &self,
        job: &ExecutionJob,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Sandbox>, ExecutionResult> {
        let factory = Arc::clone(&self.factory);
        let config = self.sandbox_config(job);
        let mut creating = tokio::spawn(async move { factory.create(config).await });

        let created = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!(job_id = %job.id, "cancelled during sandbox creation");
                self.reap_late(creating);
                return Err(ExecutionResult::Cancelled);
            }
            created = tokio::time::timeout_at(deadline, &mut creating) => created,
        };

        match created {
            Ok(Ok(Ok(sandbox))) => Ok(sandbox),
            Ok(Ok(Err(e))) => {
                warn!(job_id = %job.id, error = %e, "sandbox creation failed");
                Err(ExecutionResult::failure(
                    FailureKind::SandboxUnavailable,
                    format!("could not create sandbox: {e}"),
                ))
            }
            Ok(Err(e)) => Err(ExecutionResult::failure(
                FailureKind::Internal,
                format!("sandbox creation task failed: {e}"),
            )),
            Err(_) => {
                warn!(job_id = %job.id, "sandbox creation overran the deadline");
                self.reap_late(creating);
                Err(ExecutionResult::failure(
                    FailureKind::SandboxUnavailable,
                    "sandbox creation did not finish before the deadline",
                ))
            }
        }
    }

    /// Destroy whatever an abandoned creation eventually produces.
    fn reap_late(&self, creating: JoinHandle<sandbox::Result<Box<dyn Sandbox>>>) {
        let factory = Arc::clone(&self.factory);
        tokio::spawn(async move {
            if let Ok(Ok(sandbox)) = creating.await {
                factory.destroy(sandbox).await;
            }
        });
    }

    fn sandbox_config(&self, job: &ExecutionJob) -> SandboxConfig {
        let mut env = vec![("EXECUTION_ID".to_string(), job.id.to_string())];
        if let Some(url) = &job.target_url {
            env.push(("TARGET_URL".to_string(), url.to_string()));
        }
        SandboxConfig {
            id: job.id.as_uuid(),
            resources: job.profile.limits(),
            script: ScriptSource {
                file_name: self.script_file.clone(),
                contents: job.script.to_string(),
            },
            env,
            output_file: output_file_name(job),
        }
    }

    async fn read_artifact(&self, sandbox: &dyn Sandbox, job: &ExecutionJob) -> Option<Artifact> {
        match sandbox
            .read_artifact(&output_file_name(job), job.profile.max_output_bytes)
            .await
        {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to read output file");
                None
            }
        }
    }

    async fn kill_and_destroy(&self, mut sandbox: Box<dyn Sandbox>) {
        if let Err(e) = sandbox.kill().await {
            warn!(id = %sandbox.id(), error = %e, "kill failed");
        }
        self.factory.destroy(sandbox).await;
    }
}

pub(crate) fn output_file_name(job: &ExecutionJob) -> String {
    format!("output.{}", job.format.extension())
}

/// Combine the exit status with the collector's verdict.
fn interpret(
    job: &ExecutionJob,
    exit: &ProcessExit,
    artifact: Option<&Artifact>,
    duration: std::time::Duration,
) -> ExecutionResult {
    if !exit.success() {
        let mut message = format!("script {}", exit.describe());
        let tail = stderr_tail(&exit.stderr);
        if !tail.is_empty() {
            message.push_str(": ");
            message.push_str(&tail);
        }
        return ExecutionResult::Failure {
            kind: FailureKind::ScriptError,
            message,
            exit_code: exit.exit_code,
        };
    }

    let raw = RawOutput {
        stdout: &exit.stdout,
        stdout_truncated: exit.stdout_truncated,
        artifact,
    };
    match collector::collect(&raw, job.format, job.profile.max_output_bytes) {
        Ok(collected) => ExecutionResult::Success {
            output: collected.output,
            format: job.format,
            duration,
        },
        Err(e) => {
            info!(job_id = %job.id, reason = %e, "output not usable");
            ExecutionResult::PartialOutput {
                output: raw.diagnostic_text(),
                reason: e.reason(),
                duration,
            }
        }
    }
}

/// Last few KiB of stderr, decoded lossily and trimmed.
fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    let tail = stderr.get(start..).unwrap_or_default();
    String::from_utf8_lossy(tail).trim().to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::job::{JobId, OutputFormat, Outcome, PartialReason, TenantId};
    use crate::profile::ResourceProfile;
    use crate::sink::SinkWorker;
    use crate::testing::{Behavior, FakeFactory, MemorySink};

    fn cell_for(script: &str, format: OutputFormat, timeout: Duration) -> JobCell {
        let job = ExecutionJob {
            id: JobId::new(),
            tenant: TenantId::new("acme"),
            script: Arc::from(script),
            format,
            target_url: None,
            submitted_at: Utc::now(),
            profile: ResourceProfile {
                timeout,
                ..Default::default()
            },
            state: JobState::Queued,
            result: None,
        };
        let (handle, _worker) = SinkWorker::spawn(Arc::new(MemorySink::default()));
        JobCell::admit(job, handle)
    }

    async fn supervise(factory: &Arc<FakeFactory>, cell: &JobCell) -> ExecutionResult {
        let supervisor = Supervisor::new(factory.clone(), "script.py".into());
        supervisor.run(cell).await
    }

    #[tokio::test(start_paused = true)]
    async fn clean_exit_with_valid_output_is_success() {
        let factory = Arc::new(FakeFactory::default());
        factory.on("ok", Behavior::exit(0, "[1, 2, 3]").after(Duration::from_secs(1)));
        let cell = cell_for("ok", OutputFormat::Json, Duration::from_secs(5));

        let result = supervise(&factory, &cell).await;
        match result {
            ExecutionResult::Success { output, duration, .. } => {
                assert_eq!(output.record_count(), 3);
                assert_eq!(duration, Duration::from_secs(1));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(cell.state(), JobState::Collecting);
        assert_eq!(factory.created(), 1);
        assert_eq!(factory.destroyed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_script_times_out_at_the_ceiling() {
        let factory = Arc::new(FakeFactory::default());
        factory.on("sleep", Behavior::Hang);
        let cell = cell_for("sleep", OutputFormat::Csv, Duration::from_secs(5));

        let result = supervise(&factory, &cell).await;
        assert_eq!(
            result,
            ExecutionResult::TimedOut {
                duration: Duration::from_secs(5)
            }
        );
        // Timeouts skip collection.
        assert_eq!(cell.state(), JobState::Running);
        assert_eq!(factory.killed(), 1);
        assert_eq!(factory.destroyed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn output_after_deadline_is_discarded() {
        let factory = Arc::new(FakeFactory::default());
        factory.on(
            "slow",
            Behavior::exit(0, "a,b\n1,2\n").after(Duration::from_secs(10)),
        );
        let cell = cell_for("slow", OutputFormat::Csv, Duration::from_secs(5));

        let result = supervise(&factory, &cell).await;
        assert_eq!(result.outcome(), Outcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn nonzero_exit_is_script_error_with_stderr() {
        let factory = Arc::new(FakeFactory::default());
        factory.on(
            "boom",
            Behavior::exit(3, "[]").with_stderr("Traceback...\nValueError: bad selector\n"),
        );
        let cell = cell_for("boom", OutputFormat::Json, Duration::from_secs(5));

        match supervise(&factory, &cell).await {
            ExecutionResult::Failure {
                kind,
                message,
                exit_code,
            } => {
                assert_eq!(kind, FailureKind::ScriptError);
                assert_eq!(exit_code, Some(3));
                assert!(message.contains("bad selector"), "got: {message}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(factory.destroyed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_output_is_partial_not_failure() {
        let factory = Arc::new(FakeFactory::default());
        factory.on("bad", Behavior::exit(0, "[{\"a\": 1},"));
        let cell = cell_for("bad", OutputFormat::Json, Duration::from_secs(5));

        match supervise(&factory, &cell).await {
            ExecutionResult::PartialOutput { output, reason, .. } => {
                assert_eq!(output, "[{\"a\": 1},");
                assert!(matches!(reason, PartialReason::Unparseable(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_output_is_partial() {
        let factory = Arc::new(FakeFactory::default());
        factory.on("quiet", Behavior::exit(0, ""));
        let cell = cell_for("quiet", OutputFormat::Json, Duration::from_secs(5));

        match supervise(&factory, &cell).await {
            ExecutionResult::PartialOutput { reason, .. } => {
                assert_eq!(reason, PartialReason::Empty);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn output_file_wins_over_stdout() {
        let factory = Arc::new(FakeFactory::default());
        factory.on(
            "file",
            Behavior::exit(0, "scraped 2 pages\n").with_artifact("title\nA\nB\n"),
        );
        let cell = cell_for("file", OutputFormat::Csv, Duration::from_secs(5));

        match supervise(&factory, &cell).await {
            ExecutionResult::Success { output, format, .. } => {
                assert_eq!(format, OutputFormat::Csv);
                assert_eq!(output.record_count(), 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn creation_failure_is_sandbox_unavailable_without_leak() {
        let factory = Arc::new(FakeFactory::default());
        factory.on("x", Behavior::FailCreate);
        let cell = cell_for("x", OutputFormat::Json, Duration::from_secs(5));

        match supervise(&factory, &cell).await {
            ExecutionResult::Failure { kind, .. } => {
                assert_eq!(kind, FailureKind::SandboxUnavailable);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(cell.state(), JobState::Starting);
        assert_eq!(factory.created(), 0);
        assert_eq!(factory.live_sandboxes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_failure_destroys_the_sandbox() {
        let factory = Arc::new(FakeFactory::default());
        factory.on("x", Behavior::FailStart);
        let cell = cell_for("x", OutputFormat::Json, Duration::from_secs(5));

        let result = supervise(&factory, &cell).await;
        assert_eq!(result.outcome(), Outcome::Failure);
        assert_eq!(factory.created(), 1);
        assert_eq!(factory.destroyed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_creation_is_bounded_by_the_deadline() {
        let factory = Arc::new(FakeFactory::default());
        factory.on("x", Behavior::SlowCreate(Duration::from_secs(60)));
        let cell = cell_for("x", OutputFormat::Json, Duration::from_secs(5));

        let result = supervise(&factory, &cell).await;
        match result {
            ExecutionResult::Failure { kind, .. } => {
                assert_eq!(kind, FailureKind::SandboxUnavailable);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        // The late sandbox is torn down once creation completes.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(factory.created(), 1);
        assert_eq!(factory.destroyed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_kills_running_sandbox() {
        let factory = Arc::new(FakeFactory::default());
        factory.on("sleep", Behavior::Hang);
        let cell = cell_for("sleep", OutputFormat::Json, Duration::from_secs(300));

        let token = cell.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            token.cancel();
        });

        let result = supervise(&factory, &cell).await;
        assert_eq!(result, ExecutionResult::Cancelled);
        assert_eq!(factory.killed(), 1);
        assert_eq!(factory.destroyed(), 1);
        assert_eq!(factory.live_sandboxes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_slow_creation_resolves_promptly() {
        let factory = Arc::new(FakeFactory::default());
        factory.on("x", Behavior::SlowCreate(Duration::from_secs(120)));
        let cell = cell_for("x", OutputFormat::Json, Duration::from_secs(300));

        let token = cell.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let began = Instant::now();
        let result = supervise(&factory, &cell).await;
        assert_eq!(result, ExecutionResult::Cancelled);
        assert!(began.elapsed() < Duration::from_secs(2), "took {:?}", began.elapsed());
        assert_eq!(cell.state(), JobState::Starting);

        // The sandbox finishes creating later and is destroyed in the background.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(factory.created(), 1);
        assert_eq!(factory.destroyed(), 1);
        assert_eq!(factory.live_sandboxes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_creates_nothing() {
        let factory = Arc::new(FakeFactory::default());
        let cell = cell_for("ok", OutputFormat::Json, Duration::from_secs(5));
        cell.cancel_token().cancel();

        assert_eq!(supervise(&factory, &cell).await, ExecutionResult::Cancelled);
        assert_eq!(factory.created(), 0);
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        let mut stderr = vec![b'a'; STDERR_TAIL_BYTES];
        stderr.extend_from_slice(b"\nlast line\n");
        let tail = stderr_tail(&stderr);
        assert!(tail.ends_with("last line"));
        assert!(tail.len() <= STDERR_TAIL_BYTES);
    }
}
