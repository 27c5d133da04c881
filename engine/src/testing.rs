//! Deterministic stand-ins for the sandbox backend and the persistence sink.
//!
//! Behaviour is keyed by script text, so a test picks what a sandbox does
//! by choosing the script it submits. Timing uses tokio's clock, which makes
//! the fakes exact under `start_paused`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{
    Artifact, ProcessExit, ResourceLimits, Sandbox, SandboxConfig, SandboxError, SandboxFactory,
    WaitOutcome,
};
use tokio::time::Instant;

use crate::events::LifecycleEvent;
use crate::job::{ExecutionResult, JobRecord};
use crate::sink::{PersistenceSink, SinkError};

#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    Exit {
        code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        artifact: Option<Vec<u8>>,
        delay: Duration,
    },
    /// Never exits on its own.
    Hang,
    FailCreate,
    FailStart,
    /// Creation takes this long, then the script exits cleanly with `[]`.
    SlowCreate(Duration),
}

impl Behavior {
    pub(crate) fn exit(code: i32, stdout: &str) -> Self {
        Self::Exit {
            code,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            artifact: None,
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn after(self, delay: Duration) -> Self {
        match self {
            Self::Exit { code, stdout, stderr, artifact, .. } => Self::Exit {
                code,
                stdout,
                stderr,
                artifact,
                delay,
            },
            other => other,
        }
    }

    pub(crate) fn with_stderr(mut self, text: &str) -> Self {
        if let Self::Exit { stderr, .. } = &mut self {
            *stderr = text.as_bytes().to_vec();
        }
        self
    }

    pub(crate) fn with_artifact(mut self, text: &str) -> Self {
        if let Self::Exit { artifact, .. } = &mut self {
            *artifact = Some(text.as_bytes().to_vec());
        }
        self
    }
}

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    killed: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    /// Script text of each created sandbox, in creation order.
    order: Mutex<Vec<String>>,
}

#[derive(Default)]
pub(crate) struct FakeFactory {
    behaviors: Mutex<HashMap<String, Behavior>>,
    counters: Arc<Counters>,
}

impl FakeFactory {
    /// Scripts without a registered behaviour exit 0 printing `[]`.
    pub(crate) fn on(&self, script: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(script.to_string(), behavior);
    }

    fn behavior(&self, script: &str) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(script)
            .cloned()
            .unwrap_or_else(|| Behavior::exit(0, "[]"))
    }

    pub(crate) fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub(crate) fn destroyed(&self) -> usize {
        self.counters.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn killed(&self) -> usize {
        self.counters.killed.load(Ordering::SeqCst)
    }

    /// Sandboxes created and not yet destroyed.
    pub(crate) fn live_sandboxes(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    /// Highest number of sandboxes that existed at once.
    pub(crate) fn max_live(&self) -> usize {
        self.counters.max_live.load(Ordering::SeqCst)
    }

    pub(crate) fn creation_order(&self) -> Vec<String> {
        self.counters.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxFactory for FakeFactory {
    fn name(&self) -> &str {
        "fake"
    }

    async fn startup(&mut self) -> sandbox::Result<()> {
        Ok(())
    }

    async fn create(&self, config: SandboxConfig) -> sandbox::Result<Box<dyn Sandbox>> {
        let behavior = self.behavior(&config.script.contents);
        match behavior {
            Behavior::FailCreate => {
                return Err(SandboxError::CreationFailed("host out of capacity".into()));
            }
            Behavior::SlowCreate(delay) => tokio::time::sleep(delay).await,
            _ => {}
        }

        let c = &self.counters;
        c.created.fetch_add(1, Ordering::SeqCst);
        let live = c.live.fetch_add(1, Ordering::SeqCst) + 1;
        c.max_live.fetch_max(live, Ordering::SeqCst);
        c.order.lock().unwrap().push(config.script.contents.clone());

        Ok(Box::new(FakeSandbox {
            id: config.id.to_string(),
            limits: config.resources,
            behavior,
            started_at: None,
            alive: false,
            counters: Arc::clone(&self.counters),
        }))
    }

    async fn destroy(&self, sandbox: Box<dyn Sandbox>) {
        if (sandbox as Box<dyn std::any::Any>)
            .downcast::<FakeSandbox>()
            .is_ok()
        {
            self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn shutdown(&mut self) {}
}

struct FakeSandbox {
    id: String,
    limits: ResourceLimits,
    behavior: Behavior,
    started_at: Option<Instant>,
    alive: bool,
    counters: Arc<Counters>,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn pid(&self) -> Option<u32> {
        self.started_at.map(|_| 4242)
    }

    fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    async fn start(&mut self) -> sandbox::Result<()> {
        if matches!(self.behavior, Behavior::FailStart) {
            return Err(SandboxError::StartFailed("interpreter missing".into()));
        }
        self.started_at = Some(Instant::now());
        self.alive = true;
        Ok(())
    }

    async fn wait_exit(&mut self, deadline: Instant) -> sandbox::Result<WaitOutcome> {
        let started = self
            .started_at
            .ok_or_else(|| SandboxError::WaitFailed("not started".into()))?;
        let (code, stdout, stderr, delay) = match &self.behavior {
            Behavior::Exit { code, stdout, stderr, delay, .. } => {
                (*code, stdout.clone(), stderr.clone(), *delay)
            }
            Behavior::SlowCreate(_) => (0, b"[]".to_vec(), Vec::new(), Duration::ZERO),
            Behavior::Hang | Behavior::FailCreate | Behavior::FailStart => {
                tokio::time::sleep_until(deadline).await;
                return Ok(WaitOutcome::DeadlineExceeded);
            }
        };

        let exits_at = started + delay;
        if exits_at > deadline {
            tokio::time::sleep_until(deadline).await;
            return Ok(WaitOutcome::DeadlineExceeded);
        }
        tokio::time::sleep_until(exits_at).await;
        self.alive = false;
        Ok(WaitOutcome::Exited(ProcessExit {
            pid: 4242,
            exit_code: Some(code),
            signal: None,
            stdout,
            stderr,
            stdout_truncated: false,
            stderr_truncated: false,
        }))
    }

    async fn kill(&mut self) -> sandbox::Result<()> {
        if self.alive {
            self.alive = false;
            self.counters.killed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn read_artifact(&self, name: &str, limit: u64) -> sandbox::Result<Option<Artifact>> {
        let Behavior::Exit {
            artifact: Some(bytes),
            ..
        } = &self.behavior
        else {
            return Ok(None);
        };
        let truncated = bytes.len() as u64 > limit;
        let keep = bytes.len().min(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(Some(Artifact {
            name: name.to_string(),
            bytes: bytes[..keep].to_vec(),
            truncated,
        }))
    }
}

/// Keeps everything in memory, in arrival order.
#[derive(Default)]
pub(crate) struct MemorySink {
    events: Mutex<Vec<LifecycleEvent>>,
    results: Mutex<Vec<(JobRecord, ExecutionResult)>>,
}

impl MemorySink {
    pub(crate) fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn results(&self) -> Vec<(JobRecord, ExecutionResult)> {
        self.results.lock().unwrap().clone()
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn record_event(&self, event: &LifecycleEvent) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn record_result(
        &self,
        job: &JobRecord,
        result: &ExecutionResult,
    ) -> Result<(), SinkError> {
        self.results
            .lock()
            .unwrap()
            .push((job.clone(), result.clone()));
        Ok(())
    }
}

/// Rejects every write.
pub(crate) struct FailingSink;

#[async_trait]
impl PersistenceSink for FailingSink {
    async fn record_event(&self, _event: &LifecycleEvent) -> Result<(), SinkError> {
        Err(SinkError::Other("database unavailable".into()))
    }

    async fn record_result(
        &self,
        _job: &JobRecord,
        _result: &ExecutionResult,
    ) -> Result<(), SinkError> {
        Err(SinkError::Other("database unavailable".into()))
    }
}
