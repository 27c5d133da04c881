use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures_util::stream::{self, BoxStream, StreamExt};
use sandbox::SandboxFactory;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use url::Url;

use crate::config::EngineConfig;
use crate::error::{SubmitError, SubmitResult};
use crate::events::LifecycleEvent;
use crate::job::{
    ExecutionJob, ExecutionResult, JobId, JobRequest, JobState, JobStatus, TenantId,
};
use crate::profile::ProfileResolver;
use crate::queue::FairQueue;
use crate::registry::JobCell;
use crate::sink::{PersistenceSink, SinkHandle, SinkWorker};
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    Accepting,
    /// No new submissions; queued and running jobs finish normally.
    Draining,
    /// No new submissions; everything outstanding is cancelled.
    Stopping,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub mode: EngineMode,
    pub queued: usize,
    /// Jobs holding a sandbox slot (starting, running or collecting).
    pub active: usize,
    pub running: usize,
    pub pool_size: usize,
    /// Terminal jobs still answerable by `status`.
    pub retained: usize,
}

struct EngineState {
    mode: EngineMode,
    queue: FairQueue,
    jobs: HashMap<JobId, Arc<JobCell>>,
    /// Terminal jobs in completion order, for eviction.
    finished: VecDeque<JobId>,
    /// Queued plus dispatched, non-terminal jobs per tenant.
    outstanding: HashMap<TenantId, usize>,
    active: usize,
}

struct EngineInner {
    config: EngineConfig,
    profiles: Arc<dyn ProfileResolver>,
    supervisor: Supervisor,
    state: Mutex<EngineState>,
    slots: Arc<Semaphore>,
    wakeup: Notify,
    stop: CancellationToken,
    supervisors: TaskTracker,
    sink: SinkHandle,
    /// Taken by whichever of `drain`/`shutdown` runs first.
    background: Mutex<Option<(JoinHandle<()>, SinkWorker)>>,
}

/// Admits jobs, bounds concurrent sandboxes, and hands ready jobs to
/// supervisors. Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Start the dispatch loop and the sink worker on the current runtime.
    ///
    /// The factory must already be started; the caller shuts it down after
    /// `drain` or `shutdown` returns.
    pub fn start(
        config: EngineConfig,
        factory: Arc<dyn SandboxFactory>,
        profiles: Arc<dyn ProfileResolver>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Result<Self, String> {
        config.validate()?;
        let (sink_handle, sink_worker) = SinkWorker::spawn(sink);

        let inner = Arc::new(EngineInner {
            supervisor: Supervisor::new(factory, config.script_file.clone()),
            slots: Arc::new(Semaphore::new(config.pool_size)),
            config,
            profiles,
            state: Mutex::new(EngineState {
                mode: EngineMode::Accepting,
                queue: FairQueue::default(),
                jobs: HashMap::new(),
                finished: VecDeque::new(),
                outstanding: HashMap::new(),
                active: 0,
            }),
            wakeup: Notify::new(),
            stop: CancellationToken::new(),
            supervisors: TaskTracker::new(),
            sink: sink_handle,
            background: Mutex::new(None),
        });

        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&inner)));
        *lock(&inner.background) = Some((dispatcher, sink_worker));

        info!(
            pool_size = inner.config.pool_size,
            queue_capacity = inner.config.queue_capacity,
            "engine started"
        );
        Ok(Self { inner })
    }

    /// Validate and enqueue. Never blocks and never creates a sandbox.
    pub fn submit(&self, request: JobRequest) -> SubmitResult<JobId> {
        let inner = &self.inner;
        let script = request.script;
        if script.trim().is_empty() {
            return Err(SubmitError::Validation("script is empty".into()));
        }
        if script.len() > inner.config.max_script_bytes {
            return Err(SubmitError::Validation(format!(
                "script is {} bytes, limit is {}",
                script.len(),
                inner.config.max_script_bytes
            )));
        }
        let target_url = request
            .target_url
            .as_deref()
            .map(parse_target_url)
            .transpose()?;

        let policy = inner.profiles.resolve(&request.tenant);
        let profile = policy
            .profile
            .apply(&request.overrides)
            .map_err(SubmitError::Validation)?;

        let mut state = lock(&inner.state);
        if state.mode != EngineMode::Accepting {
            return Err(SubmitError::ShuttingDown);
        }
        let id = request.id.unwrap_or_default();
        if state.jobs.contains_key(&id) {
            return Err(SubmitError::Validation(format!("duplicate job id {id}")));
        }
        let outstanding = state.outstanding.get(&request.tenant).copied().unwrap_or(0);
        if outstanding >= policy.max_active_jobs {
            return Err(SubmitError::QuotaExceeded {
                tenant: request.tenant,
                limit: policy.max_active_jobs,
            });
        }
        if state.queue.len() >= inner.config.queue_capacity {
            return Err(SubmitError::Backpressure {
                capacity: inner.config.queue_capacity,
            });
        }

        let job = ExecutionJob {
            id,
            tenant: request.tenant.clone(),
            script: Arc::from(script),
            format: request.format,
            target_url,
            submitted_at: Utc::now(),
            profile,
            state: JobState::Queued,
            result: None,
        };
        info!(
            job_id = %id,
            tenant = %request.tenant,
            format = %request.format,
            timeout_secs = profile.timeout.as_secs(),
            "job admitted"
        );
        let cell = Arc::new(JobCell::admit(job, inner.sink.clone()));
        state.jobs.insert(id, cell);
        state.queue.push(request.tenant.clone(), id);
        *state.outstanding.entry(request.tenant).or_default() += 1;
        drop(state);

        inner.wakeup.notify_one();
        Ok(id)
    }

    /// Cancel a job. A queued job is removed without ever getting a sandbox;
    /// a running one has its sandbox killed. When this returns `true` the
    /// job's terminal result is `Cancelled`.
    ///
    /// Returns `false` for unknown or already terminal jobs.
    pub fn cancel(&self, id: JobId) -> bool {
        let Some(cell) = self.inner.cell(id) else {
            return false;
        };
        if !cell.request_cancel() {
            return false;
        }
        let was_queued = lock(&self.inner.state).queue.remove(&cell.tenant, id);
        if was_queued {
            info!(job_id = %id, "cancelled while queued");
            self.inner.complete(&cell, ExecutionResult::Cancelled);
        } else {
            info!(job_id = %id, "cancellation forwarded to supervisor");
        }
        true
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.inner.cell(id).map(|cell| cell.status())
    }

    /// Lifecycle events of one job: everything so far, then live events
    /// until the terminal one. The stream is finite.
    pub fn stream_events(&self, id: JobId) -> Option<BoxStream<'static, LifecycleEvent>> {
        let cell = self.inner.cell(id)?;
        let (history, rx) = cell.subscribe();
        let done = history.last().is_some_and(LifecycleEvent::is_terminal);

        let live = stream::unfold((rx, done), |(mut rx, done)| async move {
            if done {
                return None;
            }
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let done = event.is_terminal();
                        return Some((event, (rx, done)));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event stream lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Some(stream::iter(history).chain(live).boxed())
    }

    /// Suspend until the job is terminal. `None` for unknown jobs.
    pub async fn wait(&self, id: JobId) -> Option<ExecutionResult> {
        let cell = self.inner.cell(id)?;
        cell.wait().await
    }

    pub fn stats(&self) -> EngineStats {
        let state = lock(&self.inner.state);
        EngineStats {
            mode: state.mode,
            queued: state.queue.len(),
            active: state.active,
            running: state
                .jobs
                .values()
                .filter(|cell| cell.state() == JobState::Running)
                .count(),
            pool_size: self.inner.config.pool_size,
            retained: state.finished.len(),
        }
    }

    pub fn mode(&self) -> EngineMode {
        lock(&self.inner.state).mode
    }

    /// Stop admitting, let every queued and running job finish, then stop
    /// the background tasks.
    pub async fn drain(&self) {
        self.inner.set_mode(EngineMode::Draining);
        self.inner.wakeup.notify_one();
        self.inner.finish_background().await;
    }

    /// Stop admitting, cancel everything outstanding, wait for supervisors
    /// to tear down their sandboxes, and flush the sink.
    pub async fn shutdown(&self) {
        self.inner.set_mode(EngineMode::Stopping);

        let queued: Vec<Arc<JobCell>> = {
            let mut state = lock(&self.inner.state);
            let ids = state.queue.drain();
            ids.into_iter()
                .filter_map(|id| state.jobs.get(&id).cloned())
                .collect()
        };
        for cell in &queued {
            cell.cancel_token().cancel();
            self.inner.complete(cell, ExecutionResult::Cancelled);
        }

        let running: Vec<Arc<JobCell>> = lock(&self.inner.state)
            .jobs
            .values()
            .filter(|cell| !cell.state().is_terminal())
            .cloned()
            .collect();
        for cell in &running {
            cell.cancel_token().cancel();
        }
        info!(
            queued = queued.len(),
            running = running.len(),
            "engine stopping"
        );

        self.inner.stop.cancel();
        self.inner.finish_background().await;
    }
}

impl EngineInner {
    fn cell(&self, id: JobId) -> Option<Arc<JobCell>> {
        lock(&self.state).jobs.get(&id).cloned()
    }

    fn set_mode(&self, mode: EngineMode) {
        let mut state = lock(&self.state);
        if state.mode == EngineMode::Stopping {
            return;
        }
        if state.mode != mode {
            info!(from = ?state.mode, to = ?mode, "engine mode changed");
            state.mode = mode;
        }
    }

    /// Next job to dispatch, or `None` if the queue is empty.
    fn pop_ready(&self) -> Option<Arc<JobCell>> {
        let mut state = lock(&self.state);
        while let Some((_, id)) = state.queue.pop() {
            if let Some(cell) = state.jobs.get(&id).cloned() {
                state.active += 1;
                return Some(cell);
            }
        }
        None
    }

    /// Record the terminal result and release the job's accounting.
    fn complete(&self, cell: &JobCell, result: ExecutionResult) {
        if !cell.finish(result) {
            return;
        }
        let mut state = lock(&self.state);
        if let Some(count) = state.outstanding.get_mut(&cell.tenant) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.outstanding.remove(&cell.tenant);
            }
        }
        state.finished.push_back(cell.id);
        while state.finished.len() > self.config.retain_finished {
            if let Some(evicted) = state.finished.pop_front() {
                state.jobs.remove(&evicted);
            }
        }
    }

    async fn finish_background(&self) {
        let background = lock(&self.background).take();
        let Some((dispatcher, sink_worker)) = background else {
            // Another caller is already finishing; wait for the supervisors it waits for.
            self.supervisors.wait().await;
            return;
        };

        if let Err(e) = dispatcher.await {
            error!(error = %e, "dispatch loop panicked");
        }
        self.supervisors.close();
        self.supervisors.wait().await;
        sink_worker.close().await;
        info!("engine stopped");
    }
}

async fn dispatch_loop(inner: Arc<EngineInner>) {
    loop {
        // A slot is reserved before a job leaves the queue, so a dequeued
        // job never waits and a slot is never handed out twice.
        let permit = tokio::select! {
            () = inner.stop.cancelled() => break,
            permit = Arc::clone(&inner.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let cell = loop {
            if let Some(cell) = inner.pop_ready() {
                break Some(cell);
            }
            if lock(&inner.state).mode != EngineMode::Accepting {
                break None;
            }
            tokio::select! {
                () = inner.stop.cancelled() => break None,
                () = inner.wakeup.notified() => {}
            }
        };
        let Some(cell) = cell else { break };

        let task_inner = Arc::clone(&inner);
        inner.supervisors.spawn(async move {
            let result = task_inner.supervisor.run(&cell).await;
            task_inner.complete(&cell, result);
            lock(&task_inner.state).active -= 1;
            drop(permit);
        });
    }
    info!("dispatch loop stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parse_target_url(raw: &str) -> SubmitResult<Url> {
    let url = Url::parse(raw)
        .map_err(|e| SubmitError::Validation(format!("invalid target url {raw:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(SubmitError::Validation(format!(
            "target url scheme must be http or https, got {other}"
        ))),
    }
}
