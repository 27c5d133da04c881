use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::LifecycleEvent;
use crate::job::{ExecutionJob, ExecutionResult, JobId, JobState, JobStatus, Outcome, TenantId};
use crate::sink::SinkHandle;

/// Enough for every transition of one job.
const EVENT_CAPACITY: usize = 16;

struct Slot {
    job: ExecutionJob,
    history: Vec<LifecycleEvent>,
}

/// Shared record of one job. The owning supervisor is the only writer of
/// non-terminal states; the terminal state is set exactly once.
pub(crate) struct JobCell {
    pub(crate) id: JobId,
    pub(crate) tenant: TenantId,
    slot: Mutex<Slot>,
    cancel: CancellationToken,
    state_tx: watch::Sender<JobState>,
    events_tx: broadcast::Sender<LifecycleEvent>,
    sink: SinkHandle,
}

impl JobCell {
    /// Wrap a freshly admitted job and record its admission event.
    pub(crate) fn admit(job: ExecutionJob, sink: SinkHandle) -> Self {
        let (state_tx, _) = watch::channel(job.state);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let admitted = LifecycleEvent::new(job.id, job.tenant.clone(), None, job.state);
        sink.event(admitted.clone());

        Self {
            id: job.id,
            tenant: job.tenant.clone(),
            slot: Mutex::new(Slot {
                job,
                history: vec![admitted],
            }),
            cancel: CancellationToken::new(),
            state_tx,
            events_tx,
            sink,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn job(&self) -> ExecutionJob {
        self.lock().job.clone()
    }

    pub(crate) fn state(&self) -> JobState {
        self.lock().job.state
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn status(&self) -> JobStatus {
        let slot = self.lock();
        JobStatus {
            id: self.id,
            tenant: self.tenant.clone(),
            state: slot.job.state,
            result: slot.job.result.clone(),
        }
    }

    /// Ask the supervisor to stop this job. Returns `false` if the job is
    /// already terminal; once this returns `true` the job ends `Cancelled`.
    pub(crate) fn request_cancel(&self) -> bool {
        let slot = self.lock();
        if slot.job.state.is_terminal() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Move to a later non-terminal state. Returns `false` if the job is
    /// already at or past `to`.
    pub(crate) fn advance(&self, to: JobState) -> bool {
        debug_assert!(!to.is_terminal(), "use finish() for terminal states");
        self.record(to, None)
    }

    /// Set the terminal result. Only the first call wins.
    pub(crate) fn finish(&self, result: ExecutionResult) -> bool {
        let to = JobState::Terminal(result.outcome());
        self.record(to, Some(result))
    }

    fn record(&self, to: JobState, result: Option<ExecutionResult>) -> bool {
        let mut slot = self.lock();
        let (to, result) = match result {
            // An accepted cancellation wins over whatever the script produced.
            Some(result)
                if self.cancel.is_cancelled() && result != ExecutionResult::Cancelled =>
            {
                debug!(
                    job_id = %self.id,
                    discarded = %result.summary(),
                    "cancelled before completion"
                );
                (
                    JobState::Terminal(Outcome::Cancelled),
                    Some(ExecutionResult::Cancelled),
                )
            }
            other => (to, other),
        };
        let from = slot.job.state;
        if !from.can_transition_to(to) {
            debug!(job_id = %self.id, %from, %to, "ignoring stale transition");
            return false;
        }

        slot.job.state = to;
        let event = LifecycleEvent::new(self.id, self.tenant.clone(), Some(from), to);
        slot.history.push(event.clone());

        if let Some(result) = result {
            info!(
                job_id = %self.id,
                tenant = %self.tenant,
                %from,
                %to,
                summary = %result.summary(),
                "job finished"
            );
            let record = slot.job.record();
            slot.job.result = Some(result.clone());
            self.sink.event(event.clone());
            self.sink.result(record, result);
        } else {
            info!(job_id = %self.id, tenant = %self.tenant, %from, %to, "job state changed");
            self.sink.event(event.clone());
        }

        // Published under the lock so subscribers never miss or repeat an event.
        let _ = self.events_tx.send(event);
        self.state_tx.send_replace(to);
        true
    }

    /// Events so far plus a receiver for everything after them.
    pub(crate) fn subscribe(&self) -> (Vec<LifecycleEvent>, broadcast::Receiver<LifecycleEvent>) {
        let slot = self.lock();
        (slot.history.clone(), self.events_tx.subscribe())
    }

    /// Suspend until the job is terminal and return its result.
    pub(crate) async fn wait(&self) -> Option<ExecutionResult> {
        let mut rx = self.state_tx.subscribe();
        if rx.wait_for(JobState::is_terminal).await.is_err() {
            return None;
        }
        self.lock().job.result.clone()
    }
}
