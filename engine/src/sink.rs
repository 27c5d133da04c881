use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::LifecycleEvent;
use crate::job::{ExecutionResult, JobRecord};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Durable storage for lifecycle events and terminal results.
///
/// The engine never retries a failed write; retrying is the sink's job.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn record_event(&self, event: &LifecycleEvent) -> Result<(), SinkError>;
    async fn record_result(
        &self,
        job: &JobRecord,
        result: &ExecutionResult,
    ) -> Result<(), SinkError>;
}

/// Discards everything.
pub struct NullSink;

#[async_trait]
impl PersistenceSink for NullSink {
    async fn record_event(&self, _event: &LifecycleEvent) -> Result<(), SinkError> {
        Ok(())
    }

    async fn record_result(
        &self,
        _job: &JobRecord,
        _result: &ExecutionResult,
    ) -> Result<(), SinkError> {
        Ok(())
    }
}

pub(crate) enum SinkMessage {
    Event(LifecycleEvent),
    Result(JobRecord, ExecutionResult),
}

/// Sending half of the sink worker. Never blocks.
#[derive(Clone)]
pub(crate) struct SinkHandle {
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl SinkHandle {
    pub(crate) fn event(&self, event: LifecycleEvent) {
        if self.tx.send(SinkMessage::Event(event)).is_err() {
            debug!("sink worker gone, dropping event");
        }
    }

    pub(crate) fn result(&self, job: JobRecord, result: ExecutionResult) {
        let job_id = job.id;
        if self.tx.send(SinkMessage::Result(job, result)).is_err() {
            warn!(job_id = %job_id, "sink worker gone, dropping result");
        }
    }
}

/// Single task that forwards messages to the sink in emission order.
pub(crate) struct SinkWorker {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl SinkWorker {
    pub(crate) fn spawn(sink: Arc<dyn PersistenceSink>) -> (SinkHandle, Self) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let token = stop.clone();

        let handle = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    () = token.cancelled() => {
                        // Flush what was queued before the stop request.
                        while let Ok(msg) = rx.try_recv() {
                            deliver(sink.as_ref(), msg).await;
                        }
                        break;
                    }
                };
                deliver(sink.as_ref(), msg).await;
            }
            debug!("sink worker stopped");
        });

        (SinkHandle { tx }, Self { stop, handle })
    }

    /// Deliver everything already queued, then stop.
    pub(crate) async fn close(self) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "sink worker panicked");
        }
    }
}

async fn deliver(sink: &dyn PersistenceSink, msg: SinkMessage) {
    match msg {
        SinkMessage::Event(event) => {
            if let Err(e) = sink.record_event(&event).await {
                warn!(job_id = %event.job_id, error = %e, "failed to persist lifecycle event");
            }
        }
        SinkMessage::Result(job, result) => {
            if let Err(e) = sink.record_result(&job, &result).await {
                warn!(job_id = %job.id, error = %e, "failed to persist result");
            }
        }
    }
}
