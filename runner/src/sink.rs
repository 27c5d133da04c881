use std::path::{Path, PathBuf};

use async_trait::async_trait;
use engine::{ExecutionResult, JobRecord, LifecycleEvent, PersistenceSink, SinkError};
use serde::Serialize;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const EVENTS_FILE: &str = "events.jsonl";

/// File-backed persistence under one output directory:
///
/// - `events.jsonl`: one lifecycle event per line, in emission order
/// - `<id>.result.json`: job metadata plus its terminal result
/// - `output_<id>.<ext>`: the rendered structured output of successful jobs
pub struct JsonlSink {
    dir: PathBuf,
    events: Mutex<File>,
}

#[derive(Serialize)]
struct ResultFile<'a> {
    job: &'a JobRecord,
    result: &'a ExecutionResult,
}

impl JsonlSink {
    pub async fn open(dir: PathBuf) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let events = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENTS_FILE))
            .await?;
        Ok(Self {
            dir,
            events: Mutex::new(events),
        })
    }

    pub fn result_path(&self, job: &JobRecord) -> PathBuf {
        self.dir.join(format!("{}.result.json", job.id))
    }

    pub fn output_path(&self, job: &JobRecord) -> PathBuf {
        self.dir
            .join(format!("output_{}.{}", job.id, job.format.extension()))
    }
}

#[async_trait]
impl PersistenceSink for JsonlSink {
    async fn record_event(&self, event: &LifecycleEvent) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = self.events.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn record_result(
        &self,
        job: &JobRecord,
        result: &ExecutionResult,
    ) -> Result<(), SinkError> {
        if let ExecutionResult::Success { output, .. } = result {
            write_atomic(&self.output_path(job), &output.render()?).await?;
        }
        let json = serde_json::to_vec_pretty(&ResultFile { job, result })?;
        write_atomic(&self.result_path(job), &json).await?;
        Ok(())
    }
}

/// Write to a temp file next to `path`, then rename over it.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}
