use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use engine::JobId;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerMode {
    Running,
    /// No new intake; admitted jobs run to completion.
    Draining,
    /// No new intake; admitted jobs are being cancelled.
    Stopping,
    Stopped,
}

#[derive(Debug, Serialize)]
struct RunnerStatus {
    mode: RunnerMode,
    active_jobs: usize,
    active_job_ids: Vec<JobId>,
    completed_jobs: u64,
    #[serde(serialize_with = "serialize_iso")]
    started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_iso")]
    updated_at: DateTime<Utc>,
}

/// ISO 8601 with millisecond precision.
fn serialize_iso<S: serde::Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}

/// Status file writer shared by the intake loop and the job watchers.
///
/// Every change rewrites the whole file atomically.
pub struct StatusTracker {
    started_at: DateTime<Utc>,
    path: PathBuf,
    state: Mutex<MutableState>,
}

struct MutableState {
    mode: RunnerMode,
    active: BTreeSet<JobId>,
    completed: u64,
}

impl StatusTracker {
    pub fn new(path: PathBuf) -> Self {
        Self {
            started_at: Utc::now(),
            path,
            state: Mutex::new(MutableState {
                mode: RunnerMode::Running,
                active: BTreeSet::new(),
                completed: 0,
            }),
        }
    }

    pub async fn set_mode(&self, mode: RunnerMode) {
        let mut state = self.state.lock().await;
        state.mode = mode;
        self.write_status(&state).await;
    }

    pub async fn add_job(&self, id: JobId) {
        let mut state = self.state.lock().await;
        state.active.insert(id);
        self.write_status(&state).await;
    }

    pub async fn finish_job(&self, id: JobId) {
        let mut state = self.state.lock().await;
        if state.active.remove(&id) {
            state.completed += 1;
        }
        self.write_status(&state).await;
    }

    pub async fn write_initial(&self) {
        let state = self.state.lock().await;
        self.write_status(&state).await;
    }

    /// Write to a temp file in the same directory, then rename.
    async fn write_status(&self, state: &MutableState) {
        let status = RunnerStatus {
            mode: state.mode,
            active_jobs: state.active.len(),
            active_job_ids: state.active.iter().copied().collect(),
            completed_jobs: state.completed,
            started_at: self.started_at,
            updated_at: Utc::now(),
        };

        let json = match serde_json::to_string_pretty(&status) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize status");
                return;
            }
        };

        let tmp = self.path.with_extension("tmp");
        if let Err(e) = tokio::fs::write(&tmp, json.as_bytes()).await {
            warn!(error = %e, path = %tmp.display(), "failed to write status temp file");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            warn!(error = %e, "failed to rename status file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_status(path: &std::path::Path) -> serde_json::Value {
        let content = std::fs::read_to_string(path).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    #[tokio::test]
    async fn write_initial_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        tracker.write_initial().await;

        let status = read_status(&path);
        assert_eq!(status["mode"], "running");
        assert_eq!(status["active_jobs"], 0);
        assert_eq!(status["completed_jobs"], 0);
        assert!(status["active_job_ids"].as_array().unwrap().is_empty());
        assert!(!dir.path().join("status.tmp").exists());
    }

    #[tokio::test]
    async fn mode_changes_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        tracker.set_mode(RunnerMode::Draining).await;
        assert_eq!(read_status(&path)["mode"], "draining");
        tracker.set_mode(RunnerMode::Stopped).await;
        assert_eq!(read_status(&path)["mode"], "stopped");
    }

    #[tokio::test]
    async fn jobs_move_from_active_to_completed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        let first = JobId::new();
        let second = JobId::new();
        tracker.add_job(first).await;
        tracker.add_job(second).await;
        assert_eq!(read_status(&path)["active_jobs"], 2);

        tracker.finish_job(first).await;
        // Unknown ids do not count.
        tracker.finish_job(JobId::new()).await;

        let status = read_status(&path);
        assert_eq!(status["active_jobs"], 1);
        assert_eq!(status["completed_jobs"], 1);
        assert_eq!(status["active_job_ids"][0], second.to_string());
    }

    #[tokio::test]
    async fn timestamps_are_iso8601() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        tracker.write_initial().await;

        let started = read_status(&path)["started_at"].as_str().unwrap().to_string();
        assert!(started.ends_with('Z'));
        assert_eq!(started.len(), 24);
    }
}
