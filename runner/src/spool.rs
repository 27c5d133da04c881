//! Directory-based intake: request files dropped into `incoming/` are
//! submitted to the engine and moved to `accepted/` or `rejected/`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use engine::{Engine, JobId, JobRequest, OutputFormat, ProfileOverrides, SubmitError, TenantId};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::RunnerResult;

/// Wire shape of one request file.
#[derive(Debug, Deserialize)]
pub struct SpoolRequest {
    #[serde(default)]
    pub execution_id: Option<JobId>,
    pub tenant: String,
    pub script_content: String,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub overrides: ProfileOverrides,
}

impl From<SpoolRequest> for JobRequest {
    fn from(req: SpoolRequest) -> Self {
        JobRequest {
            id: req.execution_id,
            tenant: TenantId::new(req.tenant),
            script: req.script_content,
            format: req.output_format,
            target_url: req.url,
            overrides: req.overrides,
        }
    }
}

/// What one pass over `incoming/` did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct IntakeReport {
    pub accepted: Vec<JobId>,
    pub rejected: usize,
    /// Left in place for a later pass (backpressure or tenant quota).
    pub deferred: usize,
}

pub struct Spool {
    incoming: PathBuf,
    accepted: PathBuf,
    rejected: PathBuf,
    /// Submitted requests whose move to `accepted/` failed. They are only
    /// archived again, never resubmitted.
    stranded: Mutex<HashSet<PathBuf>>,
}

impl Spool {
    pub async fn open(root: &Path) -> RunnerResult<Self> {
        let spool = Self {
            incoming: root.join("incoming"),
            accepted: root.join("accepted"),
            rejected: root.join("rejected"),
            stranded: Mutex::new(HashSet::new()),
        };
        for dir in [&spool.incoming, &spool.accepted, &spool.rejected] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(spool)
    }

    pub fn incoming(&self) -> &Path {
        &self.incoming
    }

    /// Pending request files, oldest name first.
    async fn pending(&self) -> RunnerResult<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.incoming).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_json = path.extension().is_some_and(|ext| ext == "json");
            if is_json && entry.file_type().await?.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Submit every pending request the engine will take right now.
    pub async fn ingest(&self, engine: &Engine) -> RunnerResult<IntakeReport> {
        let mut report = IntakeReport::default();

        for path in self.pending().await? {
            if self.stranded.lock().await.contains(&path) {
                if self.archive(&path, &self.accepted).await.is_ok() {
                    self.stranded.lock().await.remove(&path);
                }
                continue;
            }

            let request = match read_request(&path).await {
                Ok(request) => request,
                Err(reason) => {
                    self.reject(&path, &reason).await?;
                    report.rejected += 1;
                    continue;
                }
            };

            match engine.submit(request) {
                Ok(id) => {
                    info!(job_id = %id, file = %path.display(), "request accepted");
                    report.accepted.push(id);
                    if let Err(e) = self.archive(&path, &self.accepted).await {
                        warn!(
                            job_id = %id,
                            file = %path.display(),
                            error = %e,
                            "accepted request not archived"
                        );
                        self.stranded.lock().await.insert(path);
                    }
                }
                Err(SubmitError::Backpressure { .. } | SubmitError::ShuttingDown) => {
                    report.deferred += 1;
                    // Nothing later in this pass can be admitted either.
                    break;
                }
                Err(e @ SubmitError::QuotaExceeded { .. }) => {
                    info!(file = %path.display(), reason = %e, "request deferred");
                    report.deferred += 1;
                }
                Err(e) => {
                    self.reject(&path, &e.to_string()).await?;
                    report.rejected += 1;
                }
            }
        }
        Ok(report)
    }

    async fn archive(&self, path: &Path, dir: &Path) -> RunnerResult<PathBuf> {
        let name = path.file_name().unwrap_or_default();
        let target = dir.join(name);
        tokio::fs::rename(path, &target).await?;
        Ok(target)
    }

    /// Move to `rejected/` with a sibling `.error` note.
    async fn reject(&self, path: &Path, reason: &str) -> RunnerResult<()> {
        warn!(file = %path.display(), reason, "request rejected");
        let target = self.archive(path, &self.rejected).await?;
        tokio::fs::write(target.with_extension("error"), format!("{reason}\n")).await?;
        Ok(())
    }
}

async fn read_request(path: &Path) -> Result<JobRequest, String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| format!("read {}: {e}", path.display()))?;
    let request: SpoolRequest =
        serde_json::from_slice(&bytes).map_err(|e| format!("invalid request: {e}"))?;
    Ok(request.into())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use engine::{EngineConfig, NullSink, Outcome, StaticProfiles, TenantPolicy};
    use sandbox::SandboxFactory;
    use sandbox_proc::{FilesystemPolicy, ProcessFactory, ProcessFactoryConfig};

    use super::*;

    async fn start_engine(base: &Path, config: EngineConfig, policy: TenantPolicy) -> Engine {
        let mut factory_config = ProcessFactoryConfig::new(base.join("sandboxes"));
        factory_config.interpreter = vec!["/bin/sh".into()];
        factory_config.filesystem = FilesystemPolicy::Unrestricted;
        let mut factory = ProcessFactory::new(factory_config);
        factory.startup().await.unwrap();
        Engine::start(
            config,
            Arc::new(factory),
            Arc::new(StaticProfiles::new(policy)),
            Arc::new(NullSink),
        )
        .unwrap()
    }

    async fn drop_request(spool: &Spool, name: &str, body: &str) {
        tokio::fs::write(spool.incoming().join(name), body).await.unwrap();
    }

    #[test]
    fn parses_request_shape() {
        let req: SpoolRequest = serde_json::from_str(
            r#"{
                "execution_id": "7d0c3f52-3c1e-4a8e-9a59-0f0e7d7b6a11",
                "tenant": "acme",
                "script_content": "print('[]')",
                "output_format": "tabular",
                "url": "https://example.com",
                "overrides": {"timeout_secs": 30}
            }"#,
        )
        .unwrap();
        let job: JobRequest = req.into();
        assert_eq!(job.format, OutputFormat::Csv);
        assert_eq!(job.overrides.timeout_secs, Some(30));
        assert_eq!(
            job.id.unwrap().to_string(),
            "7d0c3f52-3c1e-4a8e-9a59-0f0e7d7b6a11"
        );
    }

    #[tokio::test]
    async fn accepted_and_rejected_files_are_moved() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::open(&dir.path().join("spool")).await.unwrap();
        let engine = start_engine(dir.path(), EngineConfig::default(), TenantPolicy::default()).await;

        drop_request(
            &spool,
            "a.json",
            r#"{"tenant": "acme", "script_content": "echo '[]'", "output_format": "json"}"#,
        )
        .await;
        drop_request(&spool, "b.json", "{ not json").await;
        drop_request(
            &spool,
            "c.json",
            r#"{"tenant": "acme", "script_content": "echo hi", "url": "ftp://example.com"}"#,
        )
        .await;
        drop_request(&spool, "notes.txt", "ignored").await;

        let report = spool.ingest(&engine).await.unwrap();
        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.rejected, 2);

        let root = dir.path().join("spool");
        assert!(root.join("accepted/a.json").exists());
        assert!(root.join("rejected/b.json").exists());
        let note = std::fs::read_to_string(root.join("rejected/c.error")).unwrap();
        assert!(note.contains("scheme"), "got: {note}");
        assert!(root.join("incoming/notes.txt").exists());

        let result = engine.wait(report.accepted[0]).await.unwrap();
        assert_eq!(result.outcome(), Outcome::Success);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn quota_leaves_requests_for_the_next_pass() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::open(&dir.path().join("spool")).await.unwrap();
        let policy = TenantPolicy {
            max_active_jobs: 1,
            ..Default::default()
        };
        let engine = start_engine(dir.path(), EngineConfig::default(), policy).await;

        for name in ["1.json", "2.json"] {
            drop_request(
                &spool,
                name,
                r#"{"tenant": "acme", "script_content": "sleep 1; echo '[]'"}"#,
            )
            .await;
        }

        let first = spool.ingest(&engine).await.unwrap();
        assert_eq!(first.accepted.len(), 1);
        assert_eq!(first.deferred, 1);
        assert!(spool.incoming().join("2.json").exists());

        engine.wait(first.accepted[0]).await.unwrap();
        let second = spool.ingest(&engine).await.unwrap();
        assert_eq!(second.accepted.len(), 1);
        assert_eq!(second.deferred, 0);

        tokio::time::timeout(Duration::from_secs(20), engine.wait(second.accepted[0]))
            .await
            .unwrap();
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn submitted_request_is_not_resubmitted_when_archiving_fails() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("spool");
        let spool = Spool::open(&root).await.unwrap();
        let engine = start_engine(dir.path(), EngineConfig::default(), TenantPolicy::default()).await;

        // A plain file where the directory should be makes every move fail.
        std::fs::remove_dir(root.join("accepted")).unwrap();
        std::fs::write(root.join("accepted"), b"").unwrap();
        drop_request(
            &spool,
            "a.json",
            r#"{"tenant": "acme", "script_content": "echo '[]'"}"#,
        )
        .await;

        let first = spool.ingest(&engine).await.unwrap();
        assert_eq!(first.accepted.len(), 1);
        assert!(spool.incoming().join("a.json").exists());

        let second = spool.ingest(&engine).await.unwrap();
        assert_eq!(second, IntakeReport::default());
        assert!(spool.incoming().join("a.json").exists());

        std::fs::remove_file(root.join("accepted")).unwrap();
        std::fs::create_dir(root.join("accepted")).unwrap();
        let third = spool.ingest(&engine).await.unwrap();
        assert_eq!(third, IntakeReport::default());
        assert!(root.join("accepted/a.json").exists());
        assert!(!spool.incoming().join("a.json").exists());

        let result = engine.wait(first.accepted[0]).await.unwrap();
        assert_eq!(result.outcome(), Outcome::Success);
        engine.shutdown().await;
    }
}
