use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Args;
use engine::{JobRequest, NullSink, Outcome, OutputFormat, ProfileOverrides};
use tracing::info;

use super::Host;
use crate::config::{self, RunnerConfig};
use crate::error::{RunnerError, RunnerResult};

#[derive(Args)]
pub struct RunArgs {
    /// Script to execute
    #[arg(long, short)]
    script: PathBuf,
    /// Output format the script produces (json, csv, xml)
    #[arg(long, short, default_value = "json")]
    format: OutputFormat,
    /// Tenant whose profile applies
    #[arg(long, default_value = "default")]
    tenant: String,
    /// Target URL exported to the script as TARGET_URL
    #[arg(long)]
    url: Option<String>,
    /// Wall-clock limit, at most the tenant's ceiling
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Memory limit, at most the tenant's ceiling
    #[arg(long)]
    memory_mb: Option<u32>,
    /// Path to runner.yaml; built-in defaults and a temporary base_dir otherwise
    #[arg(long, short, env = "SCRIPT_RUNNER_CONFIG")]
    config: Option<PathBuf>,
}

/// Run one script to completion and print its status as JSON.
///
/// Exit status: 0 for success, 2 for partial output, 1 for everything else.
pub async fn run_script(args: RunArgs) -> RunnerResult<ExitCode> {
    let script = tokio::fs::read_to_string(&args.script)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", args.script.display())))?;

    // Keeps the temporary base_dir alive until the run is over.
    let mut scratch = None;
    let runner_config = match &args.config {
        Some(path) => config::load(path).await?,
        None => {
            let dir = tempfile::Builder::new().prefix("script-runner-").tempdir()?;
            let config = RunnerConfig::with_base_dir(dir.path().to_path_buf());
            scratch = Some(dir);
            config
        }
    };

    let host = Host::start(&runner_config, Arc::new(NullSink)).await?;
    let mut request = JobRequest::new(args.tenant, script, args.format).with_overrides(
        ProfileOverrides {
            timeout_secs: args.timeout_secs,
            memory_mb: args.memory_mb,
            ..Default::default()
        },
    );
    if let Some(url) = args.url {
        request = request.with_target_url(url);
    }

    let submitted = host.engine.submit(request);
    let id = match submitted {
        Ok(id) => id,
        Err(e) => {
            host.engine.shutdown().await;
            host.stop().await;
            return Err(e.into());
        }
    };
    info!(job_id = %id, script = %args.script.display(), "running script");

    host.engine.wait(id).await;
    let status = host.engine.status(id);
    host.engine.shutdown().await;
    host.stop().await;
    drop(scratch);

    let status =
        status.ok_or_else(|| RunnerError::Internal(format!("job {id} vanished before reporting")))?;
    let json = serde_json::to_string_pretty(&status)
        .map_err(|e| RunnerError::Internal(format!("serialize status: {e}")))?;
    println!("{json}");

    let code = match status.result.as_ref().map(|r| r.outcome()) {
        Some(Outcome::Success) => 0,
        Some(Outcome::PartialOutput) => 2,
        _ => 1,
    };
    Ok(ExitCode::from(code))
}
