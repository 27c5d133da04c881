use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use engine::JobId;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::Host;
use crate::config;
use crate::error::{RunnerError, RunnerResult};
use crate::lock;
use crate::paths::RunnerPaths;
use crate::sink::JsonlSink;
use crate::spool::Spool;
use crate::status::{RunnerMode, StatusTracker};

#[derive(Args)]
pub struct ServeArgs {
    /// Path to runner.yaml config file
    #[arg(long, short, env = "SCRIPT_RUNNER_CONFIG")]
    config: PathBuf,
}

/// Serve the spool directory until a signal stops or drains the runner.
pub async fn run_serve(args: ServeArgs) -> RunnerResult<()> {
    let runner_config = config::load(&args.config).await?;
    let paths = RunnerPaths::new(runner_config.base_dir.clone());
    tokio::fs::create_dir_all(paths.base_dir())
        .await
        .map_err(|e| {
            RunnerError::Config(format!(
                "create base_dir {}: {e}",
                paths.base_dir().display()
            ))
        })?;
    let _lock = lock::acquire(paths.lock()).await?;

    let sink = JsonlSink::open(paths.outputs()).await?;
    let spool = Spool::open(&paths.spool()).await?;
    let host = Host::start(&runner_config, Arc::new(sink)).await?;
    let status = Arc::new(StatusTracker::new(paths.status()));
    status.write_initial().await;

    info!(
        base_dir = %paths.base_dir().display(),
        pool_size = runner_config.engine.pool_size,
        spool = %spool.incoming().display(),
        "runner started, watching spool"
    );

    let mode_rx = spawn_signal_handler();
    let poll_interval = runner_config.spool.poll_interval();
    serve(&host, &spool, &status, mode_rx, poll_interval).await;

    host.stop().await;
    status.set_mode(RunnerMode::Stopped).await;
    info!("runner stopped");
    Ok(())
}

fn spawn_signal_handler() -> watch::Receiver<RunnerMode> {
    let (mode_tx, mode_rx) = watch::channel(RunnerMode::Running);

    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();
        let mut sigusr1 = signal(SignalKind::user_defined1()).ok();

        loop {
            tokio::select! {
                _ = recv_signal(&mut sigterm) => {
                    info!("received SIGTERM, stopping");
                    let _ = mode_tx.send(RunnerMode::Stopping);
                    return;
                }
                _ = recv_signal(&mut sigint) => {
                    info!("received SIGINT, stopping");
                    let _ = mode_tx.send(RunnerMode::Stopping);
                    return;
                }
                _ = recv_signal(&mut sigusr1) => {
                    info!("received SIGUSR1, draining (no new jobs)");
                    let _ = mode_tx.send(RunnerMode::Draining);
                }
            }
        }
    });

    mode_rx
}

async fn serve(
    host: &Host,
    spool: &Spool,
    status: &Arc<StatusTracker>,
    mut mode_rx: watch::Receiver<RunnerMode>,
    poll_interval: std::time::Duration,
) {
    let mut watchers: JoinSet<()> = JoinSet::new();

    // -----------------------------------------------------------------------
    // Intake loop
    // -----------------------------------------------------------------------
    let mut mode = RunnerMode::Running;
    while mode == RunnerMode::Running {
        match spool.ingest(&host.engine).await {
            Ok(report) => {
                for id in report.accepted {
                    status.add_job(id).await;
                    watch_job(&mut watchers, host, status, id);
                }
            }
            Err(e) => error!(error = %e, "spool scan failed"),
        }

        tokio::select! {
            () = tokio::time::sleep(poll_interval) => {}
            next = next_mode(&mut mode_rx) => mode = next,
            Some(result) = watchers.join_next() => {
                if let Err(e) = result {
                    error!(error = %e, "job watcher panicked");
                }
            }
        }
    }
    status.set_mode(mode).await;

    // -----------------------------------------------------------------------
    // Drain or stop
    // -----------------------------------------------------------------------
    if mode == RunnerMode::Draining {
        let engine = host.engine.clone();
        let mut drain = tokio::spawn(async move { engine.drain().await });
        loop {
            tokio::select! {
                result = &mut drain => {
                    if let Err(e) = result {
                        error!(error = %e, "drain task panicked");
                    }
                    info!("all jobs drained");
                    break;
                }
                next = next_mode(&mut mode_rx) => {
                    if next == RunnerMode::Stopping {
                        status.set_mode(RunnerMode::Stopping).await;
                        host.engine.shutdown().await;
                    }
                }
            }
        }
    } else {
        host.engine.shutdown().await;
    }

    while let Some(result) = watchers.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "job watcher panicked");
        }
    }
}

/// Mark the job finished in the status file once it is terminal.
fn watch_job(watchers: &mut JoinSet<()>, host: &Host, status: &Arc<StatusTracker>, id: JobId) {
    let engine = host.engine.clone();
    let status = Arc::clone(status);
    watchers.spawn(async move {
        engine.wait(id).await;
        status.finish_job(id).await;
    });
}

/// Next mode change; pends forever once the signal handler is gone.
async fn next_mode(rx: &mut watch::Receiver<RunnerMode>) -> RunnerMode {
    match rx.changed().await {
        Ok(()) => *rx.borrow_and_update(),
        Err(_) => std::future::pending().await,
    }
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
