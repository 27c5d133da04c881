mod cmd;
mod config;
mod error;
mod lock;
mod paths;
mod sink;
mod spool;
mod status;

use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "runner", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one script in a sandbox and print its result as JSON
    Run(Box<cmd::RunArgs>),
    /// Execute requests dropped into the spool directory until signalled
    Serve(cmd::ServeArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout carries `run` results.
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if nix::unistd::getuid().is_root() {
        tracing::warn!("running as root: sandboxed scripts start with root privileges");
    }

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run(args) => cmd::run_script(*args).await,
        Command::Serve(args) => cmd::run_serve(args).await.map(|()| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
