mod run;
mod serve;

use std::sync::Arc;

use engine::{Engine, PersistenceSink, StaticProfiles};
use sandbox::SandboxFactory;
use sandbox_proc::ProcessFactory;
use tracing::{info, warn};

use crate::config::RunnerConfig;
use crate::error::{RunnerError, RunnerResult};
use crate::paths::RunnerPaths;

pub use run::{RunArgs, run_script};
pub use serve::{ServeArgs, run_serve};

/// A started backend plus the engine driving it.
struct Host {
    engine: Engine,
    factory: Arc<ProcessFactory>,
}

impl Host {
    async fn start(config: &RunnerConfig, sink: Arc<dyn PersistenceSink>) -> RunnerResult<Self> {
        let paths = RunnerPaths::new(config.base_dir.clone());
        let mut factory = ProcessFactory::new(config.factory_config(paths.sandboxes()));
        factory.startup().await?;
        let factory = Arc::new(factory);

        let engine = Engine::start(
            config.engine.clone(),
            factory.clone(),
            Arc::new(StaticProfiles::from_config(&config.profiles)),
            sink,
        )
        .map_err(RunnerError::Config)?;
        Ok(Self { engine, factory })
    }

    /// Shut the backend down once the engine has stopped.
    async fn stop(self) {
        let Self { engine, factory } = self;
        drop(engine);
        match Arc::try_unwrap(factory) {
            Ok(mut factory) => factory.shutdown().await,
            // A late sandbox creation still holds the factory; its workspace
            // is removed by the next startup.
            Err(_) => warn!("sandbox backend still referenced, skipping shutdown"),
        }
        info!("sandbox backend stopped");
    }
}
