mod capture;
mod config;
mod factory;
mod limits;
mod paths;
mod prerequisites;
mod process;
mod sandbox;

pub use config::{
    DEFAULT_READ_ONLY_PATHS, FilesystemPolicy, NetworkPolicy, ProcessContainment,
    ProcessFactoryConfig,
};
pub use factory::ProcessFactory;
pub use paths::{FactoryPaths, SandboxPaths};
pub use sandbox::ProcessSandbox;
