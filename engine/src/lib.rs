//! Tenant-aware execution engine for untrusted scraping scripts.
//!
//! Jobs are admitted by [`Engine::submit`], wait in a per-tenant fair queue,
//! and run one sandbox each under a supervisor that enforces the wall-clock
//! ceiling and turns the script's output into a typed [`ExecutionResult`].
//! The sandbox backend is pluggable through [`sandbox::SandboxFactory`].

pub mod collector;
pub mod config;
mod dispatcher;
pub mod error;
pub mod events;
pub mod job;
pub mod profile;
mod queue;
mod registry;
mod serde_util;
pub mod sink;
mod supervisor;

#[cfg(test)]
mod testing;

pub use collector::{CollectionError, StructuredOutput};
pub use config::EngineConfig;
pub use dispatcher::{Engine, EngineMode, EngineStats};
pub use error::{SubmitError, SubmitResult};
pub use events::LifecycleEvent;
pub use job::{
    ExecutionResult, FailureKind, JobId, JobRecord, JobRequest, JobState, JobStatus, Outcome,
    OutputFormat, PartialReason, TenantId,
};
pub use profile::{
    ProfileOverrides, ProfileResolver, ProfilesConfig, ResourceProfile, StaticProfiles,
    TenantPolicy,
};
pub use sink::{NullSink, PersistenceSink, SinkError};
