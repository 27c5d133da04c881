use std::any::Any;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::ResourceLimits;
use crate::error::Result;
use crate::types::{Artifact, WaitOutcome};

/// The `Any` bound allows `SandboxFactory::destroy()` to downcast
/// `Box<dyn Sandbox>` back to the concrete type for backend-specific cleanup.
#[async_trait]
pub trait Sandbox: Send + Sync + Any {
    // -- identity --
    fn id(&self) -> &str;
    /// OS identifier of the script process, once started.
    fn pid(&self) -> Option<u32>;
    fn limits(&self) -> &ResourceLimits;
    /// When the script was handed off, `None` before `start()`.
    fn started_at(&self) -> Option<Instant>;
    fn is_alive(&self) -> bool;

    // -- lifecycle --
    async fn start(&mut self) -> Result<()>;
    /// Suspend until the script exits or `deadline` passes, whichever is first.
    /// Dropping the returned future before completion leaves the sandbox intact.
    async fn wait_exit(&mut self, deadline: Instant) -> Result<WaitOutcome>;
    /// Forcefully stop everything running in the sandbox. Idempotent.
    async fn kill(&mut self) -> Result<()>;

    // -- operations --
    /// Read a file the script produced, at most `limit` bytes.
    async fn read_artifact(&self, name: &str, limit: u64) -> Result<Option<Artifact>>;
}
