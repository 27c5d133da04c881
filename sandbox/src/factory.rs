use async_trait::async_trait;

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::sandbox::Sandbox;

#[async_trait]
pub trait SandboxFactory: Send + Sync {
    /// Human-readable name for this factory implementation (e.g. "process").
    fn name(&self) -> &str;
    /// Initialize factory resources (directories, prerequisite checks).
    /// Must be called before `create()` or `destroy()`.
    async fn startup(&mut self) -> Result<()>;
    /// Allocate an isolated environment holding the script. The returned
    /// sandbox is not running until `Sandbox::start()` is called.
    ///
    /// On error nothing is left behind: partially allocated resources are
    /// released before returning.
    async fn create(&self, config: SandboxConfig) -> Result<Box<dyn Sandbox>>;
    /// Tear down a sandbox in any state (never started, running, exited),
    /// killing whatever still runs and deleting its workspace.
    async fn destroy(&self, sandbox: Box<dyn Sandbox>);
    /// Release all factory-level resources.
    /// Takes `&mut self`: callers sharing the factory through an `Arc`
    /// recover ownership with `Arc::try_unwrap` once every user is gone.
    async fn shutdown(&mut self);
}
