use async_trait::async_trait;

use crate::config::SandboxSpec;
use crate::error::Result;
use crate::sandbox::Sandbox;

#[async_trait]
pub trait SandboxFactory: Send + Sync {
    /// Human-readable name for this factory implementation (e.g. "docker").
    fn name(&self) -> &str;
    /// Initialize factory resources (connections, work directories, etc.).
    /// Must be called before `create()` or `destroy()`.
    async fn startup(&mut self) -> Result<()>;
    /// Materialize a new, not yet started, sandbox from `spec`.
    async fn create(&self, spec: SandboxSpec) -> Result<Box<dyn Sandbox>>;
    /// Remove a sandbox and every host resource allocated for it.
    ///
    /// Implementations must release their bookkeeping for the sandbox even
    /// when the runtime reports an error, so the error is informational.
    async fn destroy(&self, sandbox: Box<dyn Sandbox>) -> Result<()>;
    /// Number of sandboxes created and not yet destroyed.
    fn active(&self) -> usize;
    /// Release all factory-level resources, removing leftover sandboxes.
    /// Requires exclusive ownership: callers sharing via `Arc` must first
    /// recover it (e.g. `Arc::try_unwrap`) after all concurrent users have
    /// been dropped.
    async fn shutdown(&mut self);
}
