use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ResourceStats, SandboxLogs, WaitOutcome};

/// Handle to one isolated instance created by a [`SandboxFactory`].
///
/// The `Any` bound allows `SandboxFactory::destroy()` to downcast
/// `Box<dyn Sandbox>` back to the concrete type for backend-specific cleanup.
///
/// [`SandboxFactory`]: crate::SandboxFactory
#[async_trait]
pub trait Sandbox: Send + Sync + Any {
    // -- identity --
    fn id(&self) -> &str;

    // -- lifecycle --
    async fn start(&mut self) -> Result<()>;
    /// Block until the payload exits or `timeout` elapses, whichever is first.
    ///
    /// On [`WaitOutcome::DeadlineExceeded`] the instance keeps running; the
    /// caller is expected to force it down with [`Sandbox::stop`].
    async fn wait(&mut self, timeout: Duration) -> Result<WaitOutcome>;
    /// Force-stop the payload, escalating to a kill once `grace` has elapsed.
    async fn stop(&mut self, grace: Duration) -> Result<()>;

    // -- observation --
    /// Output accumulated so far. Valid after a deadline or stop as well.
    async fn logs(&self) -> Result<SandboxLogs>;
    async fn stats(&self) -> Result<ResourceStats>;
}
