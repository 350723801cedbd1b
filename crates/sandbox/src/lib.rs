mod config;
mod error;
mod factory;
mod sandbox;
mod types;

#[cfg(feature = "fake")]
pub mod fake;

pub use config::{IsolationPolicy, NetworkMode, ResourceLimits, SandboxFile, SandboxSpec};
pub use error::{Result, SandboxError};
pub use factory::SandboxFactory;
pub use sandbox::Sandbox;
pub use types::{ProcessExit, ResourceStats, SandboxLogs, WaitOutcome};
