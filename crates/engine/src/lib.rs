//! Execution engine: runs untrusted submissions in isolated sandboxes,
//! enforces per-user quotas and grades submissions against test cases.

pub mod config;
pub mod diff;
mod error;
pub mod launcher;
pub mod model;
pub mod orchestrator;
pub mod policy;
pub mod quota;
pub mod registry;
pub mod store;
pub mod test_runner;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use launcher::{SandboxLauncher, SandboxLease};
pub use orchestrator::{ExecutionOutcome, Orchestrator, OrchestratorConfig, RunOptions};
pub use policy::{ScanReport, SecurityPolicy};
pub use quota::{QuotaCharge, QuotaPolicy, QuotaTracker};
pub use registry::{EnvironmentEntry, EnvironmentRegistry};
pub use store::{MemoryStore, ResultStore, StoreError, StoreResult};
pub use test_runner::{GradeReport, TestRunner};
