use crate::model::{ExecutionStatus, QuotaType};
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid environment: {0}")]
    InvalidEnvironment(String),

    #[error("{quota_type} quota exceeded")]
    QuotaExceeded { quota_type: QuotaType },

    #[error("sandbox launch failed: {0}")]
    SandboxLaunch(String),

    #[error("execution timed out after {0}s")]
    ExecutionTimeout(u64),

    #[error("memory limit of {0} MB exceeded")]
    MemoryLimitExceeded(u32),

    #[error("security violation: {0}")]
    SecurityViolation(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("config error: {0}")]
    Config(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] sandbox::SandboxError),
}

impl EngineError {
    /// Terminal status a run-time error is recorded as. Admission errors
    /// (`InvalidEnvironment`, `QuotaExceeded`) never reach a record and
    /// map to `None`.
    pub fn execution_status(&self) -> Option<ExecutionStatus> {
        match self {
            Self::InvalidEnvironment(_) | Self::QuotaExceeded { .. } | Self::Config(_) => None,
            Self::ExecutionTimeout(_) => Some(ExecutionStatus::Timeout),
            Self::MemoryLimitExceeded(_) => Some(ExecutionStatus::MemoryLimit),
            Self::SecurityViolation(_) => Some(ExecutionStatus::SecurityViolation),
            Self::SandboxLaunch(_) | Self::Internal(_) | Self::Store(_) | Self::Sandbox(_) => {
                Some(ExecutionStatus::Failed)
            }
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
