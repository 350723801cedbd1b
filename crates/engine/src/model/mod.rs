mod environment;
mod execution;
mod quota;
mod test_case;

pub use environment::{
    EnvironmentFeatures, EnvironmentId, EnvironmentStatus, ExecutionEnvironment, SecurityRules,
};
pub use execution::{CodeExecution, ExecutionKind, ExecutionRequest, ExecutionStatus};
pub use quota::{ExecutionQuota, QuotaLimits, QuotaType};
pub use test_case::{Difficulty, TestCase, TestResult, TestStatus, TestType};
