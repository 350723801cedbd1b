use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::model::EnvironmentId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionKind {
    Exercise,
    #[default]
    Playground,
    Test,
    Debug,
    Demo,
}

/// `Queued -> Running -> {Completed, Failed, Timeout, MemoryLimit,
/// SecurityViolation, Cancelled}`. A queued run may also end `Cancelled`
/// or `Failed` without ever running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    MemoryLimit,
    SecurityViolation,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Queued => matches!(next, Self::Running | Self::Cancelled | Self::Failed),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::MemoryLimit => "memory_limit",
            Self::SecurityViolation => "security_violation",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound request from the surrounding product. Already authenticated
/// and validated by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub user_id: String,
    pub environment: EnvironmentId,
    pub source_code: String,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub kind: ExecutionKind,
    #[serde(default)]
    pub exercise_id: Option<Uuid>,
    #[serde(default)]
    pub test_case_id: Option<Uuid>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(
        user_id: impl Into<String>,
        environment: EnvironmentId,
        source_code: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            environment,
            source_code: source_code.into(),
            stdin: None,
            args: Vec::new(),
            kind: ExecutionKind::default(),
            exercise_id: None,
            test_case_id: None,
            session_id: None,
        }
    }
}

/// One submission-to-sandbox run. Written only by the orchestrator and
/// frozen once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeExecution {
    pub id: Uuid,
    pub user_id: String,
    pub environment: EnvironmentId,
    pub kind: ExecutionKind,
    pub status: ExecutionStatus,
    pub source_code: String,
    pub stdin: Option<String>,
    pub args: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Wall time in seconds.
    pub execution_time: Option<f64>,
    /// Peak memory in MB.
    pub memory_used: Option<u32>,
    /// CPU seconds.
    pub cpu_time: Option<f64>,
    pub sandbox_id: Option<String>,
    pub worker_node: Option<String>,
    pub exercise_id: Option<Uuid>,
    pub test_case_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub security_violations: Vec<String>,
    pub blocked_operations: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CodeExecution {
    /// Accept a request as a new queued record.
    pub fn queued(request: ExecutionRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            environment: request.environment,
            kind: request.kind,
            status: ExecutionStatus::Queued,
            source_code: request.source_code,
            stdin: request.stdin,
            args: request.args,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            execution_time: None,
            memory_used: None,
            cpu_time: None,
            sandbox_id: None,
            worker_node: None,
            exercise_id: request.exercise_id,
            test_case_id: request.test_case_id,
            session_id: request.session_id,
            security_violations: Vec::new(),
            blocked_operations: Vec::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn transition(&mut self, next: ExecutionStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::Internal(format!(
                "execution {}: illegal transition {} -> {next}",
                self.id, self.status
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_successful(&self) -> bool {
        self.status == ExecutionStatus::Completed && self.exit_code == Some(0)
    }
}
