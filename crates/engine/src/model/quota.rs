use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaType {
    Daily,
    Monthly,
    Total,
}

impl QuotaType {
    pub const ALL: [QuotaType; 3] = [QuotaType::Daily, QuotaType::Monthly, QuotaType::Total];

    /// Reset period. Total quotas have none and never auto-reset.
    pub fn period(self) -> Option<Duration> {
        match self {
            Self::Daily => Some(Duration::days(1)),
            Self::Monthly => Some(Duration::days(30)),
            Self::Total => None,
        }
    }
}

impl fmt::Display for QuotaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
            Self::Total => "total",
        })
    }
}

/// Ceilings for one quota period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub max_executions: u32,
    /// Cumulative seconds.
    pub max_execution_time: u64,
    /// Cumulative MB.
    pub max_memory_usage: u64,
}

/// Per-user, per-type ceiling and usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionQuota {
    pub id: Uuid,
    pub user_id: String,
    pub quota_type: QuotaType,
    pub max_executions: u32,
    pub max_execution_time: u64,
    pub max_memory_usage: u64,
    pub executions_used: u32,
    /// Seconds.
    pub execution_time_used: f64,
    /// MB.
    pub memory_usage_used: u64,
    pub last_reset: DateTime<Utc>,
    pub next_reset: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_exceeded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionQuota {
    pub fn new(
        user_id: impl Into<String>,
        quota_type: QuotaType,
        limits: QuotaLimits,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            quota_type,
            max_executions: limits.max_executions,
            max_execution_time: limits.max_execution_time,
            max_memory_usage: limits.max_memory_usage,
            executions_used: 0,
            execution_time_used: 0.0,
            memory_usage_used: 0,
            last_reset: now,
            next_reset: quota_type.period().map(|p| now + p),
            is_active: true,
            is_exceeded: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_reset.is_some_and(|at| now >= at)
    }

    /// Whether `executions` more runs fit. Time and memory only need to be
    /// not yet exhausted; they are charged after the run.
    pub fn admits(&self, executions: u32) -> bool {
        let count_ok = self
            .executions_used
            .checked_add(executions)
            .is_some_and(|n| n <= self.max_executions);
        count_ok
            && self.execution_time_used < self.max_execution_time as f64
            && self.memory_usage_used < self.max_memory_usage
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.executions_used = 0;
        self.execution_time_used = 0.0;
        self.memory_usage_used = 0;
        self.is_exceeded = false;
        self.last_reset = now;
        self.next_reset = self.quota_type.period().map(|p| now + p);
        self.updated_at = now;
    }
}
