//! Persistence boundary for engine records.
//!
//! The engine only needs create / update / get / filter-by-owner; any
//! durable backend implements [`ResultStore`]. [`MemoryStore`] is the
//! in-process implementation used by the runner and by tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{CodeExecution, ExecutionQuota, QuotaType, TestCase, TestResult};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("execution {0} is terminal and can no longer change")]
    Immutable(Uuid),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn create_execution(&self, execution: &CodeExecution) -> StoreResult<()>;

    /// Replace a stored execution. Rejected once the stored copy is terminal.
    async fn update_execution(&self, execution: &CodeExecution) -> StoreResult<()>;

    async fn get_execution(&self, id: Uuid) -> StoreResult<CodeExecution>;

    /// Newest first.
    async fn executions_for_user(&self, user_id: &str) -> StoreResult<Vec<CodeExecution>>;

    async fn create_test_case(&self, test_case: &TestCase) -> StoreResult<()>;

    async fn test_cases_for_exercise(&self, exercise_id: Uuid) -> StoreResult<Vec<TestCase>>;

    /// At most one result per (execution, test case).
    async fn create_test_result(&self, result: &TestResult) -> StoreResult<()>;

    async fn test_results_for_execution(&self, execution_id: Uuid) -> StoreResult<Vec<TestResult>>;

    async fn load_quotas(&self, user_id: &str) -> StoreResult<Vec<ExecutionQuota>>;

    /// Insert or replace by (user, quota type).
    async fn save_quota(&self, quota: &ExecutionQuota) -> StoreResult<()>;

    /// Active quotas whose `next_reset` is at or before `now`.
    async fn quotas_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<ExecutionQuota>>;
}

#[derive(Default)]
struct Tables {
    executions: HashMap<Uuid, CodeExecution>,
    test_cases: HashMap<Uuid, TestCase>,
    test_results: HashMap<(Uuid, Uuid), TestResult>,
    quotas: HashMap<(String, QuotaType), ExecutionQuota>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn create_execution(&self, execution: &CodeExecution) -> StoreResult<()> {
        let mut tables = self.tables();
        if tables.executions.contains_key(&execution.id) {
            return Err(StoreError::Duplicate(format!("execution {}", execution.id)));
        }
        tables.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_execution(&self, execution: &CodeExecution) -> StoreResult<()> {
        let mut tables = self.tables();
        let stored = tables
            .executions
            .get_mut(&execution.id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {}", execution.id)))?;
        if stored.is_terminal() {
            return Err(StoreError::Immutable(execution.id));
        }
        *stored = execution.clone();
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<CodeExecution> {
        self.tables()
            .executions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))
    }

    async fn executions_for_user(&self, user_id: &str) -> StoreResult<Vec<CodeExecution>> {
        let mut found: Vec<CodeExecution> = self
            .tables()
            .executions
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn create_test_case(&self, test_case: &TestCase) -> StoreResult<()> {
        let mut tables = self.tables();
        if tables.test_cases.contains_key(&test_case.id) {
            return Err(StoreError::Duplicate(format!("test case {}", test_case.id)));
        }
        tables.test_cases.insert(test_case.id, test_case.clone());
        Ok(())
    }

    async fn test_cases_for_exercise(&self, exercise_id: Uuid) -> StoreResult<Vec<TestCase>> {
        Ok(self
            .tables()
            .test_cases
            .values()
            .filter(|tc| tc.exercise_id == exercise_id)
            .cloned()
            .collect())
    }

    async fn create_test_result(&self, result: &TestResult) -> StoreResult<()> {
        let mut tables = self.tables();
        let key = (result.execution_id, result.test_case_id);
        if tables.test_results.contains_key(&key) {
            return Err(StoreError::Duplicate(format!(
                "test result for execution {} / test case {}",
                result.execution_id, result.test_case_id
            )));
        }
        tables.test_results.insert(key, result.clone());
        Ok(())
    }

    async fn test_results_for_execution(&self, execution_id: Uuid) -> StoreResult<Vec<TestResult>> {
        let mut found: Vec<TestResult> = self
            .tables()
            .test_results
            .values()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn load_quotas(&self, user_id: &str) -> StoreResult<Vec<ExecutionQuota>> {
        Ok(self
            .tables()
            .quotas
            .values()
            .filter(|q| q.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn save_quota(&self, quota: &ExecutionQuota) -> StoreResult<()> {
        self.tables()
            .quotas
            .insert((quota.user_id.clone(), quota.quota_type), quota.clone());
        Ok(())
    }

    async fn quotas_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<ExecutionQuota>> {
        Ok(self
            .tables()
            .quotas
            .values()
            .filter(|q| q.is_active && q.is_due(now))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::model::{
        EnvironmentId, ExecutionRequest, ExecutionStatus, QuotaLimits, TestStatus,
    };

    fn execution(user: &str) -> CodeExecution {
        CodeExecution::queued(
            ExecutionRequest::new(user, EnvironmentId::new("python", "3.11"), "pass"),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn terminal_executions_are_frozen() {
        let store = MemoryStore::new();
        let mut exec = execution("u1");
        store.create_execution(&exec).await.unwrap();

        exec.transition(ExecutionStatus::Running).unwrap();
        store.update_execution(&exec).await.unwrap();
        exec.transition(ExecutionStatus::Completed).unwrap();
        store.update_execution(&exec).await.unwrap();

        exec.stdout = "tampered".into();
        let err = store.update_execution(&exec).await.unwrap_err();
        assert!(matches!(err, StoreError::Immutable(id) if id == exec.id));
        assert_eq!(store.get_execution(exec.id).await.unwrap().stdout, "");
    }

    #[tokio::test]
    async fn test_result_is_unique_per_pair() {
        let store = MemoryStore::new();
        let tc = TestCase::default();
        let exec_id = Uuid::new_v4();
        let first = TestResult::new(exec_id, &tc, TestStatus::Passed);
        store.create_test_result(&first).await.unwrap();

        let second = TestResult::new(exec_id, &tc, TestStatus::Failed);
        let err = store.create_test_result(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));

        let other = TestResult::new(Uuid::new_v4(), &tc, TestStatus::Failed);
        store.create_test_result(&other).await.unwrap();
        assert_eq!(store.test_results_for_execution(exec_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn executions_filter_by_owner() {
        let store = MemoryStore::new();
        store.create_execution(&execution("a")).await.unwrap();
        store.create_execution(&execution("b")).await.unwrap();
        store.create_execution(&execution("a")).await.unwrap();

        assert_eq!(store.executions_for_user("a").await.unwrap().len(), 2);
        assert!(store.executions_for_user("c").await.unwrap().is_empty());
        assert!(matches!(
            store.get_execution(Uuid::nil()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn due_quotas_exclude_total_and_inactive() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let limits = QuotaLimits {
            max_executions: 1,
            max_execution_time: 1,
            max_memory_usage: 1,
        };
        let daily = ExecutionQuota::new("u", QuotaType::Daily, limits, now);
        let total = ExecutionQuota::new("u", QuotaType::Total, limits, now);
        let mut inactive = ExecutionQuota::new("v", QuotaType::Daily, limits, now);
        inactive.is_active = false;
        for q in [&daily, &total, &inactive] {
            store.save_quota(q).await.unwrap();
        }

        let due = store.quotas_due(now + Duration::days(2)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, daily.id);
    }
}
