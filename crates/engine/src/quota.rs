//! Per-user execution quotas.
//!
//! Every user has an async mutex guarding their quota rows, held across
//! the read, the check, the store write and the in-memory commit. Two
//! concurrent submissions from the same user therefore serialize, and a
//! reservation is visible to the next one before it is admitted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::model::{ExecutionQuota, QuotaLimits, QuotaType};
use crate::store::ResultStore;

/// Limits seeded for users that have no stored quota of a type. A `None`
/// type is not enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaPolicy {
    pub daily: Option<QuotaLimits>,
    pub monthly: Option<QuotaLimits>,
    pub total: Option<QuotaLimits>,
}

impl QuotaPolicy {
    fn limits(&self, quota_type: QuotaType) -> Option<QuotaLimits> {
        match quota_type {
            QuotaType::Daily => self.daily,
            QuotaType::Monthly => self.monthly,
            QuotaType::Total => self.total,
        }
    }
}

/// What one admission costs. Time and memory are charged from measured
/// usage after the run instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCharge {
    pub executions: u32,
}

impl QuotaCharge {
    pub const SINGLE: QuotaCharge = QuotaCharge { executions: 1 };
}

#[derive(Default)]
struct UserQuotas {
    loaded: bool,
    quotas: Vec<ExecutionQuota>,
}

pub struct QuotaTracker {
    policy: QuotaPolicy,
    store: Arc<dyn ResultStore>,
    users: Mutex<HashMap<String, Arc<tokio::sync::Mutex<UserQuotas>>>>,
}

impl QuotaTracker {
    pub fn new(policy: QuotaPolicy, store: Arc<dyn ResultStore>) -> Self {
        Self {
            policy,
            store,
            users: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, user_id: &str) -> Arc<tokio::sync::Mutex<UserQuotas>> {
        let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(users.entry(user_id.to_string()).or_default())
    }

    /// Load stored rows once and seed missing types from the policy.
    async fn ensure_loaded(
        &self,
        user_id: &str,
        state: &mut UserQuotas,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        if state.loaded {
            return Ok(());
        }
        let mut quotas = self.store.load_quotas(user_id).await?;
        for quota_type in QuotaType::ALL {
            if quotas.iter().any(|q| q.quota_type == quota_type) {
                continue;
            }
            if let Some(limits) = self.policy.limits(quota_type) {
                let quota = ExecutionQuota::new(user_id, quota_type, limits, now);
                self.store.save_quota(&quota).await?;
                quotas.push(quota);
            }
        }
        state.quotas = quotas;
        state.loaded = true;
        Ok(())
    }

    /// Persist `updated` and only then make it the in-memory state, so a
    /// failed write leaves the previous state intact.
    async fn commit(&self, state: &mut UserQuotas, updated: Vec<ExecutionQuota>) -> EngineResult<()> {
        for (old, new) in state.quotas.iter().zip(&updated) {
            if old != new {
                self.store.save_quota(new).await?;
            }
        }
        state.quotas = updated;
        Ok(())
    }

    pub async fn check_and_reserve(&self, user_id: &str, charge: QuotaCharge) -> EngineResult<()> {
        self.check_and_reserve_at(user_id, charge, Utc::now()).await
    }

    /// Admit `charge` against every active quota of the user, or none.
    /// A denial marks the exhausted quota `is_exceeded`.
    pub async fn check_and_reserve_at(
        &self,
        user_id: &str,
        charge: QuotaCharge,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let slot = self.slot(user_id);
        let mut state = slot.lock().await;
        self.ensure_loaded(user_id, &mut state, now).await?;

        let mut updated = state.quotas.clone();
        for quota in updated.iter_mut().filter(|q| q.is_due(now)) {
            debug!(user_id, quota_type = %quota.quota_type, "lazy quota reset");
            quota.reset(now);
        }

        let denied = updated
            .iter()
            .find(|q| q.is_active && !q.admits(charge.executions))
            .map(|q| q.quota_type);
        if let Some(quota_type) = denied {
            for quota in updated.iter_mut().filter(|q| q.quota_type == quota_type) {
                quota.is_exceeded = true;
                quota.updated_at = now;
            }
            self.commit(&mut state, updated).await?;
            info!(user_id, quota_type = %quota_type, "quota exceeded");
            return Err(EngineError::QuotaExceeded { quota_type });
        }

        for quota in updated.iter_mut().filter(|q| q.is_active) {
            quota.executions_used += charge.executions;
            quota.updated_at = now;
        }
        self.commit(&mut state, updated).await
    }

    /// Charge measured usage. Called for every finished run, whatever its
    /// outcome.
    pub async fn commit_usage(
        &self,
        user_id: &str,
        execution_time_secs: f64,
        memory_mb: u32,
    ) -> EngineResult<()> {
        let now = Utc::now();
        let slot = self.slot(user_id);
        let mut state = slot.lock().await;
        self.ensure_loaded(user_id, &mut state, now).await?;

        let mut updated = state.quotas.clone();
        for quota in updated.iter_mut().filter(|q| q.is_active) {
            quota.execution_time_used += execution_time_secs.max(0.0);
            quota.memory_usage_used += u64::from(memory_mb);
            quota.updated_at = now;
        }
        self.commit(&mut state, updated).await
    }

    /// Zero a user's quota of `quota_type`. Resetting twice leaves the same
    /// usage state; total quotas keep `next_reset` unset.
    pub async fn reset(
        &self,
        user_id: &str,
        quota_type: QuotaType,
        now: DateTime<Utc>,
    ) -> EngineResult<ExecutionQuota> {
        let slot = self.slot(user_id);
        let mut state = slot.lock().await;
        self.ensure_loaded(user_id, &mut state, now).await?;

        let mut updated = state.quotas.clone();
        let quota = updated
            .iter_mut()
            .find(|q| q.quota_type == quota_type)
            .ok_or_else(|| {
                EngineError::Internal(format!("user {user_id} has no {quota_type} quota"))
            })?;
        quota.reset(now);
        let reset = quota.clone();
        self.commit(&mut state, updated).await?;
        Ok(reset)
    }

    /// Reset every stored quota whose period has elapsed. Returns how many
    /// were reset.
    pub async fn reset_due(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let mut users: Vec<String> = self
            .store
            .quotas_due(now)
            .await?
            .into_iter()
            .map(|q| q.user_id)
            .collect();
        users.sort();
        users.dedup();

        let mut count = 0;
        for user_id in users {
            let slot = self.slot(&user_id);
            let mut state = slot.lock().await;
            self.ensure_loaded(&user_id, &mut state, now).await?;

            let mut updated = state.quotas.clone();
            for quota in updated.iter_mut().filter(|q| q.is_active && q.is_due(now)) {
                quota.reset(now);
                count += 1;
            }
            self.commit(&mut state, updated).await?;
        }
        if count > 0 {
            info!(count, "quotas reset");
        }
        Ok(count)
    }

    /// Current quota rows of a user.
    pub async fn quotas(&self, user_id: &str) -> EngineResult<Vec<ExecutionQuota>> {
        let slot = self.slot(user_id);
        let mut state = slot.lock().await;
        self.ensure_loaded(user_id, &mut state, Utc::now()).await?;
        Ok(state.quotas.clone())
    }

    /// Drop the cached state of users with no operation in flight. Their
    /// rows stay in the store and are reloaded on next use. Returns how
    /// many were dropped.
    pub fn evict_idle(&self) -> usize {
        let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        let before = users.len();
        // Callers clone the slot under this lock, so a lone reference is idle.
        users.retain(|_, slot| Arc::strong_count(slot) > 1);
        before - users.len()
    }

    /// Users whose quota state is cached in memory.
    pub fn cached_users(&self) -> usize {
        self.users.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Periodically run [`reset_due`](Self::reset_due) and evict idle users
    /// until `shutdown` fires.
    pub fn spawn_reset_worker(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.reset_due(Utc::now()).await {
                            warn!(error = %e, "quota reset sweep failed");
                        }
                        let evicted = self.evict_idle();
                        if evicted > 0 {
                            debug!(evicted, "idle quota state evicted");
                        }
                    }
                }
            }
            debug!("quota reset worker stopped");
        })
    }
}
