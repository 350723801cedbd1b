use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::model::{EnvironmentId, ExecutionEnvironment};
use crate::policy::SecurityPolicy;

/// A registered environment with its compiled source policy.
#[derive(Debug, Clone)]
pub struct EnvironmentEntry {
    pub environment: Arc<ExecutionEnvironment>,
    pub policy: Arc<SecurityPolicy>,
}

/// Maps (language, version) to environment descriptors.
#[derive(Default)]
pub struct EnvironmentRegistry {
    entries: RwLock<HashMap<EnvironmentId, EnvironmentEntry>>,
}

fn validate(env: &ExecutionEnvironment) -> EngineResult<()> {
    let key = env.key();
    let require = |value: &str, field: &str| {
        if value.trim().is_empty() {
            Err(EngineError::Config(format!("environment {key}: {field} is empty")))
        } else {
            Ok(())
        }
    };
    require(&env.language, "language")?;
    require(&env.version, "version")?;
    require(&env.image, "image")?;
    require(&env.file_extension, "file_extension")?;
    if env.default_timeout == 0 || env.max_memory == 0 || env.max_cpu_time == 0 {
        return Err(EngineError::Config(format!(
            "environment {key}: timeout, memory and cpu limits must be positive"
        )));
    }
    Ok(())
}

impl EnvironmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configured environments, rejecting duplicate
    /// keys and more than one default per language.
    pub fn from_environments(environments: Vec<ExecutionEnvironment>) -> EngineResult<Self> {
        let mut keys = HashSet::new();
        let mut defaults = HashSet::new();
        for env in &environments {
            if !keys.insert(env.key()) {
                return Err(EngineError::Config(format!(
                    "duplicate environment {}",
                    env.key()
                )));
            }
            if env.is_default && !defaults.insert(env.language.clone()) {
                return Err(EngineError::Config(format!(
                    "more than one default environment for {}",
                    env.language
                )));
            }
        }

        let registry = Self::new();
        for env in environments {
            registry.upsert(env)?;
        }
        Ok(registry)
    }

    /// Insert or replace an environment. Marking it default clears the flag
    /// on the language's other versions.
    pub fn upsert(&self, env: ExecutionEnvironment) -> EngineResult<()> {
        validate(&env)?;
        let policy = SecurityPolicy::compile(&env.security, &env.language)?;
        let key = env.key();

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if env.is_default {
            for (other_key, entry) in entries.iter_mut() {
                if other_key.language == key.language
                    && *other_key != key
                    && entry.environment.is_default
                {
                    let mut demoted = (*entry.environment).clone();
                    demoted.is_default = false;
                    entry.environment = Arc::new(demoted);
                }
            }
        }
        info!(environment = %key, status = ?env.status, "environment registered");
        entries.insert(
            key,
            EnvironmentEntry {
                environment: Arc::new(env),
                policy: Arc::new(policy),
            },
        );
        Ok(())
    }

    /// Look up an environment that may accept new executions.
    pub fn resolve(&self, id: &EnvironmentId) -> EngineResult<EnvironmentEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get(id)
            .ok_or_else(|| EngineError::InvalidEnvironment(format!("unknown environment {id}")))?;
        if !entry.environment.is_active() {
            return Err(EngineError::InvalidEnvironment(format!(
                "environment {id} is {:?}",
                entry.environment.status
            )));
        }
        Ok(entry.clone())
    }

    /// The active default version of `language`.
    pub fn default_for(&self, language: &str) -> EngineResult<EnvironmentEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .values()
            .find(|e| {
                e.environment.language == language
                    && e.environment.is_default
                    && e.environment.is_active()
            })
            .cloned()
            .ok_or_else(|| {
                EngineError::InvalidEnvironment(format!("no active default for {language}"))
            })
    }

    /// All environments regardless of status, ordered by key.
    pub fn list(&self) -> Vec<Arc<ExecutionEnvironment>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = entries.values().map(|e| Arc::clone(&e.environment)).collect();
        all.sort_by_key(|e| e.key());
        all
    }
}
