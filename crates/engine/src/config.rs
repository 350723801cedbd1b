use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::model::ExecutionEnvironment;
use crate::quota::QuotaPolicy;
use crate::registry::EnvironmentRegistry;

pub(crate) const DEFAULT_MAX_CONCURRENT: usize = 4;
pub(crate) const DEFAULT_CLEANUP_GRACE_SECS: u64 = 5;
pub(crate) const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;
pub(crate) const DEFAULT_PIDS_LIMIT: u32 = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub docker: DockerSettings,
    #[serde(default)]
    pub quotas: QuotaPolicy,
    #[serde(default)]
    pub environments: Vec<ExecutionEnvironment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Runs beyond this many wait in the queue.
    pub max_concurrent: usize,
    pub cleanup_grace_secs: u64,
    /// Per-stream cap on captured stdout / stderr.
    pub max_output_bytes: usize,
    /// Recorded on each execution; the host name when unset.
    pub worker_node: Option<String>,
    /// Period of the background quota reset sweep.
    pub quota_reset_interval_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            cleanup_grace_secs: DEFAULT_CLEANUP_GRACE_SECS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            worker_node: None,
            quota_reset_interval_secs: 300,
        }
    }
}

impl EngineSettings {
    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs(self.cleanup_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    pub socket: Option<PathBuf>,
    pub workspace_dir: PathBuf,
    pub network: Option<String>,
    pub pids_limit: u32,
    pub api_timeout_secs: u64,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            socket: None,
            workspace_dir: PathBuf::from("work"),
            network: None,
            pids_limit: DEFAULT_PIDS_LIMIT,
            api_timeout_secs: 120,
        }
    }
}

/// Load and validate an engine config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> EngineResult<EngineConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EngineError::Config(format!("read {}: {e}", path.display())))?;
    let mut config = parse(&content).map_err(|e| match e {
        EngineError::Config(msg) => EngineError::Config(format!("{}: {msg}", path.display())),
        other => other,
    })?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    Ok(config)
}

/// Parse and validate YAML without touching the filesystem.
pub fn parse(content: &str) -> EngineResult<EngineConfig> {
    let config: EngineConfig = serde_yaml_ng::from_str(content)
        .map_err(|e| EngineError::Config(format!("parse: {e}")))?;
    config.validate()?;
    Ok(config)
}

impl EngineConfig {
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.docker.workspace_dir);
        if let Some(socket) = &mut self.docker.socket {
            resolve(socket);
        }
    }

    fn validate(&self) -> EngineResult<()> {
        if self.engine.max_concurrent == 0 {
            return Err(EngineError::Config("engine.max_concurrent must be > 0".into()));
        }
        if self.engine.cleanup_grace_secs == 0 {
            return Err(EngineError::Config("engine.cleanup_grace_secs must be > 0".into()));
        }
        if self.engine.max_output_bytes == 0 {
            return Err(EngineError::Config("engine.max_output_bytes must be > 0".into()));
        }
        if self.docker.pids_limit == 0 {
            return Err(EngineError::Config("docker.pids_limit must be > 0".into()));
        }
        self.registry().map(|_| ())
    }

    /// Build the environment registry described by this config.
    pub fn registry(&self) -> EngineResult<EnvironmentRegistry> {
        EnvironmentRegistry::from_environments(self.environments.clone())
    }
}
