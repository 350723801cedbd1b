use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies an environment by language and version, e.g. `python/3.11`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentId {
    pub language: String,
    pub version: String,
}

impl EnvironmentId {
    pub fn new(language: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.language, self.version)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    #[default]
    Active,
    Maintenance,
    Deprecated,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentFeatures {
    pub supports_input: bool,
    pub supports_graphics: bool,
    pub supports_networking: bool,
    pub supports_file_operations: bool,
}

impl Default for EnvironmentFeatures {
    fn default() -> Self {
        Self {
            supports_input: true,
            supports_graphics: false,
            supports_networking: false,
            supports_file_operations: true,
        }
    }
}

/// Source-level restrictions checked before a payload is launched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityRules {
    /// When non-empty, the only modules a payload may import.
    pub allowed_imports: Vec<String>,
    pub blocked_imports: Vec<String>,
    pub blocked_functions: Vec<String>,
}

/// Descriptor of one language runtime. Authored by administrators and
/// unique per (language, version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEnvironment {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub language: String,
    pub version: String,
    /// Container image reference.
    pub image: String,
    /// Seconds.
    #[serde(default = "defaults::timeout")]
    pub default_timeout: u32,
    /// MB.
    #[serde(default = "defaults::max_memory")]
    pub max_memory: u32,
    /// Seconds.
    #[serde(default = "defaults::max_cpu_time")]
    pub max_cpu_time: u32,
    /// MB.
    #[serde(default = "defaults::max_file_size")]
    pub max_file_size: u32,
    #[serde(default)]
    pub features: EnvironmentFeatures,
    #[serde(default)]
    pub compiler_command: Option<String>,
    #[serde(default)]
    pub interpreter_command: Option<String>,
    /// Including the leading dot, e.g. `.py`.
    pub file_extension: String,
    #[serde(default)]
    pub installed_packages: Vec<String>,
    #[serde(default)]
    pub available_libraries: Vec<String>,
    #[serde(default)]
    pub security: SecurityRules,
    #[serde(default)]
    pub status: EnvironmentStatus,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

mod defaults {
    pub(super) fn timeout() -> u32 {
        30
    }
    pub(super) fn max_memory() -> u32 {
        128
    }
    pub(super) fn max_cpu_time() -> u32 {
        10
    }
    pub(super) fn max_file_size() -> u32 {
        10
    }
}

impl ExecutionEnvironment {
    pub fn key(&self) -> EnvironmentId {
        EnvironmentId::new(&self.language, &self.version)
    }

    pub fn is_active(&self) -> bool {
        self.status == EnvironmentStatus::Active
    }

    /// Name of the source file inside the sandbox.
    pub fn source_file_name(&self) -> String {
        let ext = self.file_extension.trim();
        if ext.is_empty() || ext.starts_with('.') {
            format!("main{ext}")
        } else {
            format!("main.{ext}")
        }
    }
}
