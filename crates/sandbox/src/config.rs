use std::collections::BTreeMap;

/// Hard resource ceilings applied to a single sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    /// CPU-seconds the process tree may consume before the kernel kills it.
    pub cpu_time_secs: u32,
    /// CFS quota per `cpu_period_us`, in microseconds.
    pub cpu_quota_us: u32,
    pub cpu_period_us: u32,
    /// Size of the writable scratch area (`/tmp`).
    pub scratch_mb: u32,
    /// Largest single file the sandbox may write.
    pub max_file_size_mb: u32,
    pub pids: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Disabled,
    Enabled,
}

/// Isolation knobs. Every field defaults to the most restrictive setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationPolicy {
    pub read_only_rootfs: bool,
    pub drop_all_capabilities: bool,
    pub no_new_privileges: bool,
    pub network: NetworkMode,
    /// Unprivileged identity the payload runs as.
    pub user: String,
    /// Whether binaries written to scratch may be executed (compiled languages).
    pub scratch_exec: bool,
}

impl Default for IsolationPolicy {
    fn default() -> Self {
        Self {
            read_only_rootfs: true,
            drop_all_capabilities: true,
            no_new_privileges: true,
            network: NetworkMode::Disabled,
            user: "nobody".into(),
            scratch_exec: false,
        }
    }
}

/// A file materialized read-only inside the sandbox working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxFile {
    /// Name relative to the working directory.
    pub name: String,
    pub content: Vec<u8>,
    /// Run directly as the payload rather than read by an interpreter.
    pub executable: bool,
}

/// Everything a runtime needs to create one isolated instance.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub id: uuid::Uuid,
    pub image: String,
    pub command: Vec<String>,
    pub workdir: String,
    pub files: Vec<SandboxFile>,
    /// Wired to the payload's standard input when present.
    pub stdin: Option<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub limits: ResourceLimits,
    pub isolation: IsolationPolicy,
}

impl SandboxSpec {
    pub fn file(&self, name: &str) -> Option<&SandboxFile> {
        self.files.iter().find(|f| f.name == name)
    }
}
