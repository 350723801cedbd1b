use std::time::Duration;

/// How a wait on a started sandbox ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(ProcessExit),
    /// The deadline passed first. The sandbox is still running.
    DeadlineExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessExit {
    pub exit_code: i32,
    /// Killed by the memory controller.
    pub oom_killed: bool,
    /// Isolation violations reported by the runtime (blocked syscalls etc.).
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SandboxLogs {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Point-in-time accounting snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceStats {
    pub peak_memory_bytes: u64,
    pub cpu_time: Duration,
}

impl ResourceStats {
    /// Peak memory in whole megabytes, rounded up.
    pub fn peak_memory_mb(&self) -> u32 {
        let mb = self.peak_memory_bytes.div_ceil(1024 * 1024);
        u32::try_from(mb).unwrap_or(u32::MAX)
    }
}
