use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sandbox::{
    IsolationPolicy, NetworkMode, ResourceLimits, ResourceStats, Sandbox, SandboxError,
    SandboxFactory, SandboxFile, SandboxLogs, SandboxSpec, WaitOutcome,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::model::{CodeExecution, ExecutionEnvironment};

/// Mount point of the read-only source directory.
pub const WORKDIR: &str = "/workspace";

/// CFS period; the quota is derived from the environment's CPU time.
const CPU_PERIOD_US: u32 = 100_000;

/// Where compiled payloads are written, inside the scratch tmpfs.
const COMPILED_BINARY: &str = "/tmp/main";

/// Argv for running `file_name` in `env`, and whether the payload needs an
/// executable scratch area (compiled) or an executable source file (neither
/// compiler nor interpreter).
fn command_for(env: &ExecutionEnvironment, file_name: &str, args: &[String]) -> (Vec<String>, bool, bool) {
    let configured = |c: &Option<String>| c.as_deref().map(str::trim).filter(|c| !c.is_empty()).map(String::from);

    if let Some(interpreter) = configured(&env.interpreter_command) {
        let mut cmd: Vec<String> = interpreter.split_whitespace().map(String::from).collect();
        cmd.push(file_name.to_string());
        cmd.extend(args.iter().cloned());
        return (cmd, false, false);
    }

    if let Some(compiler) = configured(&env.compiler_command) {
        // Compile errors surface as the compiler's stderr and a nonzero exit.
        let script = format!(
            "{compiler} {file_name} -o {COMPILED_BINARY} && exec {COMPILED_BINARY} \"$@\""
        );
        let mut cmd = vec!["sh".to_string(), "-c".to_string(), script, "sh".to_string()];
        cmd.extend(args.iter().cloned());
        return (cmd, true, false);
    }

    let mut cmd = vec![format!("./{file_name}")];
    cmd.extend(args.iter().cloned());
    (cmd, false, true)
}

/// Builds isolation specs and hands out sandboxes wrapped in a lease that
/// always returns them to the factory.
pub struct SandboxLauncher {
    factory: Arc<dyn SandboxFactory>,
    pids_limit: u32,
    cleanup_grace: Duration,
}

impl SandboxLauncher {
    pub fn new(factory: Arc<dyn SandboxFactory>, pids_limit: u32, cleanup_grace: Duration) -> Self {
        Self {
            factory,
            pids_limit,
            cleanup_grace,
        }
    }

    /// Sandboxes currently allocated by the runtime.
    pub fn active(&self) -> usize {
        self.factory.active()
    }

    /// Isolation spec for running `execution` in `env`. `memory_cap_mb` can
    /// only lower the environment's memory ceiling.
    pub fn build_spec(
        &self,
        env: &ExecutionEnvironment,
        execution: &CodeExecution,
        timeout: Duration,
        memory_cap_mb: Option<u32>,
    ) -> SandboxSpec {
        let file_name = env.source_file_name();
        let (command, compiled, executable) = command_for(env, &file_name, &execution.args);
        let memory_mb = memory_cap_mb.map_or(env.max_memory, |cap| cap.min(env.max_memory));

        let env_vars = BTreeMap::from([
            ("TIMEOUT".to_string(), timeout.as_secs().to_string()),
            ("MAX_MEMORY".to_string(), memory_mb.to_string()),
        ]);
        let labels = BTreeMap::from([
            ("execution-id".to_string(), execution.id.to_string()),
            ("user-id".to_string(), execution.user_id.clone()),
            ("environment".to_string(), env.key().to_string()),
        ]);

        let stdin = execution
            .stdin
            .as_ref()
            .filter(|s| !s.is_empty() && env.features.supports_input)
            .cloned();

        SandboxSpec {
            id: Uuid::new_v4(),
            image: env.image.clone(),
            command,
            workdir: WORKDIR.to_string(),
            files: vec![SandboxFile {
                name: file_name,
                content: execution.source_code.clone().into_bytes(),
                executable,
            }],
            stdin,
            env: env_vars,
            labels,
            limits: ResourceLimits {
                memory_mb,
                cpu_time_secs: env.max_cpu_time,
                cpu_quota_us: env.max_cpu_time.saturating_mul(1000),
                cpu_period_us: CPU_PERIOD_US,
                scratch_mb: env.max_file_size,
                max_file_size_mb: env.max_file_size,
                pids: self.pids_limit,
            },
            isolation: IsolationPolicy {
                network: if env.features.supports_networking {
                    NetworkMode::Enabled
                } else {
                    NetworkMode::Disabled
                },
                scratch_exec: compiled,
                ..IsolationPolicy::default()
            },
        }
    }

    /// Create and start a sandbox. A sandbox that fails to start is
    /// destroyed before the error is returned.
    pub async fn launch(&self, spec: SandboxSpec) -> sandbox::Result<SandboxLease> {
        let sandbox = self.factory.create(spec).await?;
        let mut lease = SandboxLease {
            id: sandbox.id().to_string(),
            factory: Arc::clone(&self.factory),
            sandbox: Some(sandbox),
            grace: self.cleanup_grace,
        };
        if let Err(e) = lease.start().await {
            if let Err(cleanup) = lease.release().await {
                warn!(error = %cleanup, "cleanup after failed start failed");
            }
            return Err(e);
        }
        Ok(lease)
    }
}

/// Exclusive use of one sandbox. [`release`](Self::release) returns it to
/// the factory; dropping an unreleased lease schedules the same cleanup on
/// the runtime.
pub struct SandboxLease {
    id: String,
    factory: Arc<dyn SandboxFactory>,
    sandbox: Option<Box<dyn Sandbox>>,
    grace: Duration,
}

impl SandboxLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn released(&self) -> SandboxError {
        SandboxError::Runtime(format!("sandbox {} already released", self.id))
    }

    async fn start(&mut self) -> sandbox::Result<()> {
        let err = self.released();
        self.sandbox.as_deref_mut().ok_or(err)?.start().await
    }

    pub async fn wait(&mut self, timeout: Duration) -> sandbox::Result<WaitOutcome> {
        let err = self.released();
        self.sandbox.as_deref_mut().ok_or(err)?.wait(timeout).await
    }

    /// Force-stop with the configured grace period.
    pub async fn stop(&mut self) -> sandbox::Result<()> {
        let grace = self.grace;
        // The runtime escalates to a kill after `grace`; allow it as long again.
        let bound = grace * 2;
        let err = self.released();
        let sandbox = self.sandbox.as_deref_mut().ok_or(err)?;
        match tokio::time::timeout(bound, sandbox.stop(grace)).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::Runtime(format!(
                "stop did not finish within {}s",
                bound.as_secs()
            ))),
        }
    }

    pub async fn logs(&self) -> sandbox::Result<SandboxLogs> {
        self.sandbox.as_deref().ok_or_else(|| self.released())?.logs().await
    }

    pub async fn stats(&self) -> sandbox::Result<ResourceStats> {
        self.sandbox.as_deref().ok_or_else(|| self.released())?.stats().await
    }

    /// Destroy the sandbox. Waits at most the grace period; a removal still
    /// in flight after that keeps running in the background.
    pub async fn release(mut self) -> sandbox::Result<()> {
        let Some(sandbox) = self.sandbox.take() else {
            return Ok(());
        };
        let factory = Arc::clone(&self.factory);
        let mut removal = tokio::spawn(async move { factory.destroy(sandbox).await });

        match tokio::time::timeout(self.grace, &mut removal).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(SandboxError::Runtime(format!("destroy task failed: {join}"))),
            Err(_) => {
                warn!(sandbox_id = %self.id, "destroy exceeded grace period, continuing in background");
                Ok(())
            }
        }
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        let Some(sandbox) = self.sandbox.take() else {
            return;
        };
        let sandbox_id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(sandbox_id = %sandbox_id, "lease dropped, scheduling cleanup");
                let factory = Arc::clone(&self.factory);
                handle.spawn(async move {
                    if let Err(e) = factory.destroy(sandbox).await {
                        warn!(sandbox_id = %sandbox_id, error = %e, "background cleanup failed");
                    }
                });
            }
            Err(_) => error!(sandbox_id = %sandbox_id, "lease dropped outside a runtime, sandbox leaked"),
        }
    }
}
