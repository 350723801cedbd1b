use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use sandbox::{ProcessExit, ResourceStats, SandboxError, SandboxFactory, SandboxLogs, WaitOutcome};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DockerSettings, EngineSettings};
use crate::error::{EngineError, EngineResult};
use crate::launcher::{SandboxLauncher, SandboxLease};
use crate::model::{CodeExecution, ExecutionKind, ExecutionRequest, ExecutionStatus};
use crate::quota::{QuotaCharge, QuotaTracker};
use crate::registry::EnvironmentRegistry;
use crate::store::ResultStore;
use crate::test_runner::{GradeReport, TestRunner};

const TRUNCATION_MARKER: &str = "\n... [output truncated]";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrent: usize,
    pub cleanup_grace: Duration,
    pub max_output_bytes: usize,
    pub worker_node: String,
    pub pids_limit: u32,
}

impl OrchestratorConfig {
    pub fn from_settings(engine: &EngineSettings, docker: &DockerSettings) -> Self {
        let worker_node = engine.worker_node.clone().unwrap_or_else(|| {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string())
        });
        Self {
            max_concurrent: engine.max_concurrent.max(1),
            cleanup_grace: engine.cleanup_grace(),
            max_output_bytes: engine.max_output_bytes,
            worker_node,
            pids_limit: docker.pids_limit,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default(), &DockerSettings::default())
    }
}

/// Per-run overrides of the environment's limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Replaces the environment's default timeout.
    pub timeout: Option<Duration>,
    /// Lowers the environment's memory ceiling.
    pub memory_cap_mb: Option<u32>,
}

/// Final record of a run plus, for graded submissions, the grade.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub execution: CodeExecution,
    pub grade: Option<GradeReport>,
}

/// How the wait on a started sandbox ended.
enum Supervised {
    Exited(ProcessExit),
    DeadlineExceeded,
    Cancelled,
    Failed(SandboxError),
}

/// Cut `bytes` to at most `max` and decode, marking any truncation.
fn capture(bytes: &[u8], max: usize) -> String {
    match bytes.get(..max) {
        Some(head) if head.len() < bytes.len() => {
            let mut text = String::from_utf8_lossy(head).into_owned();
            text.push_str(TRUNCATION_MARKER);
            text
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn append_line(buffer: &mut String, line: &str) {
    if !buffer.is_empty() && !buffer.ends_with('\n') {
        buffer.push('\n');
    }
    buffer.push_str(line);
}

/// Drives executions through their lifecycle: admission, queueing on the
/// host concurrency ceiling, launch, deadline-bounded wait, capture and
/// cleanup.
pub struct Orchestrator {
    registry: Arc<EnvironmentRegistry>,
    quotas: Arc<QuotaTracker>,
    store: Arc<dyn ResultStore>,
    launcher: SandboxLauncher,
    permits: Arc<Semaphore>,
    config: OrchestratorConfig,
    /// Parent of every execution token; cancelled on shutdown.
    closing: CancellationToken,
    cancellations: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<EnvironmentRegistry>,
        quotas: Arc<QuotaTracker>,
        store: Arc<dyn ResultStore>,
        factory: Arc<dyn SandboxFactory>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            launcher: SandboxLauncher::new(factory, config.pids_limit, config.cleanup_grace),
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            registry,
            quotas,
            store,
            config,
            closing: CancellationToken::new(),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &EnvironmentRegistry {
        &self.registry
    }

    pub fn quotas(&self) -> &QuotaTracker {
        &self.quotas
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    /// Sandboxes currently allocated by the runtime.
    pub fn active_sandboxes(&self) -> usize {
        self.launcher.active()
    }

    fn cancellation(&self, id: Uuid) -> CancellationToken {
        self.cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert_with(|| self.closing.child_token())
            .clone()
    }

    fn forget_cancellation(&self, id: Uuid) -> Option<CancellationToken> {
        self.cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Executions submitted and not yet finished.
    pub fn tracked_executions(&self) -> usize {
        self.cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Give up on a submitted execution that will never be run. Returns
    /// false when it is unknown or already finished.
    pub fn discard(&self, execution_id: Uuid) -> bool {
        match self.forget_cancellation(execution_id) {
            Some(token) => {
                token.cancel();
                debug!(execution_id = %execution_id, "execution discarded");
                true
            }
            None => false,
        }
    }

    /// Cancel every queued and running execution and stop tracking them.
    /// Runs started afterwards are cancelled before they launch.
    pub fn shutdown(&self) {
        self.closing.cancel();
        let tracked = std::mem::take(
            &mut *self
                .cancellations
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        info!(executions = tracked.len(), "orchestrator shut down");
    }

    /// Accept a request: the environment must be active and the user's
    /// quotas must admit one more run. Nothing is recorded on rejection.
    pub async fn submit(&self, request: ExecutionRequest) -> EngineResult<CodeExecution> {
        self.registry.resolve(&request.environment)?;
        self.quotas
            .check_and_reserve(&request.user_id, QuotaCharge::SINGLE)
            .await?;
        self.enqueue(request).await
    }

    /// Accept a run derived from an already admitted submission. Skips the
    /// reservation; measured usage is still charged.
    pub(crate) async fn submit_derived(
        &self,
        request: ExecutionRequest,
    ) -> EngineResult<CodeExecution> {
        self.registry.resolve(&request.environment)?;
        self.enqueue(request).await
    }

    async fn enqueue(&self, request: ExecutionRequest) -> EngineResult<CodeExecution> {
        let execution = CodeExecution::queued(request, Utc::now());
        self.store.create_execution(&execution).await?;
        self.cancellation(execution.id);
        info!(
            execution_id = %execution.id,
            user_id = %execution.user_id,
            environment = %execution.environment,
            kind = ?execution.kind,
            "execution queued"
        );
        Ok(execution)
    }

    /// Request cancellation of a queued or running execution. Returns false
    /// when the execution is unknown or already finished.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        let token = self
            .cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&execution_id)
            .cloned();
        match token {
            Some(token) => {
                info!(execution_id = %execution_id, "cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run a queued execution to a terminal state. Never fails: every error
    /// is recorded on the returned execution.
    pub async fn run(&self, execution: CodeExecution, options: RunOptions) -> CodeExecution {
        let mut execution = execution;
        if execution.status != ExecutionStatus::Queued {
            warn!(execution_id = %execution.id, status = %execution.status, "run called on non-queued execution");
            return execution;
        }

        let token = self.cancellation(execution.id);
        if let Err(e) = self.drive(&mut execution, options, &token).await {
            warn!(execution_id = %execution.id, error = %e, "execution aborted");
            let status = e.execution_status().unwrap_or(ExecutionStatus::Failed);
            if !execution.is_terminal() && execution.transition(status).is_err() {
                // Only a running execution may reach every terminal state.
                execution.status = ExecutionStatus::Failed;
            }
            append_line(&mut execution.stderr, &e.to_string());
        }
        self.forget_cancellation(execution.id);
        execution.completed_at = Some(Utc::now());

        if let Err(e) = self.store.update_execution(&execution).await {
            warn!(execution_id = %execution.id, error = %e, "failed to store execution result");
        }
        let elapsed = execution.execution_time.unwrap_or(0.0);
        let memory = execution.memory_used.unwrap_or(0);
        if let Err(e) = self.quotas.commit_usage(&execution.user_id, elapsed, memory).await {
            warn!(user_id = %execution.user_id, error = %e, "failed to commit quota usage");
        }

        info!(
            execution_id = %execution.id,
            status = %execution.status,
            exit_code = ?execution.exit_code,
            execution_time = elapsed,
            memory_mb = memory,
            "execution finished"
        );
        execution
    }

    async fn drive(
        &self,
        execution: &mut CodeExecution,
        options: RunOptions,
        token: &CancellationToken,
    ) -> EngineResult<()> {
        let _permit = tokio::select! {
            biased;
            () = token.cancelled() => {
                execution.transition(ExecutionStatus::Cancelled)?;
                return Ok(());
            }
            permit = Arc::clone(&self.permits).acquire_owned() => permit
                .map_err(|_| EngineError::Internal("execution queue closed".into()))?,
        };

        let entry = match self.registry.resolve(&execution.environment) {
            Ok(entry) => entry,
            Err(e) => {
                execution.transition(ExecutionStatus::Failed)?;
                execution.stderr = e.to_string();
                return Ok(());
            }
        };
        let env = &entry.environment;

        execution.transition(ExecutionStatus::Running)?;
        execution.started_at = Some(Utc::now());
        execution.worker_node = Some(self.config.worker_node.clone());
        if let Err(e) = self.store.update_execution(execution).await {
            warn!(execution_id = %execution.id, error = %e, "failed to store running state");
        }
        let started = Instant::now();

        let report = entry.policy.scan(&execution.source_code);
        if !report.is_clean() {
            info!(execution_id = %execution.id, violations = ?report.violations, "rejected by source policy");
            execution.stderr = EngineError::SecurityViolation(report.violations.join("; ")).to_string();
            execution.security_violations = report.violations;
            execution.blocked_operations = report.blocked_operations;
            execution.execution_time = Some(0.0);
            execution.memory_used = Some(0);
            execution.transition(ExecutionStatus::SecurityViolation)?;
            return Ok(());
        }

        let timeout = options
            .timeout
            .unwrap_or_else(|| Duration::from_secs(u64::from(env.default_timeout)));
        let spec = self
            .launcher
            .build_spec(env, execution, timeout, options.memory_cap_mb);
        let memory_limit = spec.limits.memory_mb;
        execution.sandbox_id = Some(spec.id.to_string());

        let mut lease = match self.launcher.launch(spec).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(execution_id = %execution.id, error = %e, "sandbox launch failed");
                execution.stderr = EngineError::SandboxLaunch(e.to_string()).to_string();
                execution.execution_time = Some(started.elapsed().as_secs_f64());
                execution.memory_used = Some(0);
                execution.transition(ExecutionStatus::Failed)?;
                return Ok(());
            }
        };
        debug!(execution_id = %execution.id, sandbox_id = %lease.id(), "sandbox started");

        let supervised = Self::supervise(&mut lease, timeout, token).await;
        let elapsed = started.elapsed();
        if !matches!(supervised, Supervised::Exited(_))
            && let Err(e) = lease.stop().await
        {
            warn!(sandbox_id = %lease.id(), error = %e, "force stop failed");
        }

        let (logs, stats) = self.collect(&lease).await;
        if let Err(e) = lease.release().await {
            warn!(execution_id = %execution.id, error = %e, "sandbox cleanup failed");
        }

        execution.stdout = capture(&logs.stdout, self.config.max_output_bytes);
        execution.stderr = capture(&logs.stderr, self.config.max_output_bytes);
        execution.execution_time = Some(elapsed.as_secs_f64());
        execution.memory_used = Some(stats.peak_memory_mb());
        execution.cpu_time = Some(stats.cpu_time.as_secs_f64());

        let status = match supervised {
            Supervised::Exited(exit) => {
                execution.exit_code = Some(exit.exit_code);
                if !exit.violations.is_empty() {
                    execution.security_violations = exit.violations;
                    ExecutionStatus::SecurityViolation
                } else if exit.oom_killed {
                    append_line(
                        &mut execution.stderr,
                        &EngineError::MemoryLimitExceeded(memory_limit).to_string(),
                    );
                    ExecutionStatus::MemoryLimit
                } else {
                    ExecutionStatus::Completed
                }
            }
            Supervised::DeadlineExceeded => {
                append_line(
                    &mut execution.stderr,
                    &EngineError::ExecutionTimeout(timeout.as_secs()).to_string(),
                );
                ExecutionStatus::Timeout
            }
            Supervised::Cancelled => ExecutionStatus::Cancelled,
            Supervised::Failed(e) => {
                append_line(&mut execution.stderr, &EngineError::Sandbox(e).to_string());
                ExecutionStatus::Failed
            }
        };
        execution.transition(status)
    }

    async fn supervise(
        lease: &mut SandboxLease,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Supervised {
        tokio::select! {
            waited = lease.wait(timeout) => match waited {
                Ok(WaitOutcome::Exited(exit)) => Supervised::Exited(exit),
                Ok(WaitOutcome::DeadlineExceeded) => Supervised::DeadlineExceeded,
                Err(e) => Supervised::Failed(e),
            },
            () = token.cancelled() => Supervised::Cancelled,
        }
    }

    /// Output and accounting, best effort: a failure leaves that part empty.
    async fn collect(&self, lease: &SandboxLease) -> (SandboxLogs, ResourceStats) {
        let logs = lease.logs().await.unwrap_or_else(|e| {
            warn!(sandbox_id = %lease.id(), error = %e, "failed to fetch logs");
            SandboxLogs::default()
        });
        let stats = lease.stats().await.unwrap_or_else(|e| {
            warn!(sandbox_id = %lease.id(), error = %e, "failed to fetch resource stats");
            ResourceStats::default()
        });
        (logs, stats)
    }

    /// Submit, run, and for exercise submissions grade against the
    /// exercise's test cases.
    pub async fn execute(&self, request: ExecutionRequest) -> EngineResult<ExecutionOutcome> {
        let execution = self.submit(request).await?;
        let execution = self.run(execution, RunOptions::default()).await;

        let grade = match (execution.kind, execution.exercise_id) {
            (ExecutionKind::Exercise, Some(_)) => match TestRunner::new(self).grade(&execution).await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(execution_id = %execution.id, error = %e, "grading failed");
                    None
                }
            },
            _ => None,
        };
        Ok(ExecutionOutcome { execution, grade })
    }
}
