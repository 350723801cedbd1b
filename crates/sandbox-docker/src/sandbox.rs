use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::ContainerStatsResponse;
use bollard::query_parameters::{
    InspectContainerOptions, LogsOptionsBuilder, StartContainerOptions, StatsOptionsBuilder,
    StopContainerOptionsBuilder, WaitContainerOptions,
};
use futures_util::StreamExt;
use sandbox::{
    ProcessExit, ResourceStats, Sandbox, SandboxError, SandboxLogs, WaitOutcome,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound on the final stats request made after the run.
const FINAL_SAMPLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Exit status of a process killed by `SIGSYS`, which is how a seccomp
/// filter in kill mode reports a blocked system call.
const SIGSYS_EXIT: i64 = 128 + 31;

pub struct DockerSandbox {
    docker: Docker,
    pub(crate) id: String,
    pub(crate) container_id: String,
    /// Host source directory (deleted by the factory on destroy).
    pub(crate) workspace: PathBuf,
    started: bool,
    /// Running peak, fed by the stats sampler while the container lives.
    /// Best-effort: under cgroup v1 Docker reports the kernel's own peak,
    /// under cgroup v2 only instantaneous usage, so short spikes between
    /// samples can go unseen there.
    usage: Arc<Mutex<ResourceStats>>,
    sampler: Option<JoinHandle<()>>,
}

impl DockerSandbox {
    pub(crate) fn new(docker: Docker, id: String, container_id: String, workspace: PathBuf) -> Self {
        Self {
            docker,
            id,
            container_id,
            workspace,
            started: false,
            usage: Arc::new(Mutex::new(ResourceStats::default())),
            sampler: None,
        }
    }

    /// Whether the kernel OOM-killed the container, and its memory ceiling.
    async fn exit_state(&self) -> (bool, Option<u64>) {
        match self
            .docker
            .inspect_container(&self.container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => {
                let oom_killed = inspect
                    .state
                    .and_then(|state| state.oom_killed)
                    .unwrap_or(false);
                let limit = inspect
                    .host_config
                    .and_then(|host| host.memory)
                    .and_then(|bytes| u64::try_from(bytes).ok())
                    .filter(|bytes| *bytes > 0);
                (oom_killed, limit)
            }
            Err(e) => {
                warn!(id = %self.id, error = %e, "inspect after exit failed");
                (false, None)
            }
        }
    }

    /// One last stats reading, for runs shorter than the sampling period.
    async fn final_sample(&self) {
        let options = StatsOptionsBuilder::new().stream(false).one_shot(true).build();
        let mut stream = Box::pin(self.docker.stats(&self.container_id, Some(options)));
        match tokio::time::timeout(FINAL_SAMPLE_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(sample))) => {
                fold_sample(&mut self.usage.lock().unwrap_or_else(PoisonError::into_inner), &sample);
            }
            Ok(Some(Err(e))) => debug!(id = %self.id, error = %e, "final stats sample failed"),
            Ok(None) | Err(_) => debug!(id = %self.id, "no final stats sample"),
        }
    }

    pub(crate) fn abort_sampler(&mut self) {
        if let Some(handle) = self.sampler.take() {
            handle.abort();
        }
    }
}

impl Drop for DockerSandbox {
    fn drop(&mut self) {
        self.abort_sampler();
    }
}

/// Follow the container's stats stream and keep the highest memory reading
/// and the latest cumulative CPU time. Ends when the container stops.
fn spawn_stats_sampler(
    docker: Docker,
    container_id: String,
    usage: Arc<Mutex<ResourceStats>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let options = StatsOptionsBuilder::new().stream(true).one_shot(false).build();
        let mut stream = Box::pin(docker.stats(&container_id, Some(options)));
        while let Some(sample) = stream.next().await {
            let sample = match sample {
                Ok(sample) => sample,
                Err(e) => {
                    debug!(container_id = %container_id, error = %e, "stats stream ended");
                    break;
                }
            };
            fold_sample(&mut usage.lock().unwrap_or_else(PoisonError::into_inner), &sample);
        }
    })
}

/// Fold one stats reading into the running peak. `max_usage` is the
/// kernel's recorded peak and only exists under cgroup v1; otherwise the
/// instantaneous usage is the best available reading.
fn fold_sample(usage: &mut ResourceStats, sample: &ContainerStatsResponse) {
    let memory = sample
        .memory_stats
        .as_ref()
        .and_then(|m| m.max_usage.or(m.usage))
        .unwrap_or(0);
    let cpu_ns = sample
        .cpu_stats
        .as_ref()
        .and_then(|c| c.cpu_usage.as_ref())
        .and_then(|u| u.total_usage)
        .unwrap_or(0);
    usage.peak_memory_bytes = usage.peak_memory_bytes.max(memory);
    usage.cpu_time = usage.cpu_time.max(Duration::from_nanos(cpu_ns));
}

fn is_benign_stop_error(error: &BollardError) -> bool {
    // 304: already stopped, 404: already gone.
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. }
            if *status_code == 304 || *status_code == 404
    )
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&mut self) -> sandbox::Result<()> {
        if self.started {
            return Err(SandboxError::StartFailed(format!(
                "sandbox {} already started",
                self.id
            )));
        }
        self.docker
            .start_container(&self.container_id, None::<StartContainerOptions>)
            .await
            .map_err(|e| SandboxError::StartFailed(format!("start container: {e}")))?;
        self.started = true;
        self.sampler = Some(spawn_stats_sampler(
            self.docker.clone(),
            self.container_id.clone(),
            Arc::clone(&self.usage),
        ));
        info!(id = %self.id, container_id = %self.container_id, "container started");
        Ok(())
    }

    async fn wait(&mut self, timeout: Duration) -> sandbox::Result<WaitOutcome> {
        if !self.started {
            return Err(SandboxError::WaitFailed(format!(
                "sandbox {} is not running",
                self.id
            )));
        }

        let mut stream = Box::pin(
            self.docker
                .wait_container(&self.container_id, None::<WaitContainerOptions>),
        );
        let status_code = match tokio::time::timeout(timeout, stream.next()).await {
            Err(_) => return Ok(WaitOutcome::DeadlineExceeded),
            Ok(Some(Ok(response))) => response.status_code,
            // Non-zero exits surface as an error carrying the code.
            Ok(Some(Err(BollardError::DockerContainerWaitError { code, .. }))) => code,
            Ok(Some(Err(e))) => return Err(SandboxError::WaitFailed(e.to_string())),
            Ok(None) => {
                return Err(SandboxError::WaitFailed(
                    "wait stream ended without a status".into(),
                ));
            }
        };

        let (oom_killed, limit) = self.exit_state().await;
        if oom_killed && let Some(limit) = limit {
            // The cgroup sat at its ceiling when the kernel killed it.
            let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
            usage.peak_memory_bytes = usage.peak_memory_bytes.max(limit);
        }
        let violations = if status_code == SIGSYS_EXIT {
            vec!["blocked system call (terminated by SIGSYS)".to_string()]
        } else {
            Vec::new()
        };

        debug!(id = %self.id, status_code, oom_killed, "container exited");
        Ok(WaitOutcome::Exited(ProcessExit {
            exit_code: i32::try_from(status_code).unwrap_or(-1),
            oom_killed,
            violations,
        }))
    }

    async fn stop(&mut self, grace: Duration) -> sandbox::Result<()> {
        let grace_secs = i32::try_from(grace.as_secs()).unwrap_or(i32::MAX);
        match self
            .docker
            .stop_container(
                &self.container_id,
                Some(StopContainerOptionsBuilder::new().t(grace_secs).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_benign_stop_error(&e) => Ok(()),
            Err(e) => Err(SandboxError::Runtime(format!("stop container: {e}"))),
        }
    }

    async fn logs(&self) -> sandbox::Result<SandboxLogs> {
        let options = LogsOptionsBuilder::new().stdout(true).stderr(true).build();
        let mut stream = Box::pin(self.docker.logs(&self.container_id, Some(options)));

        let mut logs = SandboxLogs::default();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => logs.stdout.extend_from_slice(&message),
                Ok(LogOutput::StdErr { message }) => logs.stderr.extend_from_slice(&message),
                Ok(_) => {}
                Err(e) => return Err(SandboxError::Runtime(format!("fetch logs: {e}"))),
            }
        }
        Ok(logs)
    }

    async fn stats(&self) -> sandbox::Result<ResourceStats> {
        if self.started {
            self.final_sample().await;
        }
        Ok(*self.usage.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
