//! Scripted in-process runtime.
//!
//! A [`FakeFactory`] asks a caller-supplied script what each sandbox should
//! do, then plays that outcome back through the regular [`Sandbox`] contract
//! using tokio timers, so paused-clock tests observe real deadline behavior.
//! It also counts created and live sandboxes to make leaks visible.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::SandboxSpec;
use crate::error::{Result, SandboxError};
use crate::factory::SandboxFactory;
use crate::sandbox::Sandbox;
use crate::types::{ProcessExit, ResourceStats, SandboxLogs, WaitOutcome};

/// What a fake sandbox does once started.
#[derive(Debug, Clone, Default)]
pub struct FakeOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall time until the payload exits on its own.
    pub runtime: Duration,
    /// Never exits on its own; only a deadline or stop ends it.
    pub hang: bool,
    pub peak_memory_mb: u32,
    pub cpu_time: Duration,
    pub oom_killed: bool,
    pub violations: Vec<String>,
    pub create_error: Option<String>,
    pub start_error: Option<String>,
    pub destroy_error: Option<String>,
}

impl FakeOutcome {
    pub fn exited(exit_code: i32, stdout: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            runtime: Duration::from_millis(50),
            peak_memory_mb: 8,
            cpu_time: Duration::from_millis(40),
            ..Self::default()
        }
    }

    /// Runs forever, having printed `partial_stdout` before stalling.
    pub fn hang(partial_stdout: impl Into<String>) -> Self {
        Self {
            stdout: partial_stdout.into(),
            hang: true,
            peak_memory_mb: 4,
            ..Self::default()
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_runtime(mut self, runtime: Duration) -> Self {
        self.runtime = runtime;
        self
    }
}

type Script = dyn Fn(&SandboxSpec) -> FakeOutcome + Send + Sync;

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    live: AtomicUsize,
    peak_live: AtomicUsize,
    stopped: AtomicUsize,
}

pub struct FakeFactory {
    script: Arc<Script>,
    counters: Arc<Counters>,
    specs: Mutex<Vec<SandboxSpec>>,
}

impl FakeFactory {
    pub fn new(script: impl Fn(&SandboxSpec) -> FakeOutcome + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            counters: Arc::new(Counters::default()),
            specs: Mutex::new(Vec::new()),
        }
    }

    /// Sandboxes successfully created over the factory's lifetime.
    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live sandboxes observed.
    pub fn peak_live(&self) -> usize {
        self.counters.peak_live.load(Ordering::SeqCst)
    }

    /// Number of explicit stop calls, i.e. forced terminations.
    pub fn stopped(&self) -> usize {
        self.counters.stopped.load(Ordering::SeqCst)
    }

    /// Every spec passed to `create`, in call order.
    pub fn specs(&self) -> Vec<SandboxSpec> {
        self.specs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SandboxFactory for FakeFactory {
    fn name(&self) -> &str {
        "fake"
    }

    async fn startup(&mut self) -> Result<()> {
        Ok(())
    }

    async fn create(&self, spec: SandboxSpec) -> Result<Box<dyn Sandbox>> {
        let outcome = (self.script)(&spec);
        self.specs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(spec.clone());
        if let Some(reason) = &outcome.create_error {
            return Err(SandboxError::CreationFailed(reason.clone()));
        }

        self.counters.created.fetch_add(1, Ordering::SeqCst);
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_live.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(FakeSandbox {
            id: spec.id.to_string(),
            outcome,
            state: FakeState::Created,
            counters: Arc::clone(&self.counters),
        }))
    }

    async fn destroy(&self, sandbox: Box<dyn Sandbox>) -> Result<()> {
        let sandbox = match (sandbox as Box<dyn std::any::Any>).downcast::<FakeSandbox>() {
            Ok(s) => *s,
            Err(_) => {
                return Err(SandboxError::Runtime(
                    "destroy called with a non-fake sandbox".into(),
                ));
            }
        };
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
        match sandbox.outcome.destroy_error {
            Some(reason) => Err(SandboxError::Runtime(reason)),
            None => Ok(()),
        }
    }

    fn active(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    async fn shutdown(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FakeState {
    Created,
    Running,
    Exited,
    Stopped,
}

pub struct FakeSandbox {
    id: String,
    outcome: FakeOutcome,
    state: FakeState,
    counters: Arc<Counters>,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&mut self) -> Result<()> {
        if let Some(reason) = &self.outcome.start_error {
            return Err(SandboxError::StartFailed(reason.clone()));
        }
        if self.state != FakeState::Created {
            return Err(SandboxError::StartFailed(format!(
                "sandbox {} already started",
                self.id
            )));
        }
        self.state = FakeState::Running;
        Ok(())
    }

    async fn wait(&mut self, timeout: Duration) -> Result<WaitOutcome> {
        if self.state != FakeState::Running {
            return Err(SandboxError::WaitFailed(format!(
                "sandbox {} is not running",
                self.id
            )));
        }
        if self.outcome.hang || self.outcome.runtime > timeout {
            tokio::time::sleep(timeout).await;
            return Ok(WaitOutcome::DeadlineExceeded);
        }
        tokio::time::sleep(self.outcome.runtime).await;
        self.state = FakeState::Exited;
        Ok(WaitOutcome::Exited(ProcessExit {
            exit_code: self.outcome.exit_code,
            oom_killed: self.outcome.oom_killed,
            violations: self.outcome.violations.clone(),
        }))
    }

    async fn stop(&mut self, _grace: Duration) -> Result<()> {
        if self.state == FakeState::Running {
            self.counters.stopped.fetch_add(1, Ordering::SeqCst);
        }
        self.state = FakeState::Stopped;
        Ok(())
    }

    async fn logs(&self) -> Result<SandboxLogs> {
        Ok(SandboxLogs {
            stdout: self.outcome.stdout.clone().into_bytes(),
            stderr: self.outcome.stderr.clone().into_bytes(),
        })
    }

    async fn stats(&self) -> Result<ResourceStats> {
        Ok(ResourceStats {
            peak_memory_bytes: u64::from(self.outcome.peak_memory_mb) * 1024 * 1024,
            cpu_time: self.outcome.cpu_time,
        })
    }
}
