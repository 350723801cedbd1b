//! Wires the Docker runtime, the in-memory store and the engine together.

use std::sync::Arc;
use std::time::Duration;

use exec_engine::{
    EngineConfig, MemoryStore, Orchestrator, OrchestratorConfig, QuotaTracker,
};
use sandbox::SandboxFactory;
use sandbox_docker::{DockerConfig, DockerFactory};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::RunnerResult;

pub struct Engine {
    orchestrator: Arc<Orchestrator>,
    factory: Arc<DockerFactory>,
    shutdown: CancellationToken,
    reset_worker: JoinHandle<()>,
}

fn docker_config(config: &EngineConfig) -> DockerConfig {
    DockerConfig {
        socket: config.docker.socket.clone(),
        network: config.docker.network.clone(),
        api_timeout_secs: config.docker.api_timeout_secs,
        ..DockerConfig::new(config.docker.workspace_dir.clone())
    }
}

impl Engine {
    /// Connect to Docker and assemble an orchestrator from `config`.
    pub async fn start(config: &EngineConfig) -> RunnerResult<Self> {
        let registry = Arc::new(config.registry()?);

        let mut factory = DockerFactory::new(docker_config(config));
        factory.startup().await?;
        let factory = Arc::new(factory);
        info!(backend = factory.name(), "sandbox runtime ready");

        let store = Arc::new(MemoryStore::new());
        let quotas = Arc::new(QuotaTracker::new(config.quotas.clone(), store.clone()));
        let shutdown = CancellationToken::new();
        let reset_worker = Arc::clone(&quotas).spawn_reset_worker(
            Duration::from_secs(config.engine.quota_reset_interval_secs.max(1)),
            shutdown.clone(),
        );

        let orchestrator = Arc::new(Orchestrator::new(
            registry,
            quotas,
            store,
            factory.clone(),
            OrchestratorConfig::from_settings(&config.engine, &config.docker),
        ));

        Ok(Self {
            orchestrator,
            factory,
            shutdown,
            reset_worker,
        })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Stop background work and remove whatever the runtime still holds.
    pub async fn shutdown(self) {
        self.orchestrator.shutdown();
        self.shutdown.cancel();
        if let Err(e) = self.reset_worker.await {
            warn!(error = %e, "quota reset worker failed");
        }

        // The orchestrator holds the other factory reference.
        drop(self.orchestrator);
        match Arc::into_inner(self.factory) {
            Some(mut factory) => factory.shutdown().await,
            None => warn!("sandbox factory still shared at shutdown, skipping cleanup"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn docker_settings_carry_over() {
        let config = exec_engine::config::parse(
            "docker:\n  socket: /run/docker.sock\n  workspace_dir: /srv/exec\n  network: sandbox-net\n  api_timeout_secs: 30\n",
        )
        .unwrap();
        let docker = docker_config(&config);
        assert_eq!(docker.socket, Some(PathBuf::from("/run/docker.sock")));
        assert_eq!(docker.workspace_dir, PathBuf::from("/srv/exec"));
        assert_eq!(docker.network.as_deref(), Some("sandbox-net"));
        assert_eq!(docker.api_timeout_secs, 30);
    }
}
