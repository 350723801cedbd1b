use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::query_parameters::{CreateContainerOptionsBuilder, RemoveContainerOptionsBuilder};
use bollard::{API_DEFAULT_VERSION, Docker};
use sandbox::{Sandbox, SandboxError, SandboxFactory, SandboxSpec};
use tracing::{info, warn};

use crate::config::DockerConfig;
use crate::container::container_body;
use crate::paths::{FactoryPaths, STDIN_FILE};
use crate::sandbox::DockerSandbox;

/// Host bookkeeping for one created sandbox.
struct Allocation {
    container_id: String,
    workspace: PathBuf,
}

pub struct DockerFactory {
    config: DockerConfig,
    paths: FactoryPaths,
    docker: Option<Docker>,
    allocations: Mutex<HashMap<String, Allocation>>,
}

impl DockerFactory {
    /// Create a new factory without touching the daemon.
    /// Call `startup()` to connect before use.
    pub fn new(config: DockerConfig) -> Self {
        let paths = FactoryPaths::new(config.workspace_dir.clone());
        Self {
            config,
            paths,
            docker: None,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    fn docker(&self) -> sandbox::Result<&Docker> {
        self.docker
            .as_ref()
            .ok_or_else(|| SandboxError::BackendNotAvailable("factory not started".into()))
    }

    fn connect(&self) -> sandbox::Result<Docker> {
        let connected = match &self.config.socket {
            Some(socket) => Docker::connect_with_socket(
                &socket.to_string_lossy(),
                self.config.api_timeout_secs,
                API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_local_defaults(),
        };
        connected.map_err(|e| SandboxError::BackendNotAvailable(format!("docker connect: {e}")))
    }

    fn allocations(&self) -> std::sync::MutexGuard<'_, HashMap<String, Allocation>> {
        self.allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Write the sandbox's files into a fresh host directory readable by the
/// unprivileged container user.
async fn populate_workspace(workspace: &Path, spec: &SandboxSpec) -> sandbox::Result<()> {
    tokio::fs::create_dir_all(workspace).await?;
    tokio::fs::set_permissions(workspace, std::fs::Permissions::from_mode(0o755)).await?;

    for file in &spec.files {
        if file.name.contains('/') || file.name == ".." || file.name.is_empty() {
            return Err(SandboxError::InvalidConfig(format!(
                "file name must be a plain name: {:?}",
                file.name
            )));
        }
        let path = workspace.join(&file.name);
        let mode = if file.executable { 0o755 } else { 0o644 };
        tokio::fs::write(&path, &file.content).await?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).await?;
    }

    if let Some(stdin) = &spec.stdin {
        let path = workspace.join(STDIN_FILE);
        tokio::fs::write(&path, stdin.as_bytes()).await?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).await?;
    }
    Ok(())
}

async fn remove_workspace(id: &str, workspace: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(workspace).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(id = %id, error = %e, "failed to delete workspace");
    }
}

async fn remove_container(docker: &Docker, container_id: &str) -> sandbox::Result<()> {
    match docker
        .remove_container(
            container_id,
            Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
        )
        .await
    {
        Ok(()) => Ok(()),
        Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
        Err(e) => Err(SandboxError::Runtime(format!("remove container: {e}"))),
    }
}

#[async_trait]
impl SandboxFactory for DockerFactory {
    fn name(&self) -> &str {
        "docker"
    }

    async fn startup(&mut self) -> sandbox::Result<()> {
        if self.docker.is_some() {
            return Err(SandboxError::CreationFailed("factory already started".into()));
        }

        let docker = self.connect()?;
        let version = docker
            .version()
            .await
            .map_err(|e| SandboxError::BackendNotAvailable(format!("docker version: {e}")))?;
        tokio::fs::create_dir_all(self.paths.base()).await?;

        info!(
            workspace_dir = %self.paths.base().display(),
            server_version = version.version.as_deref().unwrap_or("unknown"),
            "docker factory started"
        );
        self.docker = Some(docker);
        Ok(())
    }

    async fn create(&self, spec: SandboxSpec) -> sandbox::Result<Box<dyn Sandbox>> {
        let docker = self.docker()?;
        let id = spec.id.to_string();
        let workspace = self.paths.workspace(&id);

        if let Err(e) = populate_workspace(&workspace, &spec).await {
            remove_workspace(&id, &workspace).await;
            return Err(SandboxError::CreationFailed(format!("prepare workspace: {e}")));
        }

        let body = container_body(&spec, &self.config, &workspace);
        let name = format!("exec-{id}");
        let created = match docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&name).build()),
                body,
            )
            .await
        {
            Ok(created) => created,
            Err(e) => {
                remove_workspace(&id, &workspace).await;
                return Err(SandboxError::CreationFailed(format!("create container: {e}")));
            }
        };
        for warning in &created.warnings {
            warn!(id = %id, warning = %warning, "docker create warning");
        }

        self.allocations().insert(
            id.clone(),
            Allocation {
                container_id: created.id.clone(),
                workspace: workspace.clone(),
            },
        );
        info!(id = %id, container_id = %created.id, image = %spec.image, "sandbox created");

        Ok(Box::new(DockerSandbox::new(
            docker.clone(),
            id,
            created.id,
            workspace,
        )))
    }

    async fn destroy(&self, sandbox: Box<dyn Sandbox>) -> sandbox::Result<()> {
        let mut sandbox = match (sandbox as Box<dyn std::any::Any>).downcast::<DockerSandbox>() {
            Ok(s) => *s,
            Err(_) => {
                return Err(SandboxError::Runtime(
                    "destroy called with non-docker sandbox".into(),
                ));
            }
        };
        sandbox.abort_sampler();

        // Bookkeeping is released first so a daemon error cannot leave the
        // allocation counted forever.
        self.allocations().remove(&sandbox.id);

        let removed = match self.docker() {
            Ok(docker) => remove_container(docker, &sandbox.container_id).await,
            Err(e) => Err(e),
        };
        remove_workspace(&sandbox.id, &sandbox.workspace).await;

        match &removed {
            Ok(()) => info!(id = %sandbox.id, "sandbox destroyed"),
            Err(e) => warn!(id = %sandbox.id, error = %e, "sandbox removal failed"),
        }
        removed
    }

    fn active(&self) -> usize {
        self.allocations().len()
    }

    async fn shutdown(&mut self) {
        let leftovers: Vec<(String, Allocation)> = self.allocations().drain().collect();
        if let Some(docker) = &self.docker {
            for (id, allocation) in leftovers {
                warn!(id = %id, "removing leftover sandbox on shutdown");
                if let Err(e) = remove_container(docker, &allocation.container_id).await {
                    warn!(id = %id, error = %e, "failed to remove leftover container");
                }
                remove_workspace(&id, &allocation.workspace).await;
            }
        }
        self.docker = None;
        info!("factory shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use sandbox::{IsolationPolicy, ResourceLimits, SandboxFile};

    use super::*;

    fn spec(files: Vec<SandboxFile>, stdin: Option<&str>) -> SandboxSpec {
        SandboxSpec {
            id: uuid::Uuid::new_v4(),
            image: "python:3.11-slim".into(),
            command: vec!["python3".into(), "main.py".into()],
            workdir: "/workspace".into(),
            files,
            stdin: stdin.map(String::from),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            limits: ResourceLimits {
                memory_mb: 64,
                cpu_time_secs: 5,
                cpu_quota_us: 5_000,
                cpu_period_us: 100_000,
                scratch_mb: 5,
                max_file_size_mb: 5,
                pids: 32,
            },
            isolation: IsolationPolicy::default(),
        }
    }

    #[tokio::test]
    async fn populate_workspace_writes_files_and_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("ws");
        let spec = spec(
            vec![SandboxFile {
                name: "main.py".into(),
                content: b"print(input())".to_vec(),
                executable: false,
            }],
            Some("42\n"),
        );

        populate_workspace(&workspace, &spec).await.unwrap();

        let source = tokio::fs::read(workspace.join("main.py")).await.unwrap();
        assert_eq!(source, b"print(input())");
        let stdin = tokio::fs::read_to_string(workspace.join(STDIN_FILE)).await.unwrap();
        assert_eq!(stdin, "42\n");
        let mode = tokio::fs::metadata(workspace.join("main.py"))
            .await
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[tokio::test]
    async fn populate_workspace_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(
            vec![SandboxFile {
                name: "../escape.py".into(),
                content: Vec::new(),
                executable: false,
            }],
            None,
        );
        let err = populate_workspace(&dir.path().join("ws"), &spec)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("plain name"), "got: {err}");
    }

    #[tokio::test]
    async fn create_before_startup_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DockerFactory::new(DockerConfig::new(dir.path().to_path_buf()));
        let err = factory.create(spec(Vec::new(), None)).await.err().unwrap();
        assert!(matches!(err, SandboxError::BackendNotAvailable(_)));
        assert_eq!(factory.active(), 0);
    }
}
