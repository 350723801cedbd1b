use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Unix socket of the Docker daemon. `None` uses the local defaults
    /// (`DOCKER_HOST` or `/var/run/docker.sock`).
    pub socket: Option<PathBuf>,
    /// Host directory holding one read-only source directory per sandbox.
    pub workspace_dir: PathBuf,
    /// Network joined by sandboxes whose spec enables networking.
    /// `None` uses the daemon's default bridge.
    pub network: Option<String>,
    /// Seconds the client waits on a single daemon API call.
    pub api_timeout_secs: u64,
}

impl DockerConfig {
    pub fn new(workspace_dir: PathBuf) -> Self {
        Self {
            socket: None,
            workspace_dir,
            network: None,
            api_timeout_secs: 120,
        }
    }
}
