mod config;
mod container;
mod factory;
mod paths;
mod sandbox;

pub use config::DockerConfig;
pub use container::{MANAGED_LABEL, container_body, container_command};
pub use factory::DockerFactory;
pub use sandbox::DockerSandbox;
