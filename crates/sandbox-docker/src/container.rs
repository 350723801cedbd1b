use std::collections::HashMap;
use std::path::Path;

use bollard::models::{ContainerCreateBody, HostConfig, ResourcesUlimits};
use sandbox::{NetworkMode, SandboxSpec};

use crate::config::DockerConfig;
use crate::paths::STDIN_FILE;

const MIB: i64 = 1024 * 1024;

/// Label carried by every container this crate creates.
pub const MANAGED_LABEL: &str = "io.exec-engine.managed";

/// Final argv for the container. With stdin present the payload is exec'd
/// behind a redirect from the workspace stdin file; positional parameters
/// keep user arguments out of the shell string.
pub fn container_command(spec: &SandboxSpec) -> Vec<String> {
    if spec.stdin.is_none() {
        return spec.command.clone();
    }
    let redirect = format!(
        "exec \"$0\" \"$@\" < {}/{STDIN_FILE}",
        spec.workdir.trim_end_matches('/')
    );
    let mut cmd = vec!["sh".to_string(), "-c".to_string(), redirect];
    cmd.extend(spec.command.iter().cloned());
    cmd
}

/// Translate the runtime-neutral isolation spec into a Docker create body.
pub fn container_body(
    spec: &SandboxSpec,
    config: &DockerConfig,
    host_workspace: &Path,
) -> ContainerCreateBody {
    let limits = &spec.limits;
    let isolation = &spec.isolation;

    let scratch_opts = format!(
        "rw,{},nosuid,nodev,size={}m",
        if isolation.scratch_exec { "exec" } else { "noexec" },
        limits.scratch_mb
    );

    let network_disabled = isolation.network == NetworkMode::Disabled;
    let network_mode = if network_disabled {
        Some("none".to_string())
    } else {
        config.network.clone()
    };

    let cpu_secs = i64::from(limits.cpu_time_secs);
    let fsize = i64::from(limits.max_file_size_mb) * MIB;

    let mut labels: HashMap<String, String> = spec
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

    let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    let host_config = HostConfig {
        binds: Some(vec![format!(
            "{}:{}:ro",
            host_workspace.display(),
            spec.workdir
        )]),
        memory: Some(i64::from(limits.memory_mb) * MIB),
        // Equal to `memory`: no swap headroom beyond the cap.
        memory_swap: Some(i64::from(limits.memory_mb) * MIB),
        cpu_period: Some(i64::from(limits.cpu_period_us)),
        cpu_quota: Some(i64::from(limits.cpu_quota_us)),
        pids_limit: Some(i64::from(limits.pids)),
        ulimits: Some(vec![
            ResourcesUlimits {
                name: Some("cpu".to_string()),
                soft: Some(cpu_secs),
                hard: Some(cpu_secs),
            },
            ResourcesUlimits {
                name: Some("fsize".to_string()),
                soft: Some(fsize),
                hard: Some(fsize),
            },
        ]),
        readonly_rootfs: Some(isolation.read_only_rootfs),
        cap_drop: isolation
            .drop_all_capabilities
            .then(|| vec!["ALL".to_string()]),
        security_opt: isolation
            .no_new_privileges
            .then(|| vec!["no-new-privileges".to_string()]),
        tmpfs: Some(HashMap::from([("/tmp".to_string(), scratch_opts)])),
        network_mode,
        ..HostConfig::default()
    };

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        cmd: Some(container_command(spec)),
        working_dir: Some(spec.workdir.clone()),
        user: Some(isolation.user.clone()),
        env: (!env.is_empty()).then_some(env),
        labels: Some(labels),
        network_disabled: Some(network_disabled),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        host_config: Some(host_config),
        ..ContainerCreateBody::default()
    }
}
