use std::path::Path;

use serde::Serialize;

use super::{load_config, print_json};
use crate::error::RunnerResult;

#[derive(Serialize)]
struct EnvironmentSummary {
    key: String,
    name: String,
    image: String,
    status: String,
    is_default: bool,
    default_timeout: u32,
    max_memory: u32,
}

pub async fn run_environments(config_path: &Path) -> RunnerResult<()> {
    let config = load_config(config_path).await?;
    let registry = config.registry()?;
    let summaries: Vec<EnvironmentSummary> = registry
        .list()
        .iter()
        .map(|env| EnvironmentSummary {
            key: env.key().to_string(),
            name: env.name.clone(),
            image: env.image.clone(),
            status: format!("{:?}", env.status).to_lowercase(),
            is_default: env.is_default,
            default_timeout: env.default_timeout,
            max_memory: env.max_memory,
        })
        .collect();
    print_json(&summaries)
}
