mod environments;
mod grade;
mod run;

pub use environments::run_environments;
pub use grade::{GradeArgs, run_grade};
pub use run::{RunArgs, run_run};

use std::path::{Path, PathBuf};

use clap::Args;
use exec_engine::EngineConfig;
use exec_engine::model::EnvironmentId;
use exec_engine::registry::EnvironmentRegistry;
use serde::Serialize;

use crate::error::{RunnerError, RunnerResult};

/// Selects the environment and identity a source file runs under.
#[derive(Args)]
pub struct SourceArgs {
    /// Source file to execute
    source: PathBuf,
    /// Language of the source; defaults to the file extension's environment
    #[arg(long, short)]
    language: Option<String>,
    /// Environment version; the language's default when omitted
    #[arg(long)]
    version: Option<String>,
    /// User the run is charged to
    #[arg(long, env = "RUNNER_USER", default_value = "local")]
    user: String,
}

impl SourceArgs {
    async fn read_source(&self) -> RunnerResult<String> {
        Ok(tokio::fs::read_to_string(&self.source).await?)
    }

    /// Pick the environment: explicit language/version, else the default
    /// of the language, else the environment owning the file extension.
    fn environment(&self, registry: &EnvironmentRegistry) -> RunnerResult<EnvironmentId> {
        match (&self.language, &self.version) {
            (Some(language), Some(version)) => Ok(EnvironmentId::new(language, version)),
            (Some(language), None) => Ok(registry.default_for(language)?.environment.key()),
            (None, _) => {
                let extension = self
                    .source
                    .extension()
                    .and_then(|e| e.to_str())
                    .ok_or_else(|| {
                        RunnerError::Config(format!(
                            "{} has no extension, pass --language",
                            self.source.display()
                        ))
                    })?;
                let candidates: Vec<_> = registry
                    .list()
                    .into_iter()
                    .filter(|env| {
                        env.is_active() && env.file_extension.trim_start_matches('.') == extension
                    })
                    .collect();
                let chosen = candidates
                    .iter()
                    .find(|env| env.is_default)
                    .or_else(|| candidates.first())
                    .ok_or_else(|| {
                        RunnerError::Config(format!("no environment runs .{extension} files"))
                    })?;
                Ok(chosen.key())
            }
        }
    }
}

async fn load_config(path: &Path) -> RunnerResult<EngineConfig> {
    Ok(exec_engine::config::load(path).await?)
}

fn print_json<T: Serialize>(value: &T) -> RunnerResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
