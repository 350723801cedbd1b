use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use exec_engine::model::{CodeExecution, ExecutionRequest};
use exec_engine::{ExecutionOutcome, Orchestrator, RunOptions};
use tracing::info;

use super::{SourceArgs, load_config, print_json};
use crate::engine::Engine;
use crate::error::{RunnerError, RunnerResult};

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// File fed to the program's standard input
    #[arg(long)]
    stdin: Option<PathBuf>,
    /// Deadline in seconds, replacing the environment default
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Arguments passed to the program
    #[arg(last = true)]
    args: Vec<String>,
}

/// Run a submitted execution. Ctrl-C cancels it, which still force-stops
/// and removes the sandbox before returning.
pub(super) async fn run_cancellable(
    orchestrator: &Arc<Orchestrator>,
    execution: CodeExecution,
    options: RunOptions,
) -> RunnerResult<CodeExecution> {
    let id = execution.id;
    let mut handle = {
        let orchestrator = Arc::clone(orchestrator);
        tokio::spawn(async move { orchestrator.run(execution, options).await })
    };

    let joined = tokio::select! {
        joined = &mut handle => joined,
        Ok(()) = tokio::signal::ctrl_c() => {
            info!(execution_id = %id, "interrupted, cancelling execution");
            orchestrator.cancel(id);
            handle.await
        }
    };
    joined.map_err(|e| RunnerError::Internal(format!("execution task failed: {e}")))
}

pub async fn run_run(config_path: &Path, args: RunArgs) -> RunnerResult<ExitCode> {
    let config = load_config(config_path).await?;
    let source_code = args.source.read_source().await?;
    let stdin = match &args.stdin {
        Some(path) => Some(tokio::fs::read_to_string(path).await?),
        None => None,
    };

    let engine = Engine::start(&config).await?;
    let result: RunnerResult<ExitCode> = async {
        let orchestrator = engine.orchestrator();
        let environment = args.source.environment(orchestrator.registry())?;
        let mut request = ExecutionRequest::new(args.source.user.clone(), environment, source_code);
        request.stdin = stdin;
        request.args = args.args.clone();

        let execution = orchestrator.submit(request).await?;
        let options = RunOptions {
            timeout: args.timeout_secs.map(Duration::from_secs),
            ..RunOptions::default()
        };
        let execution = run_cancellable(orchestrator, execution, options).await?;
        let success = execution.is_successful();
        print_json(&ExecutionOutcome {
            execution,
            grade: None,
        })?;
        Ok(if success {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    }
    .await;
    engine.shutdown().await;
    result
}
