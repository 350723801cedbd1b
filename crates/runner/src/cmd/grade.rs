use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Args;
use exec_engine::model::{ExecutionKind, ExecutionRequest, TestCase};
use exec_engine::{RunOptions, TestRunner};
use uuid::Uuid;

use super::run::run_cancellable;
use super::{SourceArgs, load_config, print_json};
use crate::engine::Engine;
use crate::error::{RunnerError, RunnerResult};

#[derive(Args)]
pub struct GradeArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// YAML file holding a list of test cases
    #[arg(long, short)]
    tests: PathBuf,
}

/// Parse test cases and bind them to `exercise_id`.
fn parse_test_cases(content: &str, exercise_id: Uuid) -> RunnerResult<Vec<TestCase>> {
    let mut cases: Vec<TestCase> = serde_yaml_ng::from_str(content)
        .map_err(|e| RunnerError::Config(format!("test cases: {e}")))?;
    for case in &mut cases {
        case.exercise_id = exercise_id;
    }
    Ok(cases)
}

pub async fn run_grade(config_path: &Path, args: GradeArgs) -> RunnerResult<ExitCode> {
    let config = load_config(config_path).await?;
    let source_code = args.source.read_source().await?;
    let exercise_id = Uuid::new_v4();
    let cases = parse_test_cases(&tokio::fs::read_to_string(&args.tests).await?, exercise_id)?;

    let engine = Engine::start(&config).await?;
    let result: RunnerResult<ExitCode> = async {
        let orchestrator = engine.orchestrator();
        let environment = args.source.environment(orchestrator.registry())?;
        let mut request = ExecutionRequest::new(args.source.user.clone(), environment, source_code);
        request.kind = ExecutionKind::Exercise;
        request.exercise_id = Some(exercise_id);

        let execution = orchestrator.submit(request).await?;
        let execution = run_cancellable(orchestrator, execution, RunOptions::default()).await?;
        let report = TestRunner::new(orchestrator).grade_against(&execution, cases).await;
        print_json(&report)?;
        Ok(if report.all_passed() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    }
    .await;
    engine.shutdown().await;
    result
}
