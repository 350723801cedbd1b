//! Grading: one derived run per required test case, reduced to a score.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::diff::{line_diff, similarity};
use crate::error::{EngineError, EngineResult};
use crate::model::{
    CodeExecution, ExecutionKind, ExecutionRequest, ExecutionStatus, TestCase, TestResult,
    TestStatus,
};
use crate::orchestrator::{Orchestrator, RunOptions};

/// Per-submission summary of its test results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradeReport {
    pub execution_id: Uuid,
    pub results: Vec<TestResult>,
    pub points_earned: u32,
    pub points_possible: u32,
    pub passed: usize,
    pub failed: usize,
    /// Earned over possible points; 1.0 when nothing is at stake.
    pub score: f64,
}

impl GradeReport {
    pub fn from_results(execution_id: Uuid, results: Vec<TestResult>) -> Self {
        let points_earned = results.iter().map(|r| r.points_earned).sum();
        let points_possible: u32 = results.iter().map(|r| r.points_possible).sum();
        let passed = results.iter().filter(|r| r.is_passed()).count();
        let score = if points_possible == 0 {
            1.0
        } else {
            f64::from(points_earned) / f64::from(points_possible)
        };
        Self {
            execution_id,
            failed: results.len() - passed,
            results,
            points_earned,
            points_possible,
            passed,
            score,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Setup, submitted code, test code and teardown, separated by blank lines.
/// Empty sections are left out.
pub fn derived_source(test_case: &TestCase, submitted: &str) -> String {
    [
        test_case.setup_code.as_str(),
        submitted,
        test_case.test_code.as_str(),
        test_case.teardown_code.as_str(),
    ]
    .into_iter()
    .filter(|section| !section.trim().is_empty())
    .collect::<Vec<_>>()
    .join("\n\n")
}

/// Required cases in ascending `order`, ties broken by creation time.
fn schedule(mut cases: Vec<TestCase>) -> Vec<TestCase> {
    cases.retain(|tc| tc.is_required);
    cases.sort_by(|a, b| {
        a.order
            .cmp(&b.order)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
    cases
}

pub struct TestRunner<'a> {
    orchestrator: &'a Orchestrator,
}

impl<'a> TestRunner<'a> {
    pub fn new(orchestrator: &'a Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Grade `submission` against the stored test cases of its exercise.
    pub async fn grade(&self, submission: &CodeExecution) -> EngineResult<GradeReport> {
        let exercise_id = submission.exercise_id.ok_or_else(|| {
            EngineError::Internal(format!("execution {} has no exercise", submission.id))
        })?;
        let cases = self
            .orchestrator
            .store()
            .test_cases_for_exercise(exercise_id)
            .await?;
        Ok(self.grade_against(submission, cases).await)
    }

    /// Grade `submission` against `cases`. A failing case never stops the
    /// ones after it.
    pub async fn grade_against(
        &self,
        submission: &CodeExecution,
        cases: Vec<TestCase>,
    ) -> GradeReport {
        let cases = schedule(cases);
        info!(execution_id = %submission.id, cases = cases.len(), "grading submission");

        let mut results = Vec::with_capacity(cases.len());
        for test_case in &cases {
            let result = self.run_case(submission, test_case).await;
            debug!(
                execution_id = %submission.id,
                test_case = %test_case.name,
                status = %result.status,
                "test case evaluated"
            );
            if let Err(e) = self.orchestrator.store().create_test_result(&result).await {
                warn!(test_case_id = %test_case.id, error = %e, "failed to store test result");
            }
            results.push(result);
        }

        let report = GradeReport::from_results(submission.id, results);
        info!(
            execution_id = %submission.id,
            passed = report.passed,
            failed = report.failed,
            points = report.points_earned,
            possible = report.points_possible,
            "grading finished"
        );
        report
    }

    async fn run_case(&self, submission: &CodeExecution, test_case: &TestCase) -> TestResult {
        let request = ExecutionRequest {
            user_id: submission.user_id.clone(),
            environment: submission.environment.clone(),
            source_code: derived_source(test_case, &submission.source_code),
            stdin: Some(test_case.input_data.clone()).filter(|s| !s.is_empty()),
            args: submission.args.clone(),
            kind: ExecutionKind::Test,
            exercise_id: submission.exercise_id,
            test_case_id: Some(test_case.id),
            session_id: submission.session_id.clone(),
        };
        let options = RunOptions {
            timeout: Some(test_case.timeout)
                .filter(|t| *t > 0)
                .map(|t| Duration::from_secs(u64::from(t))),
            memory_cap_mb: Some(test_case.max_memory).filter(|m| *m > 0),
        };

        match self.orchestrator.submit_derived(request).await {
            Ok(execution) => {
                let run = self.orchestrator.run(execution, options).await;
                evaluate(submission.id, test_case, &run)
            }
            Err(e) => {
                warn!(test_case_id = %test_case.id, error = %e, "test harness failed");
                let mut result = TestResult::new(submission.id, test_case, TestStatus::Error);
                result.error_message = e.to_string();
                result
            }
        }
    }
}

/// Turn a finished derived run into a result for `test_case`.
pub fn evaluate(execution_id: Uuid, test_case: &TestCase, run: &CodeExecution) -> TestResult {
    let mut result = TestResult::new(execution_id, test_case, TestStatus::Error);
    result.actual_output = run.stdout.clone();
    result.execution_time = run.execution_time;
    result.memory_used = run.memory_used;

    let expected = test_case.expected_output.trim();
    let actual = run.stdout.trim();

    result.status = match run.status {
        ExecutionStatus::Timeout => TestStatus::Timeout,
        ExecutionStatus::MemoryLimit => TestStatus::MemoryExceeded,
        ExecutionStatus::Cancelled => TestStatus::Skipped,
        ExecutionStatus::Completed if run.exit_code == Some(0) => {
            let stderr_ok = test_case.expected_error.trim().is_empty()
                || run.stderr.contains(test_case.expected_error.trim());
            if expected == actual && stderr_ok {
                TestStatus::Passed
            } else {
                if !stderr_ok {
                    result.error_message =
                        format!("expected error output containing {:?}", test_case.expected_error.trim());
                }
                TestStatus::Failed
            }
        }
        _ => {
            result.error_message = match run.exit_code {
                Some(code) if run.status == ExecutionStatus::Completed => {
                    format!("exited with code {code}")
                }
                _ => format!("execution ended as {}", run.status),
            };
            result.stack_trace = run.stderr.clone();
            TestStatus::Error
        }
    };

    if result.status == TestStatus::Passed {
        if let Some(limit) = test_case.max_execution_time
            && run.execution_time.is_some_and(|t| t > limit)
        {
            result.status = TestStatus::Failed;
            result.error_message = format!("took longer than {limit}s");
        } else if let Some(limit) = test_case.max_memory_usage
            && run.memory_used.is_some_and(|m| m > limit)
        {
            result.status = TestStatus::Failed;
            result.error_message = format!("used more than {limit} MB");
        }
    }

    match result.status {
        TestStatus::Passed => {
            result.points_earned = test_case.points;
            result.similarity_score = Some(1.0);
        }
        TestStatus::Failed => {
            result.output_diff = line_diff(expected, actual);
            result.similarity_score = Some(similarity(expected, actual));
        }
        _ => {}
    }
    result
}
