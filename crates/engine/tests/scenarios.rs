use std::sync::Arc;
use std::time::Duration;

use exec_engine::model::{
    EnvironmentId, ExecutionEnvironment, ExecutionKind, ExecutionRequest, ExecutionStatus,
    QuotaLimits, QuotaType, TestCase, TestStatus,
};
use exec_engine::{
    EngineError, EnvironmentRegistry, MemoryStore, Orchestrator, OrchestratorConfig,
    QuotaPolicy, QuotaTracker, ResultStore, RunOptions,
};
use sandbox::{SandboxFactory, SandboxSpec};
use sandbox::fake::{FakeFactory, FakeOutcome};
use uuid::Uuid;

const PYTHON: &str = r#"
name: Python 3.11
language: python
version: "3.11"
image: python:3.11-slim
interpreter_command: python3
file_extension: .py
default_timeout: 2
max_memory: 128
is_default: true
security:
  blocked_imports: [os, subprocess, socket]
  blocked_functions: [eval, exec]
"#;

struct Harness {
    orchestrator: Arc<Orchestrator>,
    factory: Arc<FakeFactory>,
    store: Arc<MemoryStore>,
}

fn python() -> EnvironmentId {
    EnvironmentId::new("python", "3.11")
}

fn request(user: &str, source: &str) -> ExecutionRequest {
    ExecutionRequest::new(user, python(), source)
}

fn daily(max_executions: u32) -> QuotaPolicy {
    QuotaPolicy {
        daily: Some(QuotaLimits {
            max_executions,
            max_execution_time: 3600,
            max_memory_usage: 1_000_000,
        }),
        ..QuotaPolicy::default()
    }
}

fn harness_with(
    quotas: QuotaPolicy,
    max_concurrent: usize,
    script: impl Fn(&SandboxSpec) -> FakeOutcome + Send + Sync + 'static,
) -> Harness {
    let env: ExecutionEnvironment = serde_yaml_ng::from_str(PYTHON).unwrap();
    let registry = Arc::new(EnvironmentRegistry::from_environments(vec![env]).unwrap());
    let store = Arc::new(MemoryStore::new());
    let tracker = Arc::new(QuotaTracker::new(quotas, store.clone()));
    let factory = Arc::new(FakeFactory::new(script));
    let config = OrchestratorConfig {
        max_concurrent,
        worker_node: "test-node".into(),
        ..OrchestratorConfig::default()
    };
    let orchestrator = Arc::new(Orchestrator::new(
        registry,
        tracker,
        store.clone(),
        factory.clone(),
        config,
    ));
    Harness {
        orchestrator,
        factory,
        store,
    }
}

fn harness(script: impl Fn(&SandboxSpec) -> FakeOutcome + Send + Sync + 'static) -> Harness {
    harness_with(daily(100), 4, script)
}

fn source_of(spec: &SandboxSpec) -> String {
    spec.file("main.py")
        .map(|f| String::from_utf8_lossy(&f.content).into_owned())
        .unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn hello_world_completes() {
    let h = harness(|_| FakeOutcome::exited(0, "Hello\n"));

    let outcome = h
        .orchestrator
        .execute(request("alice", "print('Hello')"))
        .await
        .unwrap();
    let exec = outcome.execution;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.stdout, "Hello\n");
    assert_eq!(exec.exit_code, Some(0));
    assert_eq!(exec.memory_used, Some(8));
    assert!(exec.execution_time.unwrap() > 0.0);
    assert_eq!(exec.worker_node.as_deref(), Some("test-node"));
    assert!(outcome.grade.is_none());

    let stored = h.store.get_execution(exec.id).await.unwrap();
    assert_eq!(stored.status, ExecutionStatus::Completed);
    assert!(stored.completed_at.is_some());
    assert_eq!(h.factory.active(), 0);

    let spec = h.factory.specs().pop().unwrap();
    assert_eq!(spec.command, vec!["python3", "main.py"]);
    assert_eq!(spec.limits.memory_mb, 128);
}

#[tokio::test(start_paused = true)]
async fn infinite_loop_times_out_and_is_reclaimed() {
    let h = harness(|_| FakeOutcome::hang("partial"));

    let started = tokio::time::Instant::now();
    let exec = h
        .orchestrator
        .execute(request("alice", "while True: pass"))
        .await
        .unwrap()
        .execution;

    assert_eq!(exec.status, ExecutionStatus::Timeout);
    assert_eq!(exec.stdout, "partial");
    assert!(exec.stderr.contains("timed out after 2s"), "got {:?}", exec.stderr);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(h.factory.stopped(), 1);
    assert_eq!(h.factory.active(), 0);
}

#[tokio::test]
async fn sixth_submission_exceeds_daily_quota() {
    let h = harness_with(daily(5), 4, |_| FakeOutcome::exited(0, ""));

    for _ in 0..5 {
        h.orchestrator.submit(request("bob", "print(1)")).await.unwrap();
    }
    let err = h
        .orchestrator
        .submit(request("bob", "print(1)"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::QuotaExceeded {
            quota_type: QuotaType::Daily
        }
    ));

    let quotas = h.orchestrator.quotas().quotas("bob").await.unwrap();
    let daily = quotas.iter().find(|q| q.quota_type == QuotaType::Daily).unwrap();
    assert_eq!(daily.executions_used, 5);
    assert!(daily.is_exceeded);

    assert_eq!(h.store.executions_for_user("bob").await.unwrap().len(), 5);
    assert_eq!(h.factory.created(), 0);

    // Other users are unaffected.
    h.orchestrator.submit(request("carol", "print(1)")).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn graded_submission_scores_by_output() {
    let h = harness(|spec| {
        if source_of(spec).contains("return 42") {
            FakeOutcome::exited(0, "42\n")
        } else {
            FakeOutcome::exited(0, "43\n")
        }
    });
    let exercise_id = Uuid::new_v4();
    let case = TestCase {
        exercise_id,
        name: "answer".into(),
        expected_output: "42".into(),
        test_code: "print(answer())".into(),
        points: 3,
        ..TestCase::default()
    };
    h.store.create_test_case(&case).await.unwrap();

    let submit = |source: &str| {
        let mut req = request("dana", source);
        req.kind = ExecutionKind::Exercise;
        req.exercise_id = Some(exercise_id);
        req
    };

    let right = h
        .orchestrator
        .execute(submit("def answer(): return 42"))
        .await
        .unwrap();
    let grade = right.grade.unwrap();
    assert_eq!(grade.results.len(), 1);
    let result = &grade.results[0];
    assert_eq!(result.status, TestStatus::Passed);
    assert_eq!(result.points_earned, result.points_possible);
    assert_eq!(result.points_earned, 3);

    let wrong = h
        .orchestrator
        .execute(submit("def answer(): return 43"))
        .await
        .unwrap();
    let grade = wrong.grade.unwrap();
    let result = &grade.results[0];
    assert_eq!(result.status, TestStatus::Failed);
    assert_eq!(result.points_earned, 0);
    assert_eq!(result.output_diff, "-42\n+43\n");

    let stored = h
        .store
        .test_results_for_execution(wrong.execution.id)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);

    // The derived run carries the test code and is recorded as a test run.
    let derived = h.factory.specs().into_iter().map(|s| source_of(&s)).collect::<Vec<_>>();
    assert!(derived.contains(&"def answer(): return 42\n\nprint(answer())".to_string()));
    let runs = h.store.executions_for_user("dana").await.unwrap();
    assert_eq!(runs.iter().filter(|e| e.kind == ExecutionKind::Test).count(), 2);

    // Derived runs do not count against the execution quota.
    let quotas = h.orchestrator.quotas().quotas("dana").await.unwrap();
    assert_eq!(quotas[0].executions_used, 2);
}

#[tokio::test(start_paused = true)]
async fn failing_case_does_not_stop_the_rest() {
    let h = harness(|spec| {
        if source_of(spec).contains("crash") {
            FakeOutcome::exited(1, "").with_stderr("Traceback: boom")
        } else {
            FakeOutcome::exited(0, "ok\n")
        }
    });
    let exercise_id = Uuid::new_v4();
    for (order, test_code) in [(1, "crash()"), (2, "check()")] {
        let case = TestCase {
            exercise_id,
            order,
            expected_output: "ok".into(),
            test_code: test_code.into(),
            ..TestCase::default()
        };
        h.store.create_test_case(&case).await.unwrap();
    }

    let mut req = request("erin", "def check(): print('ok')");
    req.kind = ExecutionKind::Exercise;
    req.exercise_id = Some(exercise_id);
    let grade = h.orchestrator.execute(req).await.unwrap().grade.unwrap();

    let statuses: Vec<TestStatus> = grade.results.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![TestStatus::Error, TestStatus::Passed]);
    assert_eq!(grade.results[0].stack_trace, "Traceback: boom");
    assert_eq!(grade.points_earned, 1);
    assert_eq!(grade.points_possible, 2);
}

#[tokio::test]
async fn blocked_import_never_reaches_a_sandbox() {
    let h = harness(|_| FakeOutcome::exited(0, ""));

    let exec = h
        .orchestrator
        .execute(request("frank", "import os\nos.system('ls')"))
        .await
        .unwrap()
        .execution;

    assert_eq!(exec.status, ExecutionStatus::SecurityViolation);
    assert_eq!(exec.security_violations, vec!["blocked import: os"]);
    assert_eq!(h.factory.created(), 0);
    assert!(h.factory.specs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn runtime_violation_is_recorded() {
    let h = harness(|_| FakeOutcome {
        violations: vec!["blocked syscall".into()],
        ..FakeOutcome::exited(159, "")
    });

    let exec = h
        .orchestrator
        .execute(request("gina", "print(1)"))
        .await
        .unwrap()
        .execution;
    assert_eq!(exec.status, ExecutionStatus::SecurityViolation);
    assert_eq!(exec.security_violations, vec!["blocked syscall"]);
    assert_eq!(h.factory.active(), 0);
}

#[tokio::test(start_paused = true)]
async fn oom_kill_maps_to_memory_limit() {
    let h = harness(|_| FakeOutcome {
        oom_killed: true,
        peak_memory_mb: 128,
        ..FakeOutcome::exited(137, "")
    });

    let exec = h
        .orchestrator
        .execute(request("hank", "x = 'a' * 10**10"))
        .await
        .unwrap()
        .execution;
    assert_eq!(exec.status, ExecutionStatus::MemoryLimit);
    assert_eq!(exec.memory_used, Some(128));
    assert!(exec.stderr.contains("memory limit of 128 MB exceeded"));
}

#[tokio::test]
async fn launch_failure_is_a_failed_execution() {
    let h = harness(|_| FakeOutcome {
        create_error: Some("image not found".into()),
        ..FakeOutcome::default()
    });

    let exec = h
        .orchestrator
        .execute(request("ivan", "print(1)"))
        .await
        .unwrap()
        .execution;
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert!(exec.stderr.contains("sandbox launch failed"), "got {:?}", exec.stderr);
    assert!(exec.stderr.contains("image not found"));
    assert_eq!(h.factory.active(), 0);

    // Usage is still charged for the failed run.
    let quotas = h.orchestrator.quotas().quotas("ivan").await.unwrap();
    assert_eq!(quotas[0].executions_used, 1);
}

#[tokio::test]
async fn unknown_environment_is_rejected_up_front() {
    let h = harness(|_| FakeOutcome::exited(0, ""));

    let req = ExecutionRequest::new("judy", EnvironmentId::new("cobol", "85"), "DISPLAY 'HI'");
    let err = h.orchestrator.submit(req).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidEnvironment(_)));
    assert!(h.store.executions_for_user("judy").await.unwrap().is_empty());
    let quotas = h.orchestrator.quotas().quotas("judy").await.unwrap();
    assert_eq!(quotas[0].executions_used, 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_a_running_execution() {
    let h = harness_with(daily(100), 4, |_| FakeOutcome::hang(""));
    let exec = h.orchestrator.submit(request("kim", "while True: pass")).await.unwrap();
    let id = exec.id;

    let orchestrator = Arc::clone(&h.orchestrator);
    let options = RunOptions {
        timeout: Some(Duration::from_secs(30)),
        ..RunOptions::default()
    };
    let run = tokio::spawn(async move { orchestrator.run(exec, options).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.orchestrator.cancel(id));
    let exec = run.await.unwrap();

    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert_eq!(h.factory.stopped(), 1);
    assert_eq!(h.factory.active(), 0);
    assert!(!h.orchestrator.cancel(id));
}

#[tokio::test(start_paused = true)]
async fn cancel_while_queued_skips_the_sandbox() {
    let h = harness_with(daily(100), 1, |_| FakeOutcome::hang(""));
    let first = h.orchestrator.submit(request("lee", "while True: pass")).await.unwrap();
    let second = h.orchestrator.submit(request("lee", "print(2)")).await.unwrap();
    let second_id = second.id;

    let o1 = Arc::clone(&h.orchestrator);
    let first_run = tokio::spawn(async move { o1.run(first, RunOptions::default()).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let o2 = Arc::clone(&h.orchestrator);
    let second_run = tokio::spawn(async move { o2.run(second, RunOptions::default()).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(h.orchestrator.cancel(second_id));
    let second = second_run.await.unwrap();
    assert_eq!(second.status, ExecutionStatus::Cancelled);
    assert!(second.started_at.is_none());

    let first = first_run.await.unwrap();
    assert_eq!(first.status, ExecutionStatus::Timeout);
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_work_and_forgets_every_execution() {
    let h = harness(|_| FakeOutcome::hang(""));
    let idle = h.orchestrator.submit(request("pat", "print(1)")).await.unwrap();
    let abandoned = h.orchestrator.submit(request("pat", "print(2)")).await.unwrap();
    let running = h.orchestrator.submit(request("pat", "while True: pass")).await.unwrap();
    assert_eq!(h.orchestrator.tracked_executions(), 3);

    assert!(h.orchestrator.discard(abandoned.id));
    assert!(!h.orchestrator.discard(abandoned.id));
    assert_eq!(h.orchestrator.tracked_executions(), 2);

    let orchestrator = Arc::clone(&h.orchestrator);
    let options = RunOptions {
        timeout: Some(Duration::from_secs(30)),
        ..RunOptions::default()
    };
    let run = tokio::spawn(async move { orchestrator.run(running, options).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.orchestrator.shutdown();
    assert_eq!(h.orchestrator.tracked_executions(), 0);
    let running = run.await.unwrap();
    assert_eq!(running.status, ExecutionStatus::Cancelled);
    assert_eq!(h.factory.active(), 0);

    // Too late to start once the orchestrator is closing.
    let idle = h.orchestrator.run(idle, RunOptions::default()).await;
    assert_eq!(idle.status, ExecutionStatus::Cancelled);
    assert_eq!(h.factory.created(), 1);
    assert_eq!(h.orchestrator.tracked_executions(), 0);
}

#[tokio::test(start_paused = true)]
async fn finished_runs_stop_being_tracked() {
    let h = harness(|_| FakeOutcome::exited(0, ""));
    for i in 0..5 {
        h.orchestrator
            .execute(request("quinn", &format!("print({i})")))
            .await
            .unwrap();
    }
    assert_eq!(h.orchestrator.tracked_executions(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrency_ceiling_queues_excess_runs() {
    let h = harness_with(daily(100), 2, |_| {
        FakeOutcome::exited(0, "done\n").with_runtime(Duration::from_millis(500))
    });

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..6 {
        let exec = h
            .orchestrator
            .submit(request("mia", &format!("print({i})")))
            .await
            .unwrap();
        let orchestrator = Arc::clone(&h.orchestrator);
        tasks.spawn(async move { orchestrator.run(exec, RunOptions::default()).await });
    }

    let mut completed = 0;
    while let Some(joined) = tasks.join_next().await {
        assert_eq!(joined.unwrap().status, ExecutionStatus::Completed);
        completed += 1;
    }
    assert_eq!(completed, 6);
    assert_eq!(h.factory.created(), 6);
    assert!(h.factory.peak_live() <= 2, "peak {}", h.factory.peak_live());
    assert_eq!(h.factory.active(), 0);
}

#[tokio::test(start_paused = true)]
async fn mixed_outcomes_leave_no_sandbox_behind() {
    let h = harness_with(daily(100), 2, |spec| {
        let source = source_of(spec);
        if source.contains("loop") || source.contains("wait") {
            FakeOutcome::hang("")
        } else if source.contains("boom") {
            FakeOutcome::exited(1, "").with_stderr("boom")
        } else if source.contains("huge") {
            FakeOutcome {
                oom_killed: true,
                ..FakeOutcome::exited(137, "")
            }
        } else if source.contains("missing") {
            FakeOutcome {
                create_error: Some("image not found".into()),
                ..FakeOutcome::default()
            }
        } else {
            FakeOutcome::exited(0, "ok\n")
        }
    });

    let cases = [
        ("print('ok')", ExecutionStatus::Completed),
        ("raise SystemExit('boom')", ExecutionStatus::Failed),
        ("# loop\nwhile True: pass", ExecutionStatus::Timeout),
        ("# wait\ninput()", ExecutionStatus::Cancelled),
        ("x = 'huge' * 10**10", ExecutionStatus::MemoryLimit),
        ("print('missing')", ExecutionStatus::Failed),
        ("print('ok again')", ExecutionStatus::Completed),
    ];

    let mut tasks = tokio::task::JoinSet::new();
    let mut expected = std::collections::HashMap::new();
    let mut cancelled = None;
    for (source, status) in cases {
        let exec = h.orchestrator.submit(request("olga", source)).await.unwrap();
        expected.insert(exec.id, status);
        let options = if status == ExecutionStatus::Cancelled {
            cancelled = Some(exec.id);
            RunOptions {
                timeout: Some(Duration::from_secs(30)),
                ..RunOptions::default()
            }
        } else {
            RunOptions::default()
        };
        let orchestrator = Arc::clone(&h.orchestrator);
        tasks.spawn(async move { orchestrator.run(exec, options).await });
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.orchestrator.cancel(cancelled.unwrap()));

    while let Some(joined) = tasks.join_next().await {
        let exec = joined.unwrap();
        assert_eq!(exec.status, expected[&exec.id], "source {:?}", exec.source_code);
        assert!(exec.completed_at.is_some());
    }
    assert_eq!(h.orchestrator.active_sandboxes(), 0);
    assert_eq!(h.factory.active(), 0);
    assert!(h.factory.peak_live() <= 2, "peak {}", h.factory.peak_live());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_overshoot() {
    let h = harness_with(daily(10), 4, |_| FakeOutcome::exited(0, ""));

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..40 {
        let orchestrator = Arc::clone(&h.orchestrator);
        tasks.spawn(async move { orchestrator.submit(request("nora", "print(1)")).await.is_ok() });
    }
    let mut admitted = 0;
    while let Some(joined) = tasks.join_next().await {
        if joined.unwrap() {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 10);
    let quotas = h.orchestrator.quotas().quotas("nora").await.unwrap();
    assert_eq!(quotas[0].executions_used, 10);
    assert_eq!(h.store.executions_for_user("nora").await.unwrap().len(), 10);
}

#[tokio::test(start_paused = true)]
async fn output_is_truncated_to_the_cap() {
    let env: ExecutionEnvironment = serde_yaml_ng::from_str(PYTHON).unwrap();
    let registry = Arc::new(EnvironmentRegistry::from_environments(vec![env]).unwrap());
    let store = Arc::new(MemoryStore::new());
    let tracker = Arc::new(QuotaTracker::new(QuotaPolicy::default(), store.clone()));
    let factory = Arc::new(FakeFactory::new(|_| FakeOutcome::exited(0, "x".repeat(100))));
    let orchestrator = Orchestrator::new(
        registry,
        tracker,
        store,
        factory,
        OrchestratorConfig {
            max_output_bytes: 10,
            ..OrchestratorConfig::default()
        },
    );

    let exec = orchestrator
        .execute(request("omar", "print('x' * 100)"))
        .await
        .unwrap()
        .execution;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert!(exec.stdout.starts_with("xxxxxxxxxx\n"));
    assert!(exec.stdout.ends_with("[output truncated]"));
}
