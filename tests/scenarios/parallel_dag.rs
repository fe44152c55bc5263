//! Test: DAG scheduling - independent steps run together, fail-fast holds

use crate::helpers::*;
use deploy_pipeline::core::ExecutionStatus;
use deploy_pipeline::execution::SchedulingStrategy;
use std::time::Duration;

const FAN_OUT_YAML: &str = r#"
name: "ai-app-checks"
image:
  repository: "gcr.io/{{ project_id }}/ai-app"
steps:
  - id: "fetch"
    action: fetch_source
    repository: "https://github.com/acme/ai-app.git"
  - id: "lint"
    wait_for: ["fetch"]
    action: run
    program: "ruff"
    args: ["check", "."]
    dir: "source"
  - id: "test"
    wait_for: ["fetch"]
    action: run
    program: "pytest"
    dir: "source"
  - id: "build"
    wait_for: ["fetch"]
    action: build_image
  - id: "push"
    wait_for: ["lint", "test", "build"]
    action: push_image
"#;

#[tokio::test]
async fn test_independent_steps_run_concurrently() {
    let workspace = Workspace::with_build_file(SERVICE_BUILD_FILE);
    let mut pipeline = prepared_pipeline(FAN_OUT_YAML, &workspace, 1);
    let runner = MockRunner::new()
        .delay_on("ruff", Duration::from_millis(200))
        .delay_on("pytest", Duration::from_millis(200))
        .delay_on("docker build", Duration::from_millis(200));
    let log = runner.log();

    let result = run_pipeline_with_strategy(&mut pipeline, runner, SchedulingStrategy::Parallel).await;

    assert_pipeline_completed(&result);
    assert_eq!(log.peak_concurrency(), 3);

    let started = result.started_steps();
    assert_eq!(started.first().map(String::as_str), Some("fetch"));
    assert_eq!(started.last().map(String::as_str), Some("push"));
}

#[tokio::test]
async fn test_limited_parallelism_caps_concurrency() {
    let workspace = Workspace::with_build_file(SERVICE_BUILD_FILE);
    let mut pipeline = prepared_pipeline(FAN_OUT_YAML, &workspace, 1);
    let runner = MockRunner::new()
        .delay_on("ruff", Duration::from_millis(100))
        .delay_on("pytest", Duration::from_millis(100))
        .delay_on("docker build", Duration::from_millis(100));
    let log = runner.log();

    let result = run_pipeline_with_strategy(
        &mut pipeline,
        runner,
        SchedulingStrategy::LimitedParallel(2),
    )
    .await;

    assert_pipeline_completed(&result);
    assert_eq!(log.peak_concurrency(), 2);
}

#[tokio::test]
async fn test_sequential_runs_one_step_at_a_time() {
    let workspace = Workspace::with_build_file(SERVICE_BUILD_FILE);
    let mut pipeline = prepared_pipeline(FAN_OUT_YAML, &workspace, 1);
    let runner = MockRunner::new().delay_on("pytest", Duration::from_millis(50));
    let log = runner.log();

    let result = run_pipeline_with_mock(&mut pipeline, runner).await;

    assert_pipeline_completed(&result);
    assert_eq!(log.peak_concurrency(), 1);
    assert_eq!(
        result.started_steps(),
        vec!["fetch", "lint", "test", "build", "push"]
    );
}

#[tokio::test]
async fn test_failure_cancels_running_siblings() {
    let workspace = Workspace::with_build_file(SERVICE_BUILD_FILE);
    let mut pipeline = prepared_pipeline(FAN_OUT_YAML, &workspace, 1);
    let runner = MockRunner::new()
        .delay_on("ruff", Duration::from_secs(10))
        .delay_on("pytest", Duration::from_millis(50))
        .fail_on("pytest", 1, "FAILED tests/test_app.py::test_health - AssertionError");
    let log = runner.log();

    let result = run_pipeline_with_strategy(&mut pipeline, runner, SchedulingStrategy::Parallel).await;

    assert_pipeline_failed_at(&result, "test", 1);
    assert_eq!(result.pipeline.state.status, ExecutionStatus::Failed);
    assert_step_failed(&result, "test", "AssertionError");
    assert_step_cancelled(&result, "lint");
    assert_step_skipped(&result, "push");
    assert!(!log.was_called("docker push"));
    assert!(result.duration < Duration::from_secs(5));
}

#[tokio::test]
async fn test_no_wait_steps_start_immediately() {
    let yaml = r#"
name: "independent"
steps:
  - id: "a"
    action: run
    program: "a-tool"
  - id: "b"
    wait_for: ["-"]
    action: run
    program: "b-tool"
"#;
    let workspace = Workspace::empty();
    let mut pipeline = prepared_pipeline(yaml, &workspace, 1);
    let runner = MockRunner::new()
        .delay_on("a-tool", Duration::from_millis(150))
        .delay_on("b-tool", Duration::from_millis(150));
    let log = runner.log();

    let result = run_pipeline_with_strategy(&mut pipeline, runner, SchedulingStrategy::Parallel).await;

    assert_pipeline_completed(&result);
    assert_eq!(log.peak_concurrency(), 2);
}
