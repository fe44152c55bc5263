//! Test: Global Timeout - the whole run is bounded

use crate::helpers::*;
use deploy_pipeline::core::{ExecutionStatus, PipelineError};
use deploy_pipeline::execution::ExecutionEvent;
use std::time::Duration;

#[tokio::test]
async fn test_pipeline_deadline_cancels_running_step() {
    let workspace = Workspace::with_build_file(SERVICE_BUILD_FILE);
    let mut pipeline = prepared_pipeline(DEPLOY_YAML, &workspace, 1);
    pipeline.timeout = Duration::from_millis(300);
    let runner = MockRunner::new().delay_on("docker build", Duration::from_secs(10));
    let log = runner.log();

    let result = run_pipeline_with_mock(&mut pipeline, runner).await;

    assert!(result.error().is_timeout(), "expected timeout, got {:?}", result.result);
    assert_eq!(result.pipeline.state.status, ExecutionStatus::TimedOut);
    assert!(result.duration < Duration::from_secs(5));

    assert_eq!(result.completed_steps(), vec!["fetch"]);
    assert_step_cancelled(&result, "build");
    assert_step_skipped(&result, "push");
    assert_step_skipped(&result, "deploy");
    assert!(!log.was_called("docker push"));

    match result.error() {
        PipelineError::Timeout { running, .. } => assert_eq!(running, &vec!["build".to_string()]),
        other => panic!("expected timeout, got {}", other),
    }
}

#[tokio::test]
async fn test_timeout_emits_event_before_completion() {
    let yaml = r#"
name: "hang"
timeout_secs: 1
steps:
  - id: "wait"
    action: run
    program: "sleep"
    args: ["60"]
"#;
    let workspace = Workspace::empty();
    let mut pipeline = prepared_pipeline(yaml, &workspace, 1);
    assert_eq!(pipeline.timeout, Duration::from_secs(1));
    let runner = MockRunner::new().delay_on("sleep", Duration::from_secs(60));

    let result = run_pipeline_with_mock(&mut pipeline, runner).await;

    assert_eq!(result.pipeline.state.status, ExecutionStatus::TimedOut);
    let position = |pred: fn(&ExecutionEvent) -> bool| result.events.iter().position(pred);
    let timed_out = position(|e| matches!(e, ExecutionEvent::PipelineTimedOut { .. }));
    let cancelled = position(|e| matches!(e, ExecutionEvent::StepCancelled { .. }));
    let completed = position(|e| matches!(e, ExecutionEvent::PipelineCompleted { .. }));
    assert!(cancelled.is_some());
    assert!(timed_out.is_some());
    assert!(timed_out < completed);
    assert_eq!(completed, Some(result.events.len() - 1));
}

#[test]
fn test_default_deadline_is_twenty_minutes() {
    let pipeline = pipeline_from_yaml(
        r#"
name: "defaults"
steps:
  - id: "only"
    action: run
    program: "true"
"#,
    );
    assert_eq!(pipeline.timeout, Duration::from_secs(1200));
}
