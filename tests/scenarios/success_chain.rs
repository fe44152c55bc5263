//! Test: Success Chain - fetch, build, push, deploy in order

use crate::helpers::*;
use deploy_pipeline::core::{ExecutionStatus, RunInputs, StepState};
use deploy_pipeline::execution::ExecutionEvent;
use std::collections::HashMap;

#[tokio::test]
async fn test_deploy_chain_succeeds() {
    let workspace = Workspace::with_build_file(SERVICE_BUILD_FILE);
    let mut pipeline = prepared_pipeline(DEPLOY_YAML, &workspace, 7);
    let runner = MockRunner::new();
    let log = runner.log();

    let result = run_pipeline_with_mock(&mut pipeline, runner).await;

    assert_pipeline_completed(&result);
    assert_eq!(result.started_steps(), vec!["fetch", "build", "push", "deploy"]);
    assert_eq!(result.completed_steps().len(), 4);
    assert_eq!(result.pipeline.state.completed_steps, 4);
    assert_eq!(result.pipeline.state.progress(), 1.0);

    assert_eq!(
        log.calls(),
        vec![
            "git clone --depth 1 https://github.com/acme/ai-app.git source",
            "docker build -t gcr.io/acme/ai-app:build-7 -f source/Dockerfile source",
            "docker push gcr.io/acme/ai-app:build-7",
            "gcloud run deploy ai-app --image gcr.io/acme/ai-app:build-7 --region us-central1 \
             --platform managed --port 8080 --allow-unauthenticated --quiet",
        ]
    );
}

#[tokio::test]
async fn test_every_step_reports_exit_code_zero() {
    let workspace = Workspace::with_build_file(SERVICE_BUILD_FILE);
    let mut pipeline = prepared_pipeline(DEPLOY_YAML, &workspace, 1);

    let result = run_pipeline_with_mock(&mut pipeline, MockRunner::new()).await;

    assert_pipeline_completed(&result);
    for step_id in ["fetch", "build", "push", "deploy"] {
        assert!(
            matches!(result.step_state(step_id), StepState::Completed { exit_code: 0, .. }),
            "{} should complete with exit code 0",
            step_id
        );
    }
    assert_eq!(result.pipeline.state.failed_step, None);
    assert_eq!(result.pipeline.state.exit_code, None);
}

#[tokio::test]
async fn test_events_bracket_the_run() {
    let workspace = Workspace::with_build_file(SERVICE_BUILD_FILE);
    let mut pipeline = prepared_pipeline(DEPLOY_YAML, &workspace, 3);
    let execution_id = pipeline.state.execution_id;

    let result = run_pipeline_with_mock(&mut pipeline, MockRunner::new()).await;

    match result.events.first() {
        Some(ExecutionEvent::PipelineStarted { image, .. }) => {
            assert_eq!(image.as_deref(), Some("gcr.io/acme/ai-app:build-3"));
        }
        other => panic!("expected PipelineStarted first, got {:?}", other),
    }
    match result.events.last() {
        Some(ExecutionEvent::PipelineCompleted { execution_id: id, status }) => {
            assert_eq!(*id, execution_id);
            assert_eq!(*status, ExecutionStatus::Completed);
        }
        other => panic!("expected PipelineCompleted last, got {:?}", other),
    }

    let output_steps: Vec<&str> = result
        .events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::StepOutput { step_id, .. } => Some(step_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(output_steps, vec!["fetch", "build", "push", "deploy"]);
}

#[tokio::test]
async fn test_health_probe_failure_is_reported() {
    // Nothing listens on port 9 (discard); the probe must give up quickly
    let yaml = r#"
name: "probe"
steps:
  - id: "verify"
    action: check_health
    url: "http://127.0.0.1:9"
    interval_secs: 0
    probe_timeout_secs: 1
    start_period_secs: 0
    retries: 1
"#;
    let workspace = Workspace::empty();
    let mut pipeline = prepared_pipeline(yaml, &workspace, 1);

    let result = run_pipeline_with_mock(&mut pipeline, MockRunner::new()).await;

    assert_eq!(result.pipeline.state.status, ExecutionStatus::Failed);
    assert_eq!(result.error().step_id(), Some("verify"));
    assert!(matches!(
        result.step_state("verify"),
        StepState::Failed { exit_code: -1, .. }
    ));
}

#[tokio::test]
async fn test_bundled_pipeline_file_plans_cleanly() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/pipelines/deploy.yaml");
    let config = deploy_pipeline::core::config::PipelineConfig::from_file(path).unwrap();
    assert_eq!(config.timeout_secs(), 1200);

    let workspace = Workspace::with_build_file(SERVICE_BUILD_FILE);
    let yaml = std::fs::read_to_string(path).unwrap();
    let overrides = HashMap::from([(
        "service_url".to_string(),
        "https://ai-app-x7k2-uc.a.run.app".to_string(),
    )]);
    let pipeline = prepared_pipeline_with(&yaml, &workspace, 12, overrides);

    assert_eq!(
        pipeline.stages(),
        vec![
            vec!["fetch".to_string()],
            vec!["build".to_string()],
            vec!["push".to_string()],
            vec!["deploy".to_string()],
            vec!["verify".to_string()],
        ]
    );
    assert_eq!(
        pipeline.context.image.as_ref().map(ToString::to_string).as_deref(),
        Some("gcr.io/acme/ai-app:build-12")
    );
}

#[test]
fn test_bundled_pipeline_requires_service_url() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/pipelines/deploy.yaml");
    let yaml = std::fs::read_to_string(path).unwrap();
    let workspace = Workspace::empty();
    let mut pipeline = pipeline_from_yaml(&yaml);

    let error = pipeline
        .prepare(RunInputs {
            workspace: workspace.path().to_path_buf(),
            build_number: 1,
            project_id: Some("acme".to_string()),
            overrides: HashMap::new(),
        })
        .unwrap_err();

    assert!(error.to_string().contains("service_url"), "{}", error);
}
