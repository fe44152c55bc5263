//! Test: Variable Substitution - `{{ var }}` in step parameters and image tags

use crate::helpers::*;
use deploy_pipeline::core::RunInputs;
use std::collections::HashMap;

#[tokio::test]
async fn test_overrides_win_over_file_variables() {
    let workspace = Workspace::with_build_file(SERVICE_BUILD_FILE);
    let overrides = HashMap::from([
        ("region".to_string(), "europe-west1".to_string()),
        ("service".to_string(), "ai-app-staging".to_string()),
    ]);
    let mut pipeline = prepared_pipeline_with(DEPLOY_YAML, &workspace, 9, overrides);
    let runner = MockRunner::new();
    let log = runner.log();

    let result = run_pipeline_with_mock(&mut pipeline, runner).await;

    assert_pipeline_completed(&result);
    let deploy = log.calls().into_iter().find(|c| c.starts_with("gcloud")).unwrap();
    assert!(deploy.contains("run deploy ai-app-staging"), "{}", deploy);
    assert!(deploy.contains("--region europe-west1"), "{}", deploy);
}

#[tokio::test]
async fn test_same_immutable_tag_flows_through_build_push_deploy() {
    let workspace = Workspace::with_build_file(SERVICE_BUILD_FILE);
    let mut pipeline = prepared_pipeline(DEPLOY_YAML, &workspace, 42);
    let runner = MockRunner::new();
    let log = runner.log();

    let result = run_pipeline_with_mock(&mut pipeline, runner).await;

    assert_pipeline_completed(&result);
    let image = "gcr.io/acme/ai-app:build-42";
    let calls = log.calls();
    assert_eq!(calls.iter().filter(|c| c.contains(image)).count(), 3);
    assert!(!calls.iter().any(|c| c.contains(":latest")));
}

#[tokio::test]
async fn test_tag_template_uses_run_variables() {
    let yaml = r#"
name: "ai-app-deploy"
image:
  repository: "gcr.io/{{ project_id }}/ai-app"
  tag: "{{ commit_sha }}"
steps:
  - id: "push"
    action: push_image
"#;
    let workspace = Workspace::empty();
    let overrides = HashMap::from([("commit_sha".to_string(), "3f9c2ab".to_string())]);
    let mut pipeline = prepared_pipeline_with(yaml, &workspace, 1, overrides);
    let runner = MockRunner::new();
    let log = runner.log();

    let result = run_pipeline_with_mock(&mut pipeline, runner).await;

    assert_pipeline_completed(&result);
    assert_eq!(log.calls(), vec!["docker push gcr.io/acme/ai-app:3f9c2ab"]);
}

#[tokio::test]
async fn test_run_step_renders_args_env_and_dir() {
    let yaml = r#"
name: "render"
variables:
  greeting: "hello"
steps:
  - id: "say"
    action: run
    program: "echo"
    args: ["{{ greeting }}", "build {{ build_number }}"]
    dir: "{{ greeting }}-dir"
"#;
    let workspace = Workspace::empty();
    let mut pipeline = prepared_pipeline(yaml, &workspace, 5);
    let runner = MockRunner::new();
    let log = runner.log();

    let result = run_pipeline_with_mock(&mut pipeline, runner).await;

    assert_pipeline_completed(&result);
    assert_eq!(log.calls(), vec!["echo hello 'build 5'"]);
}

#[test]
fn test_undefined_variable_rejected_before_running() {
    let yaml = r#"
name: "broken"
image:
  repository: "gcr.io/acme/ai-app"
steps:
  - id: "deploy"
    action: deploy_service
    service: "{{ service_name }}"
    region: "us-central1"
"#;
    let workspace = Workspace::empty();
    let mut pipeline = pipeline_from_yaml(yaml);

    let error = pipeline
        .prepare(RunInputs {
            workspace: workspace.path().to_path_buf(),
            build_number: 1,
            project_id: None,
            overrides: HashMap::new(),
        })
        .unwrap_err();

    assert!(error.to_string().contains("service_name"), "{}", error);
}

#[tokio::test]
async fn test_untagged_push_image_fails_the_push() {
    let yaml = r#"
name: "push-explicit"
steps:
  - id: "push"
    action: push_image
    image: "gcr.io/acme/ai-app"
"#;
    let workspace = Workspace::empty();
    let mut pipeline = prepared_pipeline(yaml, &workspace, 1);
    let runner = MockRunner::new();
    let log = runner.log();

    let result = run_pipeline_with_mock(&mut pipeline, runner).await;

    assert_pipeline_failed_at(&result, "push", -1);
    assert_step_failed(&result, "push", "no tag");
    assert!(log.calls().is_empty());
}
