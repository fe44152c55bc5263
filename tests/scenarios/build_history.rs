//! Test: Build History - run summaries and per-pipeline build numbers

use crate::helpers::*;
use deploy_pipeline::core::ExecutionStatus;
use deploy_pipeline::persistence::{
    create_summary, InMemoryPersistence, PersistenceBackend, SqliteExecutionStore,
};

async fn run_and_record(
    store: &dyn PersistenceBackend,
    runner: MockRunner,
) -> (u64, ExecutionStatus) {
    let workspace = Workspace::with_build_file(SERVICE_BUILD_FILE);
    let build_number = store.next_build_number("ai-app-deploy").await.unwrap();
    let mut pipeline = prepared_pipeline(DEPLOY_YAML, &workspace, build_number);

    let result = run_pipeline_with_mock(&mut pipeline, runner).await;
    store.save_execution(&create_summary(&result.pipeline)).await.unwrap();

    (build_number, result.pipeline.state.status)
}

#[tokio::test]
async fn test_build_numbers_advance_per_run() {
    let store = InMemoryPersistence::new();

    let first = run_and_record(&store, MockRunner::new()).await;
    let second = run_and_record(&store, MockRunner::new().fail_on("docker push", 1, "denied")).await;
    let third = run_and_record(&store, MockRunner::new()).await;

    assert_eq!(first, (1, ExecutionStatus::Completed));
    assert_eq!(second, (2, ExecutionStatus::Failed));
    assert_eq!(third, (3, ExecutionStatus::Completed));

    let latest = store.latest_execution("ai-app-deploy").await.unwrap().unwrap();
    assert_eq!(latest.build_number, 3);
    assert_eq!(latest.image.as_deref(), Some("gcr.io/acme/ai-app:build-3"));
}

#[tokio::test]
async fn test_failed_run_summary_names_step_and_exit_code() {
    let store = InMemoryPersistence::new();
    run_and_record(&store, MockRunner::new().fail_on("docker push", 1, "denied")).await;

    let runs = store.list_executions("ai-app-deploy").await.unwrap();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.status, ExecutionStatus::Failed);
    assert_eq!(run.failed_step.as_deref(), Some("push"));
    assert_eq!(run.exit_code, Some(1));
    assert_eq!(run.completed_steps, 2);
    assert_eq!(run.total_steps, 4);
    assert!(run.completed_at.is_some());
}

#[tokio::test]
async fn test_history_survives_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("executions.db");
    let path = path.to_str().unwrap();

    {
        let store = SqliteExecutionStore::new(path).await.unwrap();
        run_and_record(&store, MockRunner::new()).await;
        run_and_record(&store, MockRunner::new()).await;
    }

    let store = SqliteExecutionStore::new(path).await.unwrap();
    assert_eq!(store.next_build_number("ai-app-deploy").await.unwrap(), 3);
    assert_eq!(store.list_pipelines().await.unwrap(), vec!["ai-app-deploy"]);
}
