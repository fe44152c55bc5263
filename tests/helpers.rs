//! Test utilities for deploy-pipeline

#![allow(dead_code)]

use async_trait::async_trait;
use deploy_pipeline::core::config::PipelineConfig;
use deploy_pipeline::core::{ExecutionStatus, Pipeline, PipelineError, RunInputs, StepState};
use deploy_pipeline::execution::{ExecutionEngine, ExecutionEvent, SchedulingStrategy};
use deploy_pipeline::tools::{
    Invocation, OutputCallback, OutputStream, ToolError, ToolOutcome, ToolRunner,
};

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// The four-step deployment used by most scenarios
pub const DEPLOY_YAML: &str = r#"
name: "ai-app-deploy"
variables:
  service: "ai-app"
  region: "us-central1"
  repo_url: "https://github.com/acme/ai-app.git"
image:
  repository: "gcr.io/{{ project_id }}/ai-app"
timeout_secs: 1200
machine_type: "E2_HIGHCPU_8"
steps:
  - id: "fetch"
    action: fetch_source
    repository: "{{ repo_url }}"
  - id: "build"
    action: build_image
  - id: "push"
    action: push_image
  - id: "deploy"
    action: deploy_service
    service: "{{ service }}"
    region: "{{ region }}"
    allow_unauthenticated: true
"#;

/// A build file that satisfies the service contract
pub const SERVICE_BUILD_FILE: &str = r#"FROM python:3.9-slim
WORKDIR /app
COPY . .
RUN pip install -r requirements.txt
ENV PORT=8080
EXPOSE 8080
HEALTHCHECK --interval=30s --timeout=30s --start-period=5s --retries=3 CMD curl -f http://localhost:8080/health || exit 1
CMD ["python", "app.py"]
"#;

struct Rule {
    pattern: String,
    exit_code: Option<i32>,
    stderr: Option<String>,
    delay: Option<Duration>,
}

/// What a [`MockRunner`] saw, shared with the test after the runner moves
/// into the engine
#[derive(Clone, Default)]
pub struct RunLog {
    calls: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl RunLog {
    /// Command lines in the order they were started
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn was_called(&self, pattern: &str) -> bool {
        self.calls().iter().any(|c| c.contains(pattern))
    }

    /// Highest number of invocations in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Tool runner that records invocations and answers from scripted rules.
///
/// Rules match on a substring of the rendered command line; the first
/// matching rule with an exit code (or delay) wins. Unmatched invocations
/// succeed immediately.
#[derive(Default)]
pub struct MockRunner {
    rules: Vec<Rule>,
    log: RunLog,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit with `exit_code` and print `stderr` for matching invocations
    pub fn fail_on(mut self, pattern: &str, exit_code: i32, stderr: &str) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            exit_code: Some(exit_code),
            stderr: Some(stderr.to_string()),
            delay: None,
        });
        self
    }

    /// Sleep before answering matching invocations
    pub fn delay_on(mut self, pattern: &str, delay: Duration) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            exit_code: None,
            stderr: None,
            delay: Some(delay),
        });
        self
    }

    pub fn log(&self) -> RunLog {
        self.log.clone()
    }
}

#[async_trait]
impl ToolRunner for MockRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        output: Option<&dyn OutputCallback>,
    ) -> Result<ToolOutcome, ToolError> {
        let line = invocation.command_line();
        self.log.calls.lock().unwrap().push(line.clone());

        let active = self.log.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(self.log.active.clone());
        self.log.peak.fetch_max(active, Ordering::SeqCst);

        let matching: Vec<&Rule> = self
            .rules
            .iter()
            .filter(|r| line.contains(r.pattern.as_str()))
            .collect();
        let delay = matching.iter().find_map(|r| r.delay).unwrap_or(Duration::ZERO);
        let failure = matching.iter().find(|r| r.exit_code.is_some()).copied();

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(output) = output {
            output.on_line(OutputStream::Stdout, &line);
        }

        let mut stderr_tail = Vec::new();
        if let Some(stderr) = failure.and_then(|r| r.stderr.clone()) {
            if let Some(output) = output {
                output.on_line(OutputStream::Stderr, &stderr);
            }
            stderr_tail.push(stderr);
        }

        Ok(ToolOutcome {
            exit_code: failure.and_then(|r| r.exit_code).unwrap_or(0),
            duration: delay,
            stderr_tail,
        })
    }
}

/// Ephemeral run workspace
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn empty() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    /// Workspace whose fetched source already holds a build file, as if the
    /// fetch step had cloned it
    pub fn with_build_file(contents: &str) -> Self {
        let workspace = Self::empty();
        let source = workspace.path().join("source");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("Dockerfile"), contents).unwrap();
        workspace
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Parse a pipeline from YAML string
pub fn pipeline_from_yaml(yaml: &str) -> Pipeline {
    let config = PipelineConfig::from_yaml(yaml)
        .unwrap_or_else(|e| panic!("Failed to parse pipeline YAML: {}", e));
    config.to_pipeline()
}

/// Parse and prepare a pipeline for a run in `workspace`
pub fn prepared_pipeline(yaml: &str, workspace: &Workspace, build_number: u64) -> Pipeline {
    prepared_pipeline_with(yaml, workspace, build_number, HashMap::new())
}

pub fn prepared_pipeline_with(
    yaml: &str,
    workspace: &Workspace,
    build_number: u64,
    overrides: HashMap<String, String>,
) -> Pipeline {
    let mut pipeline = pipeline_from_yaml(yaml);
    pipeline
        .prepare(RunInputs {
            workspace: workspace.path().to_path_buf(),
            build_number,
            project_id: Some("acme".to_string()),
            overrides,
        })
        .unwrap_or_else(|e| panic!("Failed to prepare pipeline: {:#}", e));
    pipeline
}

/// Run a pipeline sequentially with a mock runner
pub async fn run_pipeline_with_mock(pipeline: &mut Pipeline, runner: MockRunner) -> PipelineTestResult {
    run_pipeline_with_strategy(pipeline, runner, SchedulingStrategy::Sequential).await
}

/// Run a pipeline with any strategy, recording every event
pub async fn run_pipeline_with_strategy(
    pipeline: &mut Pipeline,
    runner: MockRunner,
    strategy: SchedulingStrategy,
) -> PipelineTestResult {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();

    let engine = ExecutionEngine::new(runner, strategy);
    engine.add_event_handler(move |event| sink.lock().unwrap().push(event));

    let start = Instant::now();
    let result = engine.execute(pipeline).await;
    let duration = start.elapsed();

    let events = events.lock().unwrap().clone();
    PipelineTestResult {
        pipeline: pipeline.clone(),
        result,
        events,
        duration,
    }
}

/// Test result from running a pipeline
#[derive(Debug, Clone)]
pub struct PipelineTestResult {
    pub pipeline: Pipeline,
    pub result: Result<(), PipelineError>,
    pub events: Vec<ExecutionEvent>,
    pub duration: Duration,
}

impl PipelineTestResult {
    pub fn is_success(&self) -> bool {
        self.result.is_ok() && self.pipeline.state.status == ExecutionStatus::Completed
    }

    pub fn error(&self) -> &PipelineError {
        match &self.result {
            Err(error) => error,
            Ok(()) => panic!("Pipeline succeeded: {}", self.summary()),
        }
    }

    /// Get the state of a specific step
    pub fn step_state(&self, step_id: &str) -> &StepState {
        &self
            .pipeline
            .step(step_id)
            .unwrap_or_else(|| panic!("Step '{}' not found in result", step_id))
            .state
    }

    /// Step ids whose state matches, in execution order
    pub fn steps_where(&self, predicate: impl Fn(&StepState) -> bool) -> Vec<String> {
        self.pipeline
            .execution_order()
            .iter()
            .filter(|id| self.pipeline.step(id).is_some_and(|s| predicate(&s.state)))
            .cloned()
            .collect()
    }

    pub fn completed_steps(&self) -> Vec<String> {
        self.steps_where(|s| matches!(s, StepState::Completed { .. }))
    }

    /// Step ids in the order the engine started them
    pub fn started_steps(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::StepStarted { step_id, .. } => Some(step_id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn summary(&self) -> String {
        format!(
            "{:?} - {} steps completed, result {:?}, {:?}",
            self.pipeline.state.status,
            self.completed_steps().len(),
            self.result,
            self.duration
        )
    }
}

/// Assert pipeline completed successfully
pub fn assert_pipeline_completed(result: &PipelineTestResult) {
    assert!(
        result.is_success(),
        "Pipeline should be completed, but was: {}",
        result.summary()
    );
}

/// Assert the run failed at `step_id` with the tool's `exit_code`
pub fn assert_pipeline_failed_at(result: &PipelineTestResult, step_id: &str, exit_code: i32) {
    assert_eq!(
        result.pipeline.state.status,
        ExecutionStatus::Failed,
        "Pipeline should have failed, but was: {}",
        result.summary()
    );
    let error = result.error();
    assert_eq!(error.step_id(), Some(step_id), "wrong failing step: {}", error);
    assert_eq!(error.exit_code(), Some(exit_code), "wrong exit code: {}", error);
    assert_eq!(result.pipeline.state.failed_step.as_deref(), Some(step_id));
    assert_eq!(result.pipeline.state.exit_code, Some(exit_code));
}

/// Assert a step failed with an error containing `expected`
pub fn assert_step_failed(result: &PipelineTestResult, step_id: &str, expected: &str) {
    match result.step_state(step_id) {
        StepState::Failed { error, .. } => assert!(
            error.contains(expected),
            "Step '{}' error:\n{}\n\ndoes not contain:\n{}",
            step_id,
            error,
            expected
        ),
        other => panic!("Step '{}' should have failed, but was: {:?}", step_id, other),
    }
}

pub fn assert_step_skipped(result: &PipelineTestResult, step_id: &str) {
    assert!(
        matches!(result.step_state(step_id), StepState::Skipped { .. }),
        "Step '{}' should be skipped, but was: {:?}",
        step_id,
        result.step_state(step_id)
    );
}

pub fn assert_step_cancelled(result: &PipelineTestResult, step_id: &str) {
    assert!(
        matches!(result.step_state(step_id), StepState::Cancelled { .. }),
        "Step '{}' should be cancelled, but was: {:?}",
        step_id,
        result.step_state(step_id)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_runner_scripts_failures() {
        let runner = MockRunner::new().fail_on("push", 1, "denied");
        let log = runner.log();
        let invocation = Invocation {
            program: "docker".to_string(),
            args: vec!["push".to_string(), "gcr.io/acme/ai-app:build-1".to_string()],
            dir: std::env::temp_dir(),
            env: Default::default(),
        };

        let outcome = runner.run(&invocation, None).await.unwrap();

        assert_eq!(outcome.exit_code, 1);
        assert_eq!(outcome.failure_message(), "denied");
        assert_eq!(log.calls(), vec!["docker push gcr.io/acme/ai-app:build-1"]);
        assert_eq!(log.peak_concurrency(), 1);
    }

    #[test]
    fn test_workspace_with_build_file() {
        let workspace = Workspace::with_build_file(SERVICE_BUILD_FILE);
        assert!(workspace.path().join("source/Dockerfile").is_file());
    }
}
