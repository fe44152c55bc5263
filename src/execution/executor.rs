//! Step executor - runs individual steps through the tool runner

use crate::{
    core::{
        buildfile::BuildFile,
        config::ToolPaths,
        error::{PipelineError, NO_EXIT_CODE},
        step::StepAction,
        PipelineContext, Step, StepKind,
    },
    health::{HealthProbe, ProbeSettings},
    tools::{build_invocation, build_paths, OutputCallback, ToolRunner},
};
use std::time::Instant;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

/// Result of executing a step
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    /// Step completed successfully
    Success { exit_code: i32, duration: Duration },
    /// Step failed; the error names the step and its exit code
    Failed { error: PipelineError },
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }
}

/// Executes a single step
pub struct StepExecutor<R> {
    runner: R,
}

impl<R: ToolRunner> StepExecutor<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Execute a step and return the result
    pub async fn execute(
        &self,
        step: &Step,
        context: &PipelineContext,
        tools: &ToolPaths,
        output: Option<&dyn OutputCallback>,
    ) -> ExecutionResult {
        info!("Executing step: {} ({})", step.id, step.kind());
        let started = Instant::now();

        let work = self.run_action(step, context, tools, output);
        let result = match step.timeout_secs {
            Some(secs) => match timeout(Duration::from_secs(secs), work).await {
                Ok(result) => result,
                Err(_) => {
                    error!("Timeout for step {} after {}s", step.id, secs);
                    Err(PipelineError::for_step(
                        step.kind(),
                        &step.id,
                        NO_EXIT_CODE,
                        format!("step timed out after {} seconds", secs),
                    ))
                }
            },
            None => work.await,
        };

        match result {
            Ok(exit_code) => {
                info!("Step {} completed in {:?}", step.id, started.elapsed());
                ExecutionResult::Success {
                    exit_code,
                    duration: started.elapsed(),
                }
            }
            Err(error) => {
                error!("Step {} failed: {}", step.id, error);
                ExecutionResult::Failed { error }
            }
        }
    }

    async fn run_action(
        &self,
        step: &Step,
        context: &PipelineContext,
        tools: &ToolPaths,
        output: Option<&dyn OutputCallback>,
    ) -> Result<i32, PipelineError> {
        let fail = |exit_code: i32, message: String| {
            PipelineError::for_step(step.kind(), &step.id, exit_code, message)
        };

        if let StepAction::CheckHealth {
            url,
            path,
            interval_secs,
            probe_timeout_secs,
            start_period_secs,
            retries,
        } = &step.action
        {
            let mut settings = ProbeSettings::default();
            if let Some(path) = path {
                settings.path = context.render(path).map_err(|e| fail(NO_EXIT_CODE, e.to_string()))?;
            }
            if let Some(secs) = interval_secs {
                settings.interval = Duration::from_secs(*secs);
            }
            if let Some(secs) = probe_timeout_secs {
                settings.timeout = Duration::from_secs(*secs);
            }
            if let Some(secs) = start_period_secs {
                settings.start_period = Duration::from_secs(*secs);
            }
            if let Some(retries) = retries {
                settings.retries = *retries;
            }
            let url = context.render(url).map_err(|e| fail(NO_EXIT_CODE, e.to_string()))?;
            return self.check_health(&url, settings).await.map_err(|m| fail(NO_EXIT_CODE, m));
        }

        if step.kind() == StepKind::BuildImage {
            self.check_build_file(step, context)
                .map_err(|m| fail(NO_EXIT_CODE, m))?;
        }

        let invocation =
            build_invocation(step, context, tools).map_err(|e| fail(NO_EXIT_CODE, e.to_string()))?;
        debug!("Command for step {}: {}", step.id, invocation.command_line());

        let outcome = self
            .runner
            .run(&invocation, output)
            .await
            .map_err(|e| fail(NO_EXIT_CODE, e.to_string()))?;

        if outcome.success() {
            Ok(outcome.exit_code)
        } else {
            Err(fail(outcome.exit_code, outcome.failure_message()))
        }
    }

    /// Build file must exist and parse before the image builder runs
    fn check_build_file(&self, step: &Step, context: &PipelineContext) -> Result<(), String> {
        let Some((context_dir, file)) = build_paths(step, context).map_err(|e| e.to_string())?
        else {
            return Ok(());
        };

        if !context_dir.is_dir() {
            return Err(format!(
                "build context {} does not exist",
                context_dir.display()
            ));
        }
        if !file.is_file() {
            return Err(format!("build file {} not found", file.display()));
        }

        let build_file = BuildFile::from_file(&file).map_err(|e| e.to_string())?;
        let contract = build_file.contract().map_err(|e| e.to_string())?;
        info!(
            "Service contract for step {}: port {}, liveness {}",
            step.id,
            contract.port,
            contract.probe_settings().path
        );
        for issue in build_file.contract_issues() {
            warn!("{}: {}", file.display(), issue);
        }

        Ok(())
    }

    async fn check_health(&self, url: &str, settings: ProbeSettings) -> Result<i32, String> {
        let probe = HealthProbe::new(settings).map_err(|e| e.to_string())?;
        let report = probe.wait_healthy(url).await.map_err(|e| e.to_string())?;
        info!(
            "{} healthy (HTTP {}) after {} attempt(s)",
            report.url, report.status_code, report.attempts
        );
        Ok(0)
    }
}
