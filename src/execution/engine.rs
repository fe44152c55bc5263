//! Main execution engine - orchestrates the entire pipeline run

use crate::{
    core::{error::NO_EXIT_CODE, ExecutionStatus, Pipeline, PipelineError, StepKind, StepState},
    execution::{ExecutionResult, ExecutionScheduler, SchedulingStrategy, StepExecutor},
    tools::{build_invocation, OutputCallback, OutputStream, ToolRunner},
};
use chrono::Utc;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Events that can occur during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        execution_id: Uuid,
        pipeline_name: String,
        image: Option<String>,
    },
    StepStarted {
        step_id: String,
        kind: StepKind,
        command: Option<String>,
    },
    StepOutput {
        step_id: String,
        stream: OutputStream,
        line: String,
    },
    StepCompleted {
        step_id: String,
        duration: Duration,
    },
    StepFailed {
        step_id: String,
        error: String,
        exit_code: i32,
    },
    StepSkipped {
        step_id: String,
        reason: String,
    },
    StepCancelled {
        step_id: String,
        reason: String,
    },
    PipelineTimedOut {
        timeout: Duration,
        running: Vec<String>,
    },
    PipelineCompleted {
        execution_id: Uuid,
        status: ExecutionStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Registered handlers, shared with running step tasks
#[derive(Clone, Default)]
struct EventBus {
    handlers: Arc<RwLock<Vec<EventHandler>>>,
}

impl EventBus {
    fn add(&self, handler: EventHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    fn emit(&self, event: ExecutionEvent) {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }
}

/// Turns a step's tool output into `StepOutput` events
struct StepOutputForwarder {
    step_id: String,
    events: EventBus,
}

impl OutputCallback for StepOutputForwarder {
    fn on_line(&self, stream: OutputStream, line: &str) {
        self.events.emit(ExecutionEvent::StepOutput {
            step_id: self.step_id.clone(),
            stream,
            line: line.to_string(),
        });
    }
}

/// Main pipeline execution engine
pub struct ExecutionEngine<R> {
    scheduler: ExecutionScheduler,
    executor: Arc<StepExecutor<R>>,
    events: EventBus,
}

impl<R: ToolRunner + 'static> ExecutionEngine<R> {
    pub fn new(runner: R, strategy: SchedulingStrategy) -> Self {
        Self {
            scheduler: ExecutionScheduler::new(strategy),
            executor: Arc::new(StepExecutor::new(runner)),
            events: EventBus::default(),
        }
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.events.add(Arc::new(handler));
    }

    /// Emit an event to all handlers
    fn emit_event(&self, event: ExecutionEvent) {
        self.events.emit(event);
    }

    /// Execute the entire pipeline
    ///
    /// Stops at the first failing step: running siblings are killed and
    /// marked cancelled, steps that never started are marked skipped. The
    /// whole run is bounded by `pipeline.timeout`.
    pub async fn execute(&self, pipeline: &mut Pipeline) -> Result<(), PipelineError> {
        let execution_id = pipeline.state.execution_id;

        info!(
            "Starting pipeline execution: {} ({})",
            pipeline.name, execution_id
        );
        if let Some(machine_type) = &pipeline.machine_type {
            info!("Pipeline requests machine type {}", machine_type);
        }
        self.emit_event(ExecutionEvent::PipelineStarted {
            execution_id,
            pipeline_name: pipeline.name.clone(),
            image: pipeline.context.image.as_ref().map(ToString::to_string),
        });

        pipeline.state.start(pipeline.steps.len());

        let timer = sleep_until(Instant::now() + pipeline.timeout);
        tokio::pin!(timer);
        let mut tasks: JoinSet<(String, ExecutionResult)> = JoinSet::new();

        // Main execution loop
        let outcome = loop {
            for step_id in self.scheduler.next_steps(pipeline) {
                self.start_step(pipeline, &step_id, &mut tasks);
            }
            self.update_state_counts(pipeline);

            if tasks.is_empty() {
                if pipeline.is_complete() {
                    break Ok(());
                }
                let pending: Vec<String> = pipeline
                    .declaration_order()
                    .iter()
                    .filter(|id| matches!(pipeline.steps[*id].state, StepState::Pending))
                    .cloned()
                    .collect();
                error!("No steps ready to run and none running - pipeline stuck");
                break Err(PipelineError::Stuck(pending.join(", ")));
            }

            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok((step_id, result))) => {
                        if let Err(error) = self.finish_step(pipeline, &step_id, result) {
                            break Err(error);
                        }
                    }
                    Some(Err(e)) => {
                        break Err(PipelineError::Internal(format!("step task failed: {}", e)));
                    }
                    None => {}
                },
                _ = &mut timer => {
                    let running: Vec<String> = pipeline
                        .declaration_order()
                        .iter()
                        .filter(|id| pipeline.steps[*id].state.is_running())
                        .cloned()
                        .collect();
                    error!(
                        "Pipeline {} exceeded its {}s time limit",
                        pipeline.name,
                        pipeline.timeout.as_secs()
                    );
                    break Err(PipelineError::Timeout {
                        timeout_secs: pipeline.timeout.as_secs(),
                        running,
                    });
                }
            }
        };

        // Dropping the step futures kills their processes
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        match &outcome {
            Ok(()) => pipeline.state.complete(),
            Err(error) => {
                self.abort_remaining(pipeline, error);
                match error {
                    PipelineError::Timeout { running, .. } => {
                        self.emit_event(ExecutionEvent::PipelineTimedOut {
                            timeout: pipeline.timeout,
                            running: running.clone(),
                        });
                        pipeline.state.time_out(error.to_string());
                    }
                    _ => pipeline
                        .state
                        .fail(error.step_id(), error.exit_code(), error.to_string()),
                }
            }
        }
        self.update_state_counts(pipeline);

        info!(
            "Pipeline execution finished: {} - {:?}",
            pipeline.name, pipeline.state.status
        );
        self.emit_event(ExecutionEvent::PipelineCompleted {
            execution_id,
            status: pipeline.state.status,
        });

        outcome
    }

    /// Mark a step running and spawn its task
    fn start_step(
        &self,
        pipeline: &mut Pipeline,
        step_id: &str,
        tasks: &mut JoinSet<(String, ExecutionResult)>,
    ) {
        let Some(step) = pipeline.step(step_id).cloned() else {
            warn!("Scheduler returned unknown step {}", step_id);
            return;
        };
        let context = pipeline.create_context_for_step(step_id);
        let tools = pipeline.tools.clone();
        let command = build_invocation(&step, &context, &tools)
            .ok()
            .map(|invocation| invocation.command_line());

        if let Some(s) = pipeline.step_mut(step_id) {
            s.state = StepState::Running {
                started_at: Utc::now(),
            };
        }

        self.emit_event(ExecutionEvent::StepStarted {
            step_id: step_id.to_string(),
            kind: step.kind(),
            command,
        });

        let executor = Arc::clone(&self.executor);
        let forwarder = StepOutputForwarder {
            step_id: step_id.to_string(),
            events: self.events.clone(),
        };
        tasks.spawn(async move {
            let result = executor
                .execute(&step, &context, &tools, Some(&forwarder as &dyn OutputCallback))
                .await;
            (step.id, result)
        });
    }

    /// Record a finished step; a failure is returned so the run can stop
    fn finish_step(
        &self,
        pipeline: &mut Pipeline,
        step_id: &str,
        result: ExecutionResult,
    ) -> Result<(), PipelineError> {
        let Some(step) = pipeline.step_mut(step_id) else {
            return Err(PipelineError::Internal(format!("unknown step {}", step_id)));
        };
        let started_at = match &step.state {
            StepState::Running { started_at } => *started_at,
            _ => Utc::now(),
        };

        match result {
            ExecutionResult::Success {
                exit_code,
                duration,
            } => {
                step.state = StepState::Completed {
                    exit_code,
                    started_at,
                    completed_at: Utc::now(),
                };
                self.emit_event(ExecutionEvent::StepCompleted {
                    step_id: step_id.to_string(),
                    duration,
                });
                Ok(())
            }
            ExecutionResult::Failed { error } => {
                let exit_code = error.exit_code().unwrap_or(NO_EXIT_CODE);
                step.state = StepState::Failed {
                    error: error.to_string(),
                    exit_code,
                    started_at,
                    failed_at: Utc::now(),
                };
                self.emit_event(ExecutionEvent::StepFailed {
                    step_id: step_id.to_string(),
                    error: error.to_string(),
                    exit_code,
                });
                Err(error)
            }
        }
    }

    /// Cancel running steps and skip pending ones after the run stopped
    fn abort_remaining(&self, pipeline: &mut Pipeline, cause: &PipelineError) {
        let reason = match (cause, cause.step_id()) {
            (PipelineError::Timeout { timeout_secs, .. }, _) => {
                format!("pipeline timed out after {}s", timeout_secs)
            }
            (_, Some(failed)) => format!("step '{}' failed", failed),
            (other, None) => other.to_string(),
        };

        for step_id in pipeline.declaration_order().to_vec() {
            let Some(step) = pipeline.step_mut(&step_id) else {
                continue;
            };
            match step.state {
                StepState::Running { started_at } => {
                    step.state = StepState::Cancelled {
                        reason: reason.clone(),
                        started_at,
                        cancelled_at: Utc::now(),
                    };
                    warn!("Cancelled step {}: {}", step_id, reason);
                    self.emit_event(ExecutionEvent::StepCancelled {
                        step_id,
                        reason: reason.clone(),
                    });
                }
                StepState::Pending => {
                    step.state = StepState::Skipped {
                        reason: reason.clone(),
                    };
                    self.emit_event(ExecutionEvent::StepSkipped {
                        step_id,
                        reason: reason.clone(),
                    });
                }
                _ => {}
            }
        }
    }

    /// Update pipeline state counts
    fn update_state_counts(&self, pipeline: &mut Pipeline) {
        let mut completed = 0;
        let mut failed = 0;
        let mut running = 0;

        for step in pipeline.steps.values() {
            match &step.state {
                StepState::Completed { .. } => completed += 1,
                StepState::Failed { .. } => failed += 1,
                StepState::Running { .. } => running += 1,
                _ => {}
            }
        }

        pipeline.state.update_counts(completed, failed, running);
    }
}
