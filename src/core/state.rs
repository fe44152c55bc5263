//! Execution state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Overall pipeline execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Pipeline has not started
    Pending,
    /// Pipeline is currently running
    Running,
    /// All steps completed
    Completed,
    /// A step failed
    Failed,
    /// The pipeline deadline passed
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "Pending",
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Completed => "Completed",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::TimedOut => "TimedOut",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Running" => ExecutionStatus::Running,
            "Completed" => ExecutionStatus::Completed,
            "Failed" => ExecutionStatus::Failed,
            "TimedOut" => ExecutionStatus::TimedOut,
            _ => ExecutionStatus::Pending,
        }
    }
}

/// State of a single step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StepState {
    /// Step is waiting for dependencies
    Pending,
    /// Step's process is running
    Running {
        started_at: DateTime<Utc>,
    },
    /// Step completed successfully
    Completed {
        exit_code: i32,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },
    /// Step failed
    Failed {
        error: String,
        exit_code: i32,
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
    },
    /// Step never started because the run aborted
    Skipped {
        reason: String,
    },
    /// Step was running when the run aborted and was killed
    Cancelled {
        reason: String,
        started_at: DateTime<Utc>,
        cancelled_at: DateTime<Utc>,
    },
}

impl StepState {
    /// Check if step is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Completed { .. }
                | StepState::Failed { .. }
                | StepState::Skipped { .. }
                | StepState::Cancelled { .. }
        )
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, StepState::Completed { .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(self, StepState::Running { .. })
    }
}

/// Overall pipeline state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    /// Unique execution ID
    pub execution_id: Uuid,

    /// Current execution status
    pub status: ExecutionStatus,

    /// When execution started
    pub started_at: Option<DateTime<Utc>>,

    /// When execution completed/failed
    pub completed_at: Option<DateTime<Utc>>,

    /// Total number of steps
    pub total_steps: usize,

    /// Number of completed steps
    pub completed_steps: usize,

    /// Number of failed steps
    pub failed_steps: usize,

    /// Number of currently running steps
    pub running_steps: usize,

    /// Step that ended the run, if any
    pub failed_step: Option<String>,

    /// Exit code reported by the failing step's tool
    pub exit_code: Option<i32>,

    /// Failure message
    pub error: Option<String>,
}

impl PipelineState {
    /// Create a new pipeline state
    pub fn new() -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            status: ExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            total_steps: 0,
            completed_steps: 0,
            failed_steps: 0,
            running_steps: 0,
            failed_step: None,
            exit_code: None,
            error: None,
        }
    }

    /// Mark pipeline as started
    pub fn start(&mut self, total_steps: usize) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
        self.total_steps = total_steps;
    }

    /// Mark pipeline as completed
    pub fn complete(&mut self) {
        self.status = ExecutionStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark pipeline as failed by a step
    pub fn fail(&mut self, step_id: Option<&str>, exit_code: Option<i32>, error: String) {
        self.status = ExecutionStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.failed_step = step_id.map(str::to_string);
        self.exit_code = exit_code;
        self.error = Some(error);
    }

    /// Mark pipeline as timed out
    pub fn time_out(&mut self, error: String) {
        self.status = ExecutionStatus::TimedOut;
        self.completed_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Update step counts based on current steps
    pub fn update_counts(&mut self, completed: usize, failed: usize, running: usize) {
        self.completed_steps = completed;
        self.failed_steps = failed;
        self.running_steps = running;
    }

    /// Fraction of steps that completed (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        self.completed_steps as f64 / self.total_steps as f64
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}
