//! Pipeline error taxonomy

use crate::core::step::StepKind;
use thiserror::Error;

/// Exit code reported when a step failed without a process exit status
/// (spawn failure, pre-check failure, killed by signal, step timeout).
pub const NO_EXIT_CODE: i32 = -1;

/// Errors that end a pipeline run
///
/// Every step variant maps to exactly one error variant, plus the global
/// time bound.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("source fetch failed in step '{step_id}' (exit code {exit_code}): {message}")]
    SourceFetch {
        step_id: String,
        exit_code: i32,
        message: String,
    },

    #[error("image build failed in step '{step_id}' (exit code {exit_code}): {message}")]
    Build {
        step_id: String,
        exit_code: i32,
        message: String,
    },

    #[error("image push failed in step '{step_id}' (exit code {exit_code}): {message}")]
    Push {
        step_id: String,
        exit_code: i32,
        message: String,
    },

    #[error("deploy failed in step '{step_id}' (exit code {exit_code}): {message}")]
    Deploy {
        step_id: String,
        exit_code: i32,
        message: String,
    },

    #[error("health check failed in step '{step_id}': {message}")]
    HealthCheck { step_id: String, message: String },

    #[error("command failed in step '{step_id}' (exit code {exit_code}): {message}")]
    Command {
        step_id: String,
        exit_code: i32,
        message: String,
    },

    #[error("pipeline timed out after {timeout_secs}s")]
    Timeout {
        timeout_secs: u64,
        /// Steps that were still running when the deadline hit
        running: Vec<String>,
    },

    #[error("pipeline stuck: no runnable steps ({0})")]
    Stuck(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Build the error variant matching a step kind
    pub fn for_step(kind: StepKind, step_id: &str, exit_code: i32, message: impl Into<String>) -> Self {
        let step_id = step_id.to_string();
        let message = message.into();
        match kind {
            StepKind::FetchSource => PipelineError::SourceFetch { step_id, exit_code, message },
            StepKind::BuildImage => PipelineError::Build { step_id, exit_code, message },
            StepKind::PushImage => PipelineError::Push { step_id, exit_code, message },
            StepKind::DeployService => PipelineError::Deploy { step_id, exit_code, message },
            StepKind::CheckHealth => PipelineError::HealthCheck { step_id, message },
            StepKind::Run => PipelineError::Command { step_id, exit_code, message },
        }
    }

    /// Identifier of the failing step, if the error belongs to one
    pub fn step_id(&self) -> Option<&str> {
        match self {
            PipelineError::SourceFetch { step_id, .. }
            | PipelineError::Build { step_id, .. }
            | PipelineError::Push { step_id, .. }
            | PipelineError::Deploy { step_id, .. }
            | PipelineError::HealthCheck { step_id, .. }
            | PipelineError::Command { step_id, .. } => Some(step_id),
            PipelineError::Timeout { .. } | PipelineError::Stuck(_) | PipelineError::Internal(_) => {
                None
            }
        }
    }

    /// Exit code of the failing tool, if one was reported
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            PipelineError::SourceFetch { exit_code, .. }
            | PipelineError::Build { exit_code, .. }
            | PipelineError::Push { exit_code, .. }
            | PipelineError::Deploy { exit_code, .. }
            | PipelineError::Command { exit_code, .. } => Some(*exit_code),
            PipelineError::HealthCheck { .. } => Some(NO_EXIT_CODE),
            PipelineError::Timeout { .. } | PipelineError::Stuck(_) | PipelineError::Internal(_) => {
                None
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PipelineError::Timeout { .. })
    }
}
