//! External tool invocation
//!
//! Steps that run a process go through a [`ToolRunner`]. The real runner
//! spawns subprocesses; tests substitute a scripted one.

pub mod invocation;
pub mod subprocess;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use invocation::{build_invocation, build_paths, Invocation, InvocationError};
pub use subprocess::SubprocessRunner;

/// Which output stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives tool output line by line as it is produced
pub trait OutputCallback: Send + Sync {
    fn on_line(&self, stream: OutputStream, line: &str);
}

/// How a tool process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    /// Process exit code (`-1` when killed by a signal)
    pub exit_code: i32,

    pub duration: Duration,

    /// Last lines written to stderr, for error reports
    pub stderr_tail: Vec<String>,
}

impl ToolOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Short failure description from the captured stderr
    pub fn failure_message(&self) -> String {
        match self.stderr_tail.iter().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => line.trim().to_string(),
            None => format!("exited with code {}", self.exit_code),
        }
    }
}

/// Errors that prevent a tool from running at all
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to spawn '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("I/O error while running '{program}': {message}")]
    Io { program: String, message: String },
}

/// Trait for running external tools - allows for different implementations
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run the invocation to completion, forwarding output lines
    async fn run(
        &self,
        invocation: &Invocation,
        output: Option<&dyn OutputCallback>,
    ) -> Result<ToolOutcome, ToolError>;
}
