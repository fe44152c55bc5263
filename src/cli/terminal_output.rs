//! Terminal reporter for pipeline runs
//!
//! Prints execution events as they arrive and keeps a progress bar at the
//! bottom of the terminal. Tool output lines are only shown when streaming
//! is enabled; otherwise they go to the debug log.

use crate::cli::output::{create_progress_bar, format_execution_event, separator};
use crate::execution::ExecutionEvent;
use console::style;
use indicatif::ProgressBar;
use tracing::debug;

/// Renders [`ExecutionEvent`]s to the terminal
pub struct TerminalReporter {
    stream: bool,
    progress: ProgressBar,
}

impl TerminalReporter {
    pub fn new(stream: bool, total_steps: usize) -> Self {
        Self {
            stream,
            progress: create_progress_bar(total_steps),
        }
    }

    /// Reporter without a visible progress bar (non-interactive output)
    pub fn hidden(stream: bool) -> Self {
        Self {
            stream,
            progress: ProgressBar::hidden(),
        }
    }

    fn print(&self, line: &str) {
        if self.progress.is_hidden() {
            println!("{}", line);
        } else {
            self.progress.println(line);
        }
    }

    pub fn on_event(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::StepOutput { step_id, line, .. } => {
                if self.stream {
                    self.print(&format_execution_event(event));
                } else {
                    debug!("[{}] {}", step_id, line);
                }
                return;
            }
            ExecutionEvent::PipelineStarted { .. } => {
                self.print(&format_execution_event(event));
                self.print(&style(separator()).dim().to_string());
                return;
            }
            ExecutionEvent::StepStarted { step_id, .. } => {
                self.progress.set_message(step_id.clone());
            }
            ExecutionEvent::StepCompleted { .. } => self.progress.inc(1),
            ExecutionEvent::PipelineCompleted { .. } => {
                self.progress.finish_and_clear();
                self.print(&style(separator()).dim().to_string());
            }
            _ => {}
        }

        self.print(&format_execution_event(event));
    }
}
