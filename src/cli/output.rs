//! CLI output formatting

use crate::{
    core::ExecutionStatus,
    execution::ExecutionEvent,
    persistence::ExecutionSummary,
    tools::OutputStream,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏰ ", "! ");

/// Create a progress bar
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Horizontal rule spanning the terminal width
pub fn separator() -> String {
    let width = term_size::dimensions_stdout()
        .map(|(w, _)| w)
        .unwrap_or(80);
    "─".repeat(width)
}

fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Completed => style("COMPLETED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
        ExecutionStatus::TimedOut => style("TIMED OUT").red().to_string(),
    }
}

/// Format execution summary for display
pub fn format_execution_summary(summary: &ExecutionSummary) -> String {
    let status_icon = match summary.status {
        ExecutionStatus::Completed => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::TimedOut => CLOCK,
        ExecutionStatus::Running => SPINNER,
        ExecutionStatus::Pending => INFO,
    };

    let mut line = format!(
        "{} {} - {} #{} - {} ({}/{})",
        status_icon,
        style(short_id(&summary.execution_id)).dim(),
        style(&summary.pipeline_name).bold(),
        summary.build_number,
        format_status(summary.status),
        summary.completed_steps,
        summary.total_steps,
    );
    if let Some(step) = &summary.failed_step {
        let code = summary
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        line.push_str(&format!(
            " - {} {}",
            style(step).red(),
            style(format!("(exit {})", code)).dim()
        ));
    }
    line
}

/// Format a tool output line
pub fn format_output_line(step_id: &str, stream: OutputStream, line: &str) -> String {
    let prefix = format!("[{}]", step_id);
    match stream {
        OutputStream::Stdout => format!("{} {}", style(prefix).dim(), line),
        OutputStream::Stderr => format!("{} {}", style(prefix).yellow().dim(), line),
    }
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::PipelineStarted {
            execution_id,
            pipeline_name,
            image,
        } => match image {
            Some(image) => format!(
                "{} Starting pipeline {} ({}) → {}",
                ROCKET,
                style(pipeline_name).bold(),
                style(short_id(execution_id)).dim(),
                style(image).cyan()
            ),
            None => format!(
                "{} Starting pipeline {} ({})",
                ROCKET,
                style(pipeline_name).bold(),
                style(short_id(execution_id)).dim()
            ),
        },
        ExecutionEvent::StepStarted {
            step_id,
            kind,
            command,
        } => match command {
            Some(command) => format!(
                "{} {} {} {}",
                SPINNER,
                style(step_id).cyan(),
                style(format!("[{}]", kind)).dim(),
                style(command).dim()
            ),
            None => format!(
                "{} {} {}",
                SPINNER,
                style(step_id).cyan(),
                style(format!("[{}]", kind)).dim()
            ),
        },
        ExecutionEvent::StepOutput {
            step_id,
            stream,
            line,
        } => format_output_line(step_id, *stream, line),
        ExecutionEvent::StepCompleted { step_id, duration } => format!(
            "{} {} {}",
            CHECK,
            style(step_id).green(),
            style(format_duration(*duration)).dim()
        ),
        ExecutionEvent::StepFailed {
            step_id,
            error,
            exit_code,
        } => format!(
            "{} {} (exit {}): {}",
            CROSS,
            style(step_id).red(),
            exit_code,
            style(error).dim()
        ),
        ExecutionEvent::StepSkipped { step_id, reason } => {
            format!("{} {} skipped: {}", SKIP, style(step_id).dim(), reason)
        }
        ExecutionEvent::StepCancelled { step_id, reason } => {
            format!("{} {} cancelled: {}", WARN, style(step_id).yellow(), reason)
        }
        ExecutionEvent::PipelineTimedOut { timeout, running } => {
            if running.is_empty() {
                format!(
                    "{} Pipeline exceeded its {} time limit",
                    CLOCK,
                    format_duration(*timeout)
                )
            } else {
                format!(
                    "{} Pipeline exceeded its {} time limit while running {}",
                    CLOCK,
                    format_duration(*timeout),
                    style(running.join(", ")).yellow()
                )
            }
        }
        ExecutionEvent::PipelineCompleted {
            execution_id,
            status,
        } => {
            let status_str = match status {
                ExecutionStatus::Completed => {
                    format!("{} completed", style("successfully").green())
                }
                ExecutionStatus::Failed => style("failed").red().to_string(),
                ExecutionStatus::TimedOut => style("timed out").red().to_string(),
                other => format_status(*other),
            };
            format!(
                "{} Pipeline ({}) {}",
                INFO,
                style(short_id(execution_id)).dim(),
                status_str
            )
        }
    }
}

/// Human-readable duration
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
