//! CLI command definitions

use crate::execution::SchedulingStrategy;
use clap::Args;
use std::path::PathBuf;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Variable overrides (key=value)
    #[arg(long = "var", alias = "variable", value_parser = parse_key_value)]
    pub variable: Vec<(String, String)>,

    /// Cloud project the image and service belong to
    #[arg(long, env = "PROJECT_ID")]
    pub project: Option<String>,

    /// Scheduling strategy
    #[arg(long, value_enum, default_value_t = SchedulingStrategyArg::Sequential)]
    pub strategy: SchedulingStrategyArg,

    /// Maximum concurrent steps for `parallel-limited`
    #[arg(long, default_value_t = 4)]
    pub jobs: usize,

    /// Override the pipeline timeout (seconds)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,

    /// Use this directory as the workspace instead of a temporary one
    #[arg(long)]
    pub workspace: Option<PathBuf>,

    /// Keep the temporary workspace after the run
    #[arg(long)]
    pub keep_workspace: bool,

    /// Don't save execution to history
    #[arg(long)]
    pub no_history: bool,

    /// Print the plan and exit without running anything
    #[arg(long)]
    pub dry_run: bool,
}

impl RunCommand {
    pub fn scheduling_strategy(&self) -> SchedulingStrategy {
        self.strategy.to_strategy(self.jobs)
    }
}

/// Show the stages and commands a run would execute
#[derive(Debug, Args, Clone)]
pub struct PlanCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Variable overrides (key=value)
    #[arg(long = "var", alias = "variable", value_parser = parse_key_value)]
    pub variable: Vec<(String, String)>,

    /// Cloud project the image and service belong to
    #[arg(long, env = "PROJECT_ID")]
    pub project: Option<String>,
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Also check a build file against the service contract
    #[arg(long)]
    pub build_file: Option<PathBuf>,
}

/// List pipelines with recorded runs
#[derive(Debug, Args, Clone)]
pub struct ListCommand {
    /// Show execution counts
    #[arg(long)]
    pub with_counts: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show execution history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent executions to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Show full details
    #[arg(long)]
    pub verbose: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show a specific execution
    #[arg(long)]
    pub execution_id: Option<String>,
}

/// Scheduling strategy argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SchedulingStrategyArg {
    Sequential,
    Parallel,
    #[clap(name = "parallel-limited")]
    ParallelLimited,
}

impl SchedulingStrategyArg {
    pub fn to_strategy(self, jobs: usize) -> SchedulingStrategy {
        match self {
            SchedulingStrategyArg::Sequential => SchedulingStrategy::Sequential,
            SchedulingStrategyArg::Parallel => SchedulingStrategy::Parallel,
            SchedulingStrategyArg::ParallelLimited => {
                SchedulingStrategy::LimitedParallel(jobs.max(1))
            }
        }
    }
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
