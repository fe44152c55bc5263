use anyhow::{Context, Result};
use deploy_pipeline::cli::commands::{
    HistoryCommand, ListCommand, PlanCommand, RunCommand, ValidateCommand,
};
use deploy_pipeline::cli::output::*;
use deploy_pipeline::cli::terminal_output::TerminalReporter;
use deploy_pipeline::cli::{Cli, Command};
use deploy_pipeline::core::{buildfile::BuildFile, config::PipelineConfig, step::StepAction};
use deploy_pipeline::core::{ExecutionStatus, Pipeline, RunInputs};
use deploy_pipeline::execution::ExecutionEngine;
use deploy_pipeline::persistence::{
    create_summary, untracked_build_number, ExecutionSummary, PersistenceBackend,
    SqliteExecutionStore,
};
use deploy_pipeline::tools::{build_invocation, SubprocessRunner};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    // Execute command
    let success = match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd, cli.stream).await?,
        Command::Plan(cmd) => plan_pipeline(cmd).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::List(cmd) => list_pipelines(cmd).await?,
        Command::History(cmd) => show_history(cmd).await?,
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

async fn open_store(no_history: bool) -> Result<Option<Arc<dyn PersistenceBackend>>> {
    if no_history {
        return Ok(None);
    }
    let store: Arc<dyn PersistenceBackend> =
        Arc::new(SqliteExecutionStore::with_default_path().await?);
    Ok(Some(store))
}

/// Load the pipeline file and resolve every run input
async fn load_pipeline(
    file: &Path,
    variables: &[(String, String)],
    project: Option<String>,
    workspace: PathBuf,
    store: Option<&dyn PersistenceBackend>,
) -> Result<Pipeline> {
    let config = PipelineConfig::from_file(file)
        .with_context(|| format!("Failed to load pipeline config {}", file.display()))?;
    let mut pipeline = config.to_pipeline();

    let build_number = match store {
        Some(store) => store.next_build_number(&pipeline.name).await?,
        None => {
            let build_number = untracked_build_number();
            info!("No build history; using build number {}", build_number);
            build_number
        }
    };
    let overrides: HashMap<String, String> = variables.iter().cloned().collect();
    for (key, value) in &overrides {
        debug!("Variable override: {} = {}", key, value);
    }

    pipeline.prepare(RunInputs {
        workspace,
        build_number,
        project_id: project,
        overrides,
    })?;

    Ok(pipeline)
}

async fn run_pipeline(cmd: &RunCommand, stream: bool) -> Result<bool> {
    let store = open_store(cmd.no_history).await?;

    // Fresh workspace per run unless one is given
    let (workspace, temp_dir) = match &cmd.workspace {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create workspace {}", dir.display()))?;
            (dir.clone(), None)
        }
        None => {
            let temp_dir = tempfile::Builder::new()
                .prefix("deploy-pipeline-")
                .tempdir()
                .context("Failed to create workspace")?;
            (temp_dir.path().to_path_buf(), Some(temp_dir))
        }
    };

    let mut pipeline = load_pipeline(
        &cmd.file,
        &cmd.variable,
        cmd.project.clone(),
        workspace.clone(),
        store.as_deref(),
    )
    .await?;
    if let Some(secs) = cmd.timeout {
        pipeline.timeout = Duration::from_secs(secs);
    }

    println!(
        "{} Loaded pipeline: {} (build #{})",
        INFO,
        style(&pipeline.name).bold(),
        pipeline.build_number
    );

    if cmd.dry_run {
        print_plan(&pipeline);
        return Ok(true);
    }

    let engine = ExecutionEngine::new(SubprocessRunner::new(), cmd.scheduling_strategy());
    let reporter = Arc::new(if console::user_attended() {
        TerminalReporter::new(stream, pipeline.steps.len())
    } else {
        TerminalReporter::hidden(stream)
    });
    let handler = Arc::clone(&reporter);
    engine.add_event_handler(move |event| handler.on_event(&event));

    // Execute pipeline
    println!();
    let result = engine.execute(&mut pipeline).await;

    // Save to history
    if let Some(store) = &store {
        let summary = create_summary(&pipeline);
        match store.save_execution(&summary).await {
            Ok(()) => println!(
                "\n{} Execution saved to history (ID: {})",
                INFO,
                style(&summary.execution_id.to_string()[..8]).dim()
            ),
            Err(e) => warn!("Failed to save execution history: {:#}", e),
        }
    }

    match temp_dir {
        Some(temp_dir) if cmd.keep_workspace => {
            let kept = temp_dir.keep();
            println!("{} Workspace kept at {}", INFO, style(kept.display()).dim());
        }
        Some(temp_dir) => {
            if let Err(e) = temp_dir.close() {
                warn!("Failed to remove workspace {}: {}", workspace.display(), e);
            }
        }
        None => {}
    }

    // Print final status
    match result {
        Ok(()) => {
            println!(
                "\n{} {} completed {} ({})",
                CHECK,
                style(&pipeline.name).bold(),
                style("successfully").green(),
                pipeline
                    .context
                    .image
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default()
            );
            Ok(true)
        }
        Err(e) => {
            let failure = match (e.step_id(), e.exit_code()) {
                (Some(step), Some(code)) => format!("step {} exited with code {}", style(step).red(), code),
                _ => style(e.to_string()).red().to_string(),
            };
            println!(
                "\n{} {} {}: {}",
                CROSS,
                style(&pipeline.name).bold(),
                style("failed").red(),
                failure
            );
            error!("{}", e);
            Ok(false)
        }
    }
}

async fn plan_pipeline(cmd: &PlanCommand) -> Result<bool> {
    // Show the build number the next real run would get
    let history = match SqliteExecutionStore::with_default_path().await {
        Ok(store) => Some(store),
        Err(e) => {
            debug!("History unavailable, planning build #1: {:#}", e);
            None
        }
    };

    let pipeline = load_pipeline(
        &cmd.file,
        &cmd.variable,
        cmd.project.clone(),
        PathBuf::from("<workspace>"),
        history.as_ref().map(|store| store as &dyn PersistenceBackend),
    )
    .await?;

    print_plan(&pipeline);
    Ok(true)
}

fn print_plan(pipeline: &Pipeline) {
    println!("{} Plan for {}", INFO, style(&pipeline.name).bold());
    if let Some(image) = &pipeline.context.image {
        println!("  Image: {}", style(image).cyan());
    }
    println!("  Timeout: {}", format_duration(pipeline.timeout));
    if let Some(machine_type) = &pipeline.machine_type {
        println!("  Machine type: {}", style(machine_type).dim());
    }

    for (index, stage) in pipeline.stages().iter().enumerate() {
        println!("\n  {}", style(format!("Stage {}", index + 1)).bold());
        for step_id in stage {
            let Some(step) = pipeline.step(step_id) else {
                continue;
            };
            let context = pipeline.create_context_for_step(step_id);
            let detail = match &step.action {
                StepAction::CheckHealth { url, .. } => context
                    .render(url)
                    .map(|url| format!("GET {}", url))
                    .unwrap_or_else(|e| e.to_string()),
                _ => match build_invocation(step, &context, &pipeline.tools) {
                    Ok(invocation) => invocation.command_line(),
                    Err(e) => style(e.to_string()).red().to_string(),
                },
            };
            println!(
                "    {} {} {}",
                style(&step.id).cyan(),
                style(format!("[{}]", step.kind())).dim(),
                detail
            );
        }
    }
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<bool> {
    println!("{} Validating pipeline...", INFO);

    let config = match PipelineConfig::from_file(&cmd.file) {
        Ok(config) => config,
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            return Ok(false);
        }
    };

    println!("{} Pipeline configuration is valid!", CHECK);
    println!("  Name: {}", style(&config.name).bold());
    println!("  Steps: {}", style(config.steps.len()).cyan());
    println!("  Timeout: {}s", style(config.timeout_secs()).cyan());
    let mut variables: Vec<String> = config.referenced_variables().into_iter().collect();
    variables.sort();
    println!("  Variables referenced: {}", style(variables.join(", ")).dim());

    let mut valid = true;
    if let Some(path) = &cmd.build_file {
        valid = validate_build_file(path);
    }

    if cmd.json {
        let json = serde_json::to_string_pretty(&config)?;
        println!("\n{}", json);
    }
    Ok(valid)
}

fn validate_build_file(path: &Path) -> bool {
    let build_file = match BuildFile::from_file(path) {
        Ok(build_file) => build_file,
        Err(e) => {
            println!("{} Build file {}: {}", CROSS, path.display(), style(e).red());
            return false;
        }
    };

    match build_file.contract() {
        Ok(contract) => {
            let probe = contract.probe_settings();
            println!("{} Build file {} parsed", CHECK, path.display());
            println!("  Port: {}", style(contract.port).cyan());
            println!(
                "  Liveness: {} every {} (timeout {}, retries {})",
                style(&probe.path).cyan(),
                format_duration(probe.interval),
                format_duration(probe.timeout),
                probe.retries
            );
        }
        Err(e) => {
            println!("{} Build file {}: {}", CROSS, path.display(), style(e).red());
            return false;
        }
    }

    for issue in build_file.contract_issues() {
        println!("  {} {}", WARN, issue);
    }
    true
}

async fn list_pipelines(cmd: &ListCommand) -> Result<bool> {
    let store = SqliteExecutionStore::with_default_path().await?;
    let pipelines = store.list_pipelines().await?;

    if pipelines.is_empty() {
        println!("{} No pipelines found in history", INFO);
        return Ok(true);
    }

    let mut json_data = Vec::new();
    if !cmd.json {
        println!("{} Pipelines in history:", INFO);
    }

    for pipeline_name in &pipelines {
        let executions = store.list_executions(pipeline_name).await?;
        let completed = executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Completed)
            .count();
        let failed = executions.len() - completed;

        if cmd.json {
            json_data.push(serde_json::json!({
                "name": pipeline_name,
                "execution_count": executions.len(),
                "succeeded": completed,
                "failed": failed,
                "latest_build": executions.iter().map(|e| e.build_number).max(),
            }));
        } else if cmd.with_counts {
            println!(
                "  {} ({} runs: {} succeeded, {} failed)",
                style(pipeline_name).bold(),
                style(executions.len()).cyan(),
                style(completed).green(),
                style(failed).red()
            );
        } else {
            println!("  {}", style(pipeline_name).bold());
        }
    }

    if cmd.json {
        let data = serde_json::json!({ "pipelines": json_data });
        println!("{}", serde_json::to_string_pretty(&data)?);
    }

    Ok(true)
}

async fn show_history(cmd: &HistoryCommand) -> Result<bool> {
    let store = SqliteExecutionStore::with_default_path().await?;

    // If specific execution ID is requested
    if let Some(exec_id_str) = &cmd.execution_id {
        let exec_id = uuid::Uuid::parse_str(exec_id_str).context("Invalid execution ID format")?;

        return match store.load_execution(exec_id).await? {
            Some(summary) if cmd.json => {
                println!("{}", serde_json::to_string_pretty(&summary)?);
                Ok(true)
            }
            Some(summary) => {
                print_execution_details(&summary, cmd.verbose)?;
                Ok(true)
            }
            None => {
                println!("{} Execution not found", WARN);
                Ok(false)
            }
        };
    }

    // List executions for pipeline or all
    let mut executions = match &cmd.pipeline {
        Some(pipeline_name) => store.list_executions(pipeline_name).await?,
        None => {
            let mut all_execs = Vec::new();
            for pipeline in store.list_pipelines().await? {
                all_execs.extend(store.list_executions(&pipeline).await?);
            }
            all_execs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            all_execs
        }
    };
    executions.truncate(cmd.limit);

    if cmd.json {
        let data = serde_json::json!({ "executions": executions });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(true);
    }

    if executions.is_empty() {
        println!("{} No executions found", INFO);
        return Ok(true);
    }

    println!("{} Execution history (showing latest {}):", INFO, executions.len());
    for summary in &executions {
        println!("  {}", format_execution_summary(summary));
        if cmd.verbose {
            if let Some(error) = &summary.error {
                println!("      {}", style(error).dim());
            }
        }
    }

    Ok(true)
}

fn print_execution_details(summary: &ExecutionSummary, verbose: bool) -> Result<()> {
    println!("{} Execution Details", INFO);
    println!("  ID: {}", style(summary.execution_id).cyan());
    println!("  Pipeline: {}", style(&summary.pipeline_name).bold());
    println!("  Build: #{}", summary.build_number);
    if let Some(image) = &summary.image {
        println!("  Image: {}", style(image).cyan());
    }
    println!("  Status: {}", format_status(summary.status));
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    if let Some(completed) = summary.completed_at {
        println!("  Completed: {}", style(completed.to_rfc3339()).dim());
        if let Ok(duration) = completed.signed_duration_since(summary.started_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    println!(
        "  Progress: {} ({}/{})",
        style(format!("{:.0}%", summary.progress * 100.0)).cyan(),
        summary.completed_steps,
        summary.total_steps
    );
    if let Some(step) = &summary.failed_step {
        println!(
            "  Failed step: {} (exit code {})",
            style(step).red(),
            summary
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }

    if verbose {
        println!("\n  {}", style("Full details:").bold());
        let json = serde_json::to_string_pretty(summary)?;
        for line in json.lines() {
            println!("    {}", line);
        }
    }

    Ok(())
}
