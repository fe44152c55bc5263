//! Persistence layer for pipeline execution history

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteExecutionStore;

pub use crate::core::ExecutionStatus;
use crate::core::Pipeline;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Summary of a pipeline execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Unique execution ID
    pub execution_id: Uuid,

    /// Pipeline name
    pub pipeline_name: String,

    /// Build number the run was tagged with
    pub build_number: u64,

    /// Image reference shipped by the run
    pub image: Option<String>,

    /// Execution status
    pub status: ExecutionStatus,

    /// When execution started
    pub started_at: DateTime<Utc>,

    /// When execution completed (if complete)
    pub completed_at: Option<DateTime<Utc>>,

    /// Progress (0.0 to 1.0)
    pub progress: f64,

    /// Number of completed steps
    pub completed_steps: usize,

    /// Total number of steps
    pub total_steps: usize,

    /// Step that failed the run
    pub failed_step: Option<String>,

    /// Exit code of the failing tool
    pub exit_code: Option<i32>,

    pub error: Option<String>,
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Save a pipeline execution, replacing an earlier save of the same run
    async fn save_execution(&self, execution: &ExecutionSummary) -> Result<()>;

    /// Load an execution by ID
    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionSummary>>;

    /// List all executions for a pipeline, newest first
    async fn list_executions(&self, pipeline_name: &str) -> Result<Vec<ExecutionSummary>>;

    /// List all pipeline names
    async fn list_pipelines(&self) -> Result<Vec<String>>;

    /// Most recent execution of a pipeline
    async fn latest_execution(&self, pipeline_name: &str) -> Result<Option<ExecutionSummary>> {
        Ok(self.list_executions(pipeline_name).await?.into_iter().next())
    }

    /// Build number for the next run: one past the highest recorded
    async fn next_build_number(&self, pipeline_name: &str) -> Result<u64> {
        let highest = self
            .list_executions(pipeline_name)
            .await?
            .iter()
            .map(|e| e.build_number)
            .max()
            .unwrap_or(0);
        Ok(highest + 1)
    }
}

/// In-memory persistence (for testing or ephemeral use)
pub struct InMemoryPersistence {
    executions: RwLock<HashMap<Uuid, ExecutionSummary>>,
    by_pipeline: RwLock<HashMap<String, Vec<Uuid>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            by_pipeline: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_execution(&self, execution: &ExecutionSummary) -> Result<()> {
        let mut execs = self.executions.write().await;
        let is_new = execs
            .insert(execution.execution_id, execution.clone())
            .is_none();

        if is_new {
            let mut by_pipeline = self.by_pipeline.write().await;
            by_pipeline
                .entry(execution.pipeline_name.clone())
                .or_default()
                .push(execution.execution_id);
        }

        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionSummary>> {
        let execs = self.executions.read().await;
        Ok(execs.get(&execution_id).cloned())
    }

    async fn list_executions(&self, pipeline_name: &str) -> Result<Vec<ExecutionSummary>> {
        let execs = self.executions.read().await;
        let by_pipeline = self.by_pipeline.read().await;

        let mut result: Vec<ExecutionSummary> = by_pipeline
            .get(pipeline_name)
            .map(|ids| ids.iter().filter_map(|id| execs.get(id).cloned()).collect())
            .unwrap_or_default();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(result)
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let by_pipeline = self.by_pipeline.read().await;
        let mut names: Vec<String> = by_pipeline.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Build number for a run with no history to count from
///
/// Milliseconds since the epoch: far above any counted build number and
/// different on every run, so the default `build-N` tag is never reused.
pub fn untracked_build_number() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(1)
}

/// Create a summary from a pipeline
pub fn create_summary(pipeline: &Pipeline) -> ExecutionSummary {
    ExecutionSummary {
        execution_id: pipeline.state.execution_id,
        pipeline_name: pipeline.name.clone(),
        build_number: pipeline.build_number,
        image: pipeline.context.image.as_ref().map(ToString::to_string),
        status: pipeline.state.status,
        started_at: pipeline.state.started_at.unwrap_or_else(Utc::now),
        completed_at: pipeline.state.completed_at,
        progress: pipeline.state.progress(),
        completed_steps: pipeline.state.completed_steps,
        total_steps: pipeline.state.total_steps,
        failed_step: pipeline.state.failed_step.clone(),
        exit_code: pipeline.state.exit_code,
        error: pipeline.state.error.clone(),
    }
}
