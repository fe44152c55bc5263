//! SQLite-based persistence store

use crate::core::ExecutionStatus;
use crate::persistence::{ExecutionSummary, PersistenceBackend};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

const SUMMARY_COLUMNS: &str = "id, pipeline_name, build_number, image, status, started_at, \
     completed_at, progress, completed_steps, total_steps, failed_step, exit_code, error";

/// SQLite execution store
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    /// Create a new SQLite store; `:memory:` opens a private in-memory database
    pub async fn new(db_path: &str) -> Result<Self> {
        let (options, max_connections) = if db_path == ":memory:" {
            (SqliteConnectOptions::from_str("sqlite::memory:")?, 1)
        } else {
            (
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .create_if_missing(true),
                4,
            )
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("deploy-pipeline");
        std::fs::create_dir_all(&db_dir)
            .with_context(|| format!("Failed to create {}", db_dir.display()))?;

        let db_path = db_dir.join("executions.db");
        Self::new(&db_path.to_string_lossy()).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                pipeline_name TEXT NOT NULL,
                build_number INTEGER NOT NULL DEFAULT 0,
                image TEXT,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                progress REAL NOT NULL DEFAULT 0.0,
                completed_steps INTEGER NOT NULL DEFAULT 0,
                total_steps INTEGER NOT NULL DEFAULT 0,
                failed_step TEXT,
                exit_code INTEGER,
                error TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_pipeline_name ON executions(pipeline_name);
            CREATE INDEX IF NOT EXISTS idx_status ON executions(status);
            CREATE INDEX IF NOT EXISTS idx_started_at ON executions(started_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn summary_from_row(row: &SqliteRow) -> Result<ExecutionSummary> {
        Ok(ExecutionSummary {
            execution_id: Uuid::parse_str(&row.try_get::<String, _>("id")?)?,
            pipeline_name: row.try_get("pipeline_name")?,
            build_number: row.try_get::<i64, _>("build_number")?.max(0) as u64,
            image: row.try_get("image")?,
            status: ExecutionStatus::parse(&row.try_get::<String, _>("status")?),
            started_at: Self::from_naive(row.try_get("started_at")?),
            completed_at: row
                .try_get::<Option<NaiveDateTime>, _>("completed_at")?
                .map(Self::from_naive),
            progress: row.try_get("progress")?,
            completed_steps: row.try_get::<i64, _>("completed_steps")? as usize,
            total_steps: row.try_get::<i64, _>("total_steps")? as usize,
            failed_step: row.try_get("failed_step")?,
            exit_code: row.try_get("exit_code")?,
            error: row.try_get("error")?,
        })
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for SqliteExecutionStore {
    async fn save_execution(&self, execution: &ExecutionSummary) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO executions
            (id, pipeline_name, build_number, image, status, started_at, completed_at,
             progress, completed_steps, total_steps, failed_step, exit_code, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(execution.execution_id.to_string())
        .bind(&execution.pipeline_name)
        .bind(execution.build_number as i64)
        .bind(&execution.image)
        .bind(execution.status.as_str())
        .bind(Self::to_naive(execution.started_at))
        .bind(execution.completed_at.map(Self::to_naive))
        .bind(execution.progress)
        .bind(execution.completed_steps as i64)
        .bind(execution.total_steps as i64)
        .bind(&execution.failed_step)
        .bind(execution.exit_code)
        .bind(&execution.error)
        .execute(&self.pool)
        .await
        .context("Failed to save execution")?;

        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionSummary>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM executions WHERE id = ?1",
            SUMMARY_COLUMNS
        ))
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load execution")?;

        row.as_ref().map(Self::summary_from_row).transpose()
    }

    async fn list_executions(&self, pipeline_name: &str) -> Result<Vec<ExecutionSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM executions WHERE pipeline_name = ?1 ORDER BY started_at DESC",
            SUMMARY_COLUMNS
        ))
        .bind(pipeline_name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list executions")?;

        rows.iter().map(Self::summary_from_row).collect()
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT pipeline_name
            FROM executions
            ORDER BY pipeline_name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list pipelines")?;

        Ok(rows.iter().map(|row| row.get("pipeline_name")).collect())
    }

    async fn latest_execution(&self, pipeline_name: &str) -> Result<Option<ExecutionSummary>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM executions WHERE pipeline_name = ?1 ORDER BY started_at DESC LIMIT 1",
            SUMMARY_COLUMNS
        ))
        .bind(pipeline_name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get latest execution")?;

        row.as_ref().map(Self::summary_from_row).transpose()
    }

    async fn next_build_number(&self, pipeline_name: &str) -> Result<u64> {
        let highest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(build_number) FROM executions WHERE pipeline_name = ?1")
                .bind(pipeline_name)
                .fetch_one(&self.pool)
                .await
                .context("Failed to read build numbers")?;

        Ok(highest.unwrap_or(0).max(0) as u64 + 1)
    }
}
