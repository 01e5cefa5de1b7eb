//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::TrackerError;
use crate::migrations;

use super::{
    NewRetry, NewStep, NewWorkflow, Persistence, RetryRecord, RunFilter, RunPatch, RunRecord,
    RunStatus, StepPatch, StepRecord, WorkflowRecord,
};

const WORKFLOW_COLUMNS: &str = "id, name, ref_id, ref_type, status, input_params, output_result, \
     metadata, last_run_id, run_count, created_at, updated_at, completed_at";

const RUN_COLUMNS: &str = "id, workflow_id, ref_id, ref_type, status, input_params, output_result, \
     metadata, created_at, updated_at, completed_at, sleep_until";

const STEP_COLUMNS: &str = "id, run_id, step_index, name, status, state, started_at, completed_at, \
     created_at, updated_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The schema must already be migrated (see [`crate::migrations::run_sqlite`]).
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite URL (e.g. `sqlite::memory:` or `sqlite:data.db?mode=rwc`)
    /// and run migrations.
    pub async fn connect(url: &str) -> Result<Self, TrackerError> {
        // In-memory databases are per-connection, so they must not be pooled wider.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| TrackerError::database("connect", e))?;

        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| TrackerError::database("migrate", e))?;

        Ok(Self { pool })
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if they don't exist,
    /// then runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, TrackerError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| TrackerError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn get_workflow(&self, workflow_id: i64) -> Result<Option<WorkflowRecord>, TrackerError> {
        let record = sqlx::query_as::<_, WorkflowRecord>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?"
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_workflow(
        &self,
        name: &str,
        ref_id: Option<&str>,
        ref_type: Option<&str>,
    ) -> Result<Option<WorkflowRecord>, TrackerError> {
        let record = sqlx::query_as::<_, WorkflowRecord>(&format!(
            r#"
            SELECT {WORKFLOW_COLUMNS}
            FROM workflows
            WHERE name = ?1
              AND (ref_id IS NULL OR ref_id = ?2)
              AND (ref_type IS NULL OR ref_type = ?3)
            ORDER BY (ref_id IS NULL), (ref_type IS NULL), id
            LIMIT 1
            "#
        ))
        .bind(name)
        .bind(ref_id)
        .bind(ref_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn insert_workflow(
        &self,
        workflow: &NewWorkflow,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, TrackerError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO workflows (name, ref_id, ref_type, status, input_params, metadata,
                                   last_run_id, run_count, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'running', ?4, ?5, ?6, 1, ?7, ?7)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&workflow.name)
        .bind(workflow.ref_id.as_deref())
        .bind(workflow.ref_type.as_deref())
        .bind(workflow.input_params.as_ref())
        .bind(workflow.metadata.as_ref())
        .bind(workflow.last_run_id.as_deref())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    async fn record_workflow_run(
        &self,
        workflow_id: i64,
        run_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, TrackerError> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET run_count = run_count + 1,
                status = 'running',
                last_run_id = COALESCE(?2, last_run_id),
                updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(workflow_id)
        .bind(run_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn settle_workflow(
        &self,
        workflow_id: i64,
        status: RunStatus,
        output: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, TrackerError> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET status = ?2,
                output_result = CASE WHEN ?2 = 'completed'
                                     THEN COALESCE(?3, output_result)
                                     ELSE output_result END,
                completed_at = CASE WHEN ?2 = 'completed' THEN ?4 ELSE completed_at END,
                updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(workflow_id)
        .bind(status.as_str())
        .bind(output)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, TrackerError> {
        let record = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE id = ?"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, TrackerError> {
        let rows = sqlx::query_as::<_, RunRecord>(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM runs
            WHERE (?1 IS NULL OR ref_id = ?1)
              AND (?2 IS NULL OR ref_type = ?2)
              AND (?3 IS NULL OR status = ?3)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?4 OFFSET ?5
            "#
        ))
        .bind(filter.ref_id.as_deref())
        .bind(filter.ref_type.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn update_run(&self, patch: &RunPatch, now: DateTime<Utc>) -> Result<bool, TrackerError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET ref_id = COALESCE(?2, ref_id),
                ref_type = COALESCE(?3, ref_type),
                status = COALESCE(?4, status),
                input_params = COALESCE(?5, input_params),
                output_result = COALESCE(?6, output_result),
                metadata = COALESCE(?7, metadata),
                completed_at = COALESCE(?8, completed_at),
                sleep_until = CASE WHEN COALESCE(?4, status) = 'sleeping'
                                   THEN COALESCE(?9, sleep_until)
                                   ELSE NULL END,
                updated_at = ?10
            WHERE id = ?1
            "#,
        )
        .bind(&patch.id)
        .bind(patch.ref_id.as_deref())
        .bind(patch.ref_type.as_deref())
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.input_params.as_ref())
        .bind(patch.output_result.as_ref())
        .bind(patch.metadata.as_ref())
        .bind(patch.completed_at)
        .bind(patch.sleep_until)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_run(
        &self,
        patch: &RunPatch,
        workflow_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, TrackerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO runs (id, workflow_id, ref_id, ref_type, status, input_params,
                              output_result, metadata, created_at, updated_at, completed_at,
                              sleep_until)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&patch.id)
        .bind(workflow_id)
        .bind(patch.ref_id.as_deref())
        .bind(patch.ref_type.as_deref())
        .bind(patch.status.unwrap_or(RunStatus::Pending).as_str())
        .bind(patch.input_params.as_ref())
        .bind(patch.output_result.as_ref())
        .bind(patch.metadata.as_ref())
        .bind(patch.created_at.unwrap_or(now))
        .bind(patch.updated_at.unwrap_or(now))
        .bind(patch.completed_at)
        .bind(patch.effective_sleep_until())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_step(&self, step: &NewStep) -> Result<i64, TrackerError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO steps (run_id, step_index, name, status, state, started_at,
                               completed_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            RETURNING id
            "#,
        )
        .bind(&step.run_id)
        .bind(step.step_index)
        .bind(step.name.as_deref())
        .bind(step.status.as_str())
        .bind(step.state.as_ref())
        .bind(step.started_at)
        .bind(step.completed_at)
        .bind(step.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn update_step(
        &self,
        step_id: i64,
        patch: &StepPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, TrackerError> {
        let result = sqlx::query(
            r#"
            UPDATE steps
            SET step_index = COALESCE(?2, step_index),
                name = COALESCE(?3, name),
                status = COALESCE(?4, status),
                state = COALESCE(?5, state),
                started_at = COALESCE(?6, started_at, ?7),
                completed_at = COALESCE(?8, completed_at, ?9),
                updated_at = ?10
            WHERE id = ?1
            "#,
        )
        .bind(step_id)
        .bind(patch.step_index)
        .bind(patch.name.as_deref())
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.state.as_ref())
        .bind(patch.started_at)
        .bind(patch.implied_started_at(now))
        .bind(patch.completed_at)
        .bind(patch.implied_completed_at(now))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_step(&self, step_id: i64) -> Result<Option<StepRecord>, TrackerError> {
        let record = sqlx::query_as::<_, StepRecord>(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE id = ?"
        ))
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, TrackerError> {
        let rows = sqlx::query_as::<_, StepRecord>(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ? ORDER BY step_index ASC, id ASC"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn step_index_exists(
        &self,
        run_id: &str,
        step_index: i32,
    ) -> Result<bool, TrackerError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM steps WHERE run_id = ? AND step_index = ?")
                .bind(run_id)
                .bind(step_index)
                .fetch_one(&self.pool)
                .await?;

        Ok(count > 0)
    }

    async fn append_retry(&self, retry: &NewRetry) -> Result<i64, TrackerError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO retries (step_id, retry_count, retry_at, last_error, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING id
            "#,
        )
        .bind(retry.step_id)
        .bind(retry.retry_count)
        .bind(retry.retry_at)
        .bind(retry.last_error.as_deref())
        .bind(retry.created_at.unwrap_or_else(Utc::now))
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn list_retries(&self, step_id: i64) -> Result<Vec<RetryRecord>, TrackerError> {
        let rows = sqlx::query_as::<_, RetryRecord>(
            r#"
            SELECT id, step_id, retry_count, retry_at, last_error, created_at
            FROM retries
            WHERE step_id = ?
            ORDER BY retry_count ASC, id ASC
            "#,
        )
        .bind(step_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn health_check_db(&self) -> Result<bool, TrackerError> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
