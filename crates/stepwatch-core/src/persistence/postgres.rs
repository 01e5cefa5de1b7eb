// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence for stepwatch-core.
//!
//! Storage access functions for workflows, runs, steps and retries. The
//! [`PostgresPersistence`] trait impl delegates to these free functions.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use crate::error::TrackerError;

use super::{
    NewRetry, NewStep, NewWorkflow, Persistence, RetryRecord, RunFilter, RunPatch, RunRecord,
    RunStatus, StepPatch, StepRecord, WorkflowRecord,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Workflow Operations
// ============================================================================

/// Get a workflow by ID.
pub async fn get_workflow(
    pool: &PgPool,
    workflow_id: i64,
) -> Result<Option<WorkflowRecord>, TrackerError> {
    let record = sqlx::query_as::<_, WorkflowRecord>(
        r#"
        SELECT id, name, ref_id, ref_type, status, input_params, output_result, metadata,
               last_run_id, run_count, created_at, updated_at, completed_at
        FROM workflows
        WHERE id = $1
        "#,
    )
    .bind(workflow_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Find a workflow by identity key, preferring exact matches over NULL wildcards.
pub async fn find_workflow(
    pool: &PgPool,
    name: &str,
    ref_id: Option<&str>,
    ref_type: Option<&str>,
) -> Result<Option<WorkflowRecord>, TrackerError> {
    let record = sqlx::query_as::<_, WorkflowRecord>(
        r#"
        SELECT id, name, ref_id, ref_type, status, input_params, output_result, metadata,
               last_run_id, run_count, created_at, updated_at, completed_at
        FROM workflows
        WHERE name = $1
          AND (ref_id IS NULL OR ref_id = $2::TEXT)
          AND (ref_type IS NULL OR ref_type = $3::TEXT)
        ORDER BY (ref_id IS NULL), (ref_type IS NULL), id
        LIMIT 1
        "#,
    )
    .bind(name)
    .bind(ref_id)
    .bind(ref_type)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Insert a workflow on first sight. Returns `None` if the identity key is taken.
pub async fn insert_workflow(
    pool: &PgPool,
    workflow: &NewWorkflow,
    now: DateTime<Utc>,
) -> Result<Option<i64>, TrackerError> {
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO workflows (name, ref_id, ref_type, status, input_params, metadata,
                               last_run_id, run_count, created_at, updated_at)
        VALUES ($1, $2, $3, 'running', $4, $5, $6, 1, $7, $7)
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
    .fetch_optional(pool)
    .await?;

    Ok(id)
}

/// Count a new run against a workflow.
pub async fn record_workflow_run(
    pool: &PgPool,
    workflow_id: i64,
    run_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, TrackerError> {
    let result = sqlx::query(
        r#"
        UPDATE workflows
        SET run_count = run_count + 1,
            status = 'running',
            last_run_id = COALESCE($2::TEXT, last_run_id),
            updated_at = $3
        WHERE id = $1
        "#,
    )
    .bind(workflow_id)
    .bind(run_id)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Mirror a settled run status onto its workflow.
pub async fn settle_workflow(
    pool: &PgPool,
    workflow_id: i64,
    status: RunStatus,
    output: Option<&Value>,
    now: DateTime<Utc>,
) -> Result<bool, TrackerError> {
    let result = sqlx::query(
        r#"
        UPDATE workflows
        SET status = $2::TEXT,
            output_result = CASE WHEN $2::TEXT = 'completed'
                                 THEN COALESCE($3::JSONB, output_result)
                                 ELSE output_result END,
            completed_at = CASE WHEN $2::TEXT = 'completed' THEN $4 ELSE completed_at END,
            updated_at = $4
        WHERE id = $1
        "#,
    )
    .bind(workflow_id)
    .bind(status.as_str())
    .bind(output)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Run Operations
// ============================================================================

/// Get a run by ID.
pub async fn get_run(pool: &PgPool, run_id: &str) -> Result<Option<RunRecord>, TrackerError> {
    let record = sqlx::query_as::<_, RunRecord>(
        r#"
        SELECT id, workflow_id, ref_id, ref_type, status, input_params, output_result,
               metadata, created_at, updated_at, completed_at, sleep_until
        FROM runs
        WHERE id = $1
        "#,
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// List runs with optional filtering, newest first.
pub async fn list_runs(pool: &PgPool, filter: &RunFilter) -> Result<Vec<RunRecord>, TrackerError> {
    let rows = sqlx::query_as::<_, RunRecord>(
        r#"
        SELECT id, workflow_id, ref_id, ref_type, status, input_params, output_result,
               metadata, created_at, updated_at, completed_at, sleep_until
        FROM runs
        WHERE ($1::TEXT IS NULL OR ref_id = $1)
          AND ($2::TEXT IS NULL OR ref_type = $2)
          AND ($3::TEXT IS NULL OR status = $3)
        ORDER BY created_at DESC, seq DESC
        LIMIT $4 OFFSET $5
        "#,
    )
    .bind(filter.ref_id.as_deref())
    .bind(filter.ref_type.as_deref())
    .bind(filter.status.map(|s| s.as_str()))
    .bind(filter.limit)
    .bind(filter.offset)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Apply a partial update to a run.
pub async fn update_run(
    pool: &PgPool,
    patch: &RunPatch,
    now: DateTime<Utc>,
) -> Result<bool, TrackerError> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET ref_id = COALESCE($2::TEXT, ref_id),
            ref_type = COALESCE($3::TEXT, ref_type),
            status = COALESCE($4::TEXT, status),
            input_params = COALESCE($5::JSONB, input_params),
            output_result = COALESCE($6::JSONB, output_result),
            metadata = COALESCE($7::JSONB, metadata),
            completed_at = COALESCE($8::TIMESTAMPTZ, completed_at),
            sleep_until = CASE WHEN COALESCE($4::TEXT, status) = 'sleeping'
                               THEN COALESCE($9::TIMESTAMPTZ, sleep_until)
                               ELSE NULL END,
            updated_at = $10
        WHERE id = $1
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
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Insert a run. Returns false if the ID is already taken.
pub async fn insert_run(
    pool: &PgPool,
    patch: &RunPatch,
    workflow_id: i64,
    now: DateTime<Utc>,
) -> Result<bool, TrackerError> {
    let result = sqlx::query(
        r#"
        INSERT INTO runs (id, workflow_id, ref_id, ref_type, status, input_params,
                          output_result, metadata, created_at, updated_at, completed_at,
                          sleep_until)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
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
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Step Operations
// ============================================================================

/// Insert a step and return its ID.
pub async fn insert_step(pool: &PgPool, step: &NewStep) -> Result<i64, TrackerError> {
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO steps (run_id, step_index, name, status, state, started_at, completed_at,
                           created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
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
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// Apply a partial update to a step, back-filling implied timestamps.
pub async fn update_step(
    pool: &PgPool,
    step_id: i64,
    patch: &StepPatch,
    now: DateTime<Utc>,
) -> Result<bool, TrackerError> {
    let result = sqlx::query(
        r#"
        UPDATE steps
        SET step_index = COALESCE($2::INTEGER, step_index),
            name = COALESCE($3::TEXT, name),
            status = COALESCE($4::TEXT, status),
            state = COALESCE($5::JSONB, state),
            started_at = COALESCE($6::TIMESTAMPTZ, started_at, $7::TIMESTAMPTZ),
            completed_at = COALESCE($8::TIMESTAMPTZ, completed_at, $9::TIMESTAMPTZ),
            updated_at = $10
        WHERE id = $1
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
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Get a step by ID.
pub async fn get_step(pool: &PgPool, step_id: i64) -> Result<Option<StepRecord>, TrackerError> {
    let record = sqlx::query_as::<_, StepRecord>(
        r#"
        SELECT id, run_id, step_index, name, status, state, started_at, completed_at,
               created_at, updated_at
        FROM steps
        WHERE id = $1
        "#,
    )
    .bind(step_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// List the steps of a run ordered by index.
pub async fn list_steps(pool: &PgPool, run_id: &str) -> Result<Vec<StepRecord>, TrackerError> {
    let rows = sqlx::query_as::<_, StepRecord>(
        r#"
        SELECT id, run_id, step_index, name, status, state, started_at, completed_at,
               created_at, updated_at
        FROM steps
        WHERE run_id = $1
        ORDER BY step_index ASC, id ASC
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Check whether a run already has a step at this index.
pub async fn step_index_exists(
    pool: &PgPool,
    run_id: &str,
    step_index: i32,
) -> Result<bool, TrackerError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM steps WHERE run_id = $1 AND step_index = $2)",
    )
    .bind(run_id)
    .bind(step_index)
    .fetch_one(pool)
    .await?;

    Ok(exists)
}

// ============================================================================
// Retry Operations
// ============================================================================

/// Append a retry record and return its ID.
pub async fn append_retry(pool: &PgPool, retry: &NewRetry) -> Result<i64, TrackerError> {
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO retries (step_id, retry_count, retry_at, last_error, created_at)
        VALUES ($1, $2, $3, $4, COALESCE($5, NOW()))
        RETURNING id
        "#,
    )
    .bind(retry.step_id)
    .bind(retry.retry_count)
    .bind(retry.retry_at)
    .bind(retry.last_error.as_deref())
    .bind(retry.created_at)
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// List the retries of a step in attempt order.
pub async fn list_retries(pool: &PgPool, step_id: i64) -> Result<Vec<RetryRecord>, TrackerError> {
    let rows = sqlx::query_as::<_, RetryRecord>(
        r#"
        SELECT id, step_id, retry_count, retry_at, last_error, created_at
        FROM retries
        WHERE step_id = $1
        ORDER BY retry_count ASC, id ASC
        "#,
    )
    .bind(step_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Check database connectivity.
pub async fn health_check_db(pool: &PgPool) -> Result<bool, TrackerError> {
    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(pool).await?;
    Ok(row.0 == 1)
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn get_workflow(&self, workflow_id: i64) -> Result<Option<WorkflowRecord>, TrackerError> {
        get_workflow(&self.pool, workflow_id).await
    }

    async fn find_workflow(
        &self,
        name: &str,
        ref_id: Option<&str>,
        ref_type: Option<&str>,
    ) -> Result<Option<WorkflowRecord>, TrackerError> {
        find_workflow(&self.pool, name, ref_id, ref_type).await
    }

    async fn insert_workflow(
        &self,
        workflow: &NewWorkflow,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, TrackerError> {
        insert_workflow(&self.pool, workflow, now).await
    }

    async fn record_workflow_run(
        &self,
        workflow_id: i64,
        run_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, TrackerError> {
        record_workflow_run(&self.pool, workflow_id, run_id, now).await
    }

    async fn settle_workflow(
        &self,
        workflow_id: i64,
        status: RunStatus,
        output: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, TrackerError> {
        settle_workflow(&self.pool, workflow_id, status, output, now).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, TrackerError> {
        get_run(&self.pool, run_id).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, TrackerError> {
        list_runs(&self.pool, filter).await
    }

    async fn update_run(&self, patch: &RunPatch, now: DateTime<Utc>) -> Result<bool, TrackerError> {
        update_run(&self.pool, patch, now).await
    }

    async fn insert_run(
        &self,
        patch: &RunPatch,
        workflow_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, TrackerError> {
        insert_run(&self.pool, patch, workflow_id, now).await
    }

    async fn insert_step(&self, step: &NewStep) -> Result<i64, TrackerError> {
        insert_step(&self.pool, step).await
    }

    async fn update_step(
        &self,
        step_id: i64,
        patch: &StepPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, TrackerError> {
        update_step(&self.pool, step_id, patch, now).await
    }

    async fn get_step(&self, step_id: i64) -> Result<Option<StepRecord>, TrackerError> {
        get_step(&self.pool, step_id).await
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, TrackerError> {
        list_steps(&self.pool, run_id).await
    }

    async fn step_index_exists(
        &self,
        run_id: &str,
        step_index: i32,
    ) -> Result<bool, TrackerError> {
        step_index_exists(&self.pool, run_id, step_index).await
    }

    async fn append_retry(&self, retry: &NewRetry) -> Result<i64, TrackerError> {
        append_retry(&self.pool, retry).await
    }

    async fn list_retries(&self, step_id: i64) -> Result<Vec<RetryRecord>, TrackerError> {
        list_retries(&self.pool, step_id).await
    }

    async fn health_check_db(&self) -> Result<bool, TrackerError> {
        health_check_db(&self.pool).await
    }
}
