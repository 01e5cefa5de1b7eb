//! Persistence interfaces and backends for stepwatch-core.
//!
//! This module defines the record and patch types for the four tracked entities
//! (workflow, run, step, retry), the [`Persistence`] trait, and the PostgreSQL and
//! SQLite backends.
//!
//! Upserts are composed from single-statement primitives, so a failure never
//! leaves a row half-written. Concurrent writers are last-writer-wins per field.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TrackerError;

// ============================================================================
// Status Types
// ============================================================================

/// Status of a run. Workflows mirror the latest settled run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Created but not yet picked up by an executor.
    #[serde(alias = "PENDING")]
    Pending,
    /// Actively executing.
    #[serde(alias = "RUNNING")]
    Running,
    /// Durably sleeping until `sleep_until`.
    #[serde(alias = "SLEEPING")]
    Sleeping,
    /// Finished successfully.
    #[serde(alias = "COMPLETED")]
    Completed,
    /// Finished with an error.
    #[serde(alias = "ERRORED")]
    Errored,
}

impl RunStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Completed => "completed",
            Self::Errored => "errored",
        }
    }

    /// Settled statuses are mirrored onto the owning workflow.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Sleeping)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "sleeping" => Ok(Self::Sleeping),
            "completed" => Ok(Self::Completed),
            "errored" => Ok(Self::Errored),
            other => Err(TrackerError::validation(
                "status",
                format!("unknown run status '{}'", other),
            )),
        }
    }
}

/// Status of a step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Reported but not started.
    #[serde(alias = "PENDING")]
    Pending,
    /// Currently executing.
    #[serde(alias = "RUNNING")]
    Running,
    /// Finished successfully.
    #[serde(alias = "COMPLETED")]
    Completed,
    /// Failed with no further retries.
    #[serde(alias = "FAILED")]
    Failed,
    /// Failed and scheduled for another attempt.
    #[serde(alias = "RETRYING")]
    Retrying,
}

impl StepStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            other => Err(TrackerError::validation(
                "status",
                format!("unknown step status '{}'", other),
            )),
        }
    }
}

// ============================================================================
// Record Types
// ============================================================================

/// Workflow aggregate: identity plus a snapshot of the latest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkflowRecord {
    /// Database primary key.
    pub id: i64,
    /// Workflow name, first part of the identity key.
    pub name: String,
    /// External correlation id.
    pub ref_id: Option<String>,
    /// External correlation type.
    pub ref_type: Option<String>,
    /// Mirrors the latest settled run status.
    pub status: String,
    /// Parameters of the first run. Never rewritten.
    pub input_params: Option<Value>,
    /// Result of the latest completed run.
    pub output_result: Option<Value>,
    /// Free-form metadata.
    pub metadata: Option<Value>,
    /// Most recently started run.
    pub last_run_id: Option<String>,
    /// Number of runs started. Only ever increases.
    pub run_count: i64,
    /// When the workflow was first seen.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
    /// When a run last completed.
    pub completed_at: Option<DateTime<Utc>>,
}

/// One execution instance of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunRecord {
    /// Caller-supplied execution id.
    pub id: String,
    /// Owning workflow.
    pub workflow_id: i64,
    /// Copy of the workflow's ref_id for filtering.
    pub ref_id: Option<String>,
    /// Copy of the workflow's ref_type for filtering.
    pub ref_type: Option<String>,
    /// Current status (pending, running, sleeping, completed, errored).
    pub status: String,
    /// Run input.
    pub input_params: Option<Value>,
    /// Run result.
    pub output_result: Option<Value>,
    /// Free-form metadata.
    pub metadata: Option<Value>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
    /// When the run finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Wake-up time; only meaningful while sleeping.
    pub sleep_until: Option<DateTime<Utc>>,
}

/// One unit of work within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StepRecord {
    /// Database primary key.
    pub id: i64,
    /// Owning run.
    pub run_id: String,
    /// Caller-supplied position within the run.
    pub step_index: i32,
    /// Optional human-readable step name.
    pub name: Option<String>,
    /// Current status (pending, running, completed, failed, retrying).
    pub status: String,
    /// Step result, or error plus retry metadata on failure.
    pub state: Option<Value>,
    /// When the step started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// Append-only record of one scheduled retry of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RetryRecord {
    /// Database primary key.
    pub id: i64,
    /// Owning step.
    pub step_id: i64,
    /// 1-based attempt number.
    pub retry_count: i32,
    /// When the next attempt is scheduled.
    pub retry_at: DateTime<Utc>,
    /// Error from the failed attempt.
    pub last_error: Option<String>,
    /// When the record was appended.
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Mutation Types
// ============================================================================

/// Partial run update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunPatch {
    /// Caller-supplied run id (required).
    pub id: String,
    /// Owning workflow (required when the run does not exist yet).
    #[serde(default)]
    pub workflow_id: Option<i64>,
    #[serde(default)]
    pub ref_id: Option<String>,
    #[serde(default)]
    pub ref_type: Option<String>,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub input_params: Option<Value>,
    #[serde(default)]
    pub output_result: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
    /// Only honoured on insert.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Only honoured on insert; updates always stamp now.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sleep_until: Option<DateTime<Utc>>,
}

impl RunPatch {
    /// Start a patch for the given run id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Sleep deadline stored on insert. Only a sleeping run keeps one; updates
    /// apply the same rule against the stored status in SQL.
    pub fn effective_sleep_until(&self) -> Option<DateTime<Utc>> {
        match self.status {
            Some(RunStatus::Sleeping) => self.sleep_until,
            _ => None,
        }
    }
}

/// Partial step update, or a new step when `id` is absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepPatch {
    /// Existing step id; absent means insert.
    #[serde(default)]
    pub id: Option<i64>,
    /// Owning run (required on insert).
    #[serde(default)]
    pub run_id: Option<String>,
    /// Position within the run (required on insert).
    #[serde(default)]
    pub step_index: Option<i32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<StepStatus>,
    #[serde(default)]
    pub state: Option<Value>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepPatch {
    /// `started_at` implied by the status transition when the caller omitted it.
    pub fn implied_started_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.status {
            Some(StepStatus::Running) => Some(now),
            _ => None,
        }
    }

    /// `completed_at` implied by the status transition when the caller omitted it.
    pub fn implied_completed_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.status {
            Some(StepStatus::Completed) => Some(now),
            _ => None,
        }
    }
}

/// A validated step ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStep {
    pub run_id: String,
    pub step_index: i32,
    pub name: Option<String>,
    pub status: StepStatus,
    pub state: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl NewStep {
    /// Validate an insert patch and back-fill implied timestamps.
    pub fn from_patch(patch: &StepPatch, now: DateTime<Utc>) -> Result<Self, TrackerError> {
        let run_id = patch
            .run_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TrackerError::validation("run_id", "is required to create a step"))?;
        let step_index = patch.step_index.ok_or_else(|| {
            TrackerError::validation("step_index", "is required to create a step")
        })?;

        Ok(Self {
            run_id,
            step_index,
            name: patch.name.clone(),
            status: patch.status.unwrap_or(StepStatus::Pending),
            state: patch.state.clone(),
            started_at: patch.started_at.or(patch.implied_started_at(now)),
            completed_at: patch.completed_at.or(patch.implied_completed_at(now)),
            created_at: now,
        })
    }
}

/// A retry record to append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRetry {
    pub step_id: i64,
    pub retry_count: i32,
    pub retry_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A workflow to create on first sight of its identity key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewWorkflow {
    pub name: String,
    pub ref_id: Option<String>,
    pub ref_type: Option<String>,
    pub input_params: Option<Value>,
    pub metadata: Option<Value>,
    pub last_run_id: Option<String>,
}

/// Whether an upsert created or modified its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

impl UpsertOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted)
    }
}

// ============================================================================
// Query Types
// ============================================================================

/// Default page size for run listings.
pub const DEFAULT_RUN_LIMIT: i64 = 20;

/// Filter options for listing runs. Absent fields match everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFilter {
    pub ref_id: Option<String>,
    pub ref_type: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            ref_id: None,
            ref_type: None,
            status: None,
            limit: DEFAULT_RUN_LIMIT,
            offset: 0,
        }
    }
}

// ============================================================================
// Persistence Trait
// ============================================================================

/// Persistence interface used by the tracker components.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------------

    async fn get_workflow(&self, workflow_id: i64) -> Result<Option<WorkflowRecord>, TrackerError>;

    /// Find a workflow by identity key. Stored NULL halves of the key match any
    /// lookup value; exact matches are preferred over wildcard rows.
    async fn find_workflow(
        &self,
        name: &str,
        ref_id: Option<&str>,
        ref_type: Option<&str>,
    ) -> Result<Option<WorkflowRecord>, TrackerError>;

    /// Insert a workflow with `run_count = 1` and status running.
    ///
    /// Returns `None` when another row already holds the identity key.
    async fn insert_workflow(
        &self,
        workflow: &NewWorkflow,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, TrackerError>;

    /// Count a new run against an existing workflow and mark it running.
    async fn record_workflow_run(
        &self,
        workflow_id: i64,
        run_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, TrackerError>;

    /// Mirror a settled run status onto its workflow. On completion the output is
    /// copied (keeping the existing one when `output` is `None`) and
    /// `completed_at` is stamped.
    async fn settle_workflow(
        &self,
        workflow_id: i64,
        status: RunStatus,
        output: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, TrackerError>;

    // ------------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------------

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, TrackerError>;

    /// List runs newest first.
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, TrackerError>;

    /// Apply a partial update to an existing run. Returns false if it does not exist.
    ///
    /// `workflow_id` is never rewritten, and `sleep_until` is nulled unless the
    /// resulting status is sleeping.
    async fn update_run(&self, patch: &RunPatch, now: DateTime<Utc>) -> Result<bool, TrackerError>;

    /// Insert a new run. Returns false if the id is already taken.
    async fn insert_run(
        &self,
        patch: &RunPatch,
        workflow_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, TrackerError>;

    /// Update the run if it exists, otherwise insert it.
    async fn upsert_run(&self, patch: &RunPatch) -> Result<UpsertOutcome, TrackerError> {
        if patch.id.is_empty() {
            return Err(TrackerError::validation("id", "run id is required"));
        }

        if let Some(workflow_id) = patch.workflow_id
            && let Some(existing) = self.get_run(&patch.id).await?
            && existing.workflow_id != workflow_id
        {
            return Err(TrackerError::validation(
                "workflow_id",
                format!(
                    "run '{}' belongs to workflow {}",
                    patch.id, existing.workflow_id
                ),
            ));
        }

        let now = Utc::now();
        if self.update_run(patch, now).await? {
            return Ok(UpsertOutcome::Updated);
        }

        let workflow_id = patch.workflow_id.ok_or_else(|| {
            TrackerError::validation("workflow_id", "is required when creating a run")
        })?;
        if self.insert_run(patch, workflow_id, now).await? {
            return Ok(UpsertOutcome::Inserted);
        }

        // A concurrent caller inserted the same id between our two statements.
        if self.update_run(patch, now).await? {
            Ok(UpsertOutcome::Updated)
        } else {
            Err(TrackerError::database(
                "upsert_run",
                format!("run '{}' neither updatable nor insertable", patch.id),
            ))
        }
    }

    // ------------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------------

    async fn insert_step(&self, step: &NewStep) -> Result<i64, TrackerError>;

    /// Apply a partial update to a step by id, back-filling timestamps implied by
    /// the status. The owning `run_id` is never rewritten. Returns false if the
    /// step does not exist.
    async fn update_step(
        &self,
        step_id: i64,
        patch: &StepPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, TrackerError>;

    /// Update by id when `patch.id` is set, otherwise insert a new step.
    async fn upsert_step(&self, patch: &StepPatch) -> Result<(UpsertOutcome, i64), TrackerError> {
        let now = Utc::now();
        match patch.id {
            Some(step_id) => {
                if let Some(run_id) = patch.run_id.as_deref() {
                    let existing = self
                        .get_step(step_id)
                        .await?
                        .ok_or(TrackerError::StepNotFound { step_id })?;
                    if existing.run_id != run_id {
                        return Err(TrackerError::validation(
                            "run_id",
                            format!("step {} belongs to run '{}'", step_id, existing.run_id),
                        ));
                    }
                }

                if self.update_step(step_id, patch, now).await? {
                    Ok((UpsertOutcome::Updated, step_id))
                } else {
                    Err(TrackerError::StepNotFound { step_id })
                }
            }
            None => {
                let step = NewStep::from_patch(patch, now)?;
                let step_id = self.insert_step(&step).await?;
                Ok((UpsertOutcome::Inserted, step_id))
            }
        }
    }

    async fn get_step(&self, step_id: i64) -> Result<Option<StepRecord>, TrackerError>;

    /// Steps of a run ordered by `step_index`.
    async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, TrackerError>;

    /// Whether a step with this index already exists in the run.
    async fn step_index_exists(&self, run_id: &str, step_index: i32)
    -> Result<bool, TrackerError>;

    // ------------------------------------------------------------------------
    // Retries
    // ------------------------------------------------------------------------

    /// Append a retry record. Never deduplicates.
    async fn append_retry(&self, retry: &NewRetry) -> Result<i64, TrackerError>;

    /// Retries of a step ordered by `retry_count`.
    async fn list_retries(&self, step_id: i64) -> Result<Vec<RetryRecord>, TrackerError>;

    // ------------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------------

    async fn health_check_db(&self) -> Result<bool, TrackerError>;
}
