// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The tracker service: mutation, query and live-channel operations.
//!
//! [`Tracker`] composes the storage layer with the resolver, the status
//! propagator, the query aggregator and the hub registry. Mutations and their
//! broadcasts are separate calls: a failed broadcast never rolls back a write.

use std::ops::Not;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::broadcast::{BroadcastHub, BroadcastReport, HubRegistry, ObserverId, ObserverSink};
use crate::error::{Result, TrackerError};
use crate::legacy;
use crate::persistence::{
    NewRetry, Persistence, RunPatch, RunStatus, StepPatch, StepStatus, UpsertOutcome,
    WorkflowRecord,
};
use crate::propagation::{PropagationOutcome, StatusPropagator};
use crate::query::{QueryAggregator, RunQuery, RunTree};
use crate::resolver::{WorkflowKey, WorkflowResolver};
use crate::retry::{RetryDecision, RetryPolicy, StepError};

/// Partition used when none is configured.
pub const DEFAULT_PARTITION: &str = "workflow-tracker";

// ============================================================================
// Request / Response Types
// ============================================================================

/// Acknowledgement of a mutation: `{ "inserted": true, "id": .. }` or
/// `{ "updated": true, "id": .. }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationAck<I> {
    #[serde(default, skip_serializing_if = "Not::not")]
    pub inserted: bool,
    #[serde(default, skip_serializing_if = "Not::not")]
    pub updated: bool,
    pub id: I,
}

impl<I> MutationAck<I> {
    pub fn from_outcome(outcome: UpsertOutcome, id: I) -> Self {
        Self {
            inserted: outcome.is_inserted(),
            updated: !outcome.is_inserted(),
            id,
        }
    }

    pub fn inserted(id: I) -> Self {
        Self::from_outcome(UpsertOutcome::Inserted, id)
    }
}

/// Result of [`Tracker::upsert_run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunUpsert {
    #[serde(flatten)]
    pub ack: MutationAck<String>,
    /// Side effect on the owning workflow. Never a mutation failure.
    pub propagation: PropagationOutcome,
}

/// Request to start a workflow run.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StartWorkflowRequest {
    pub name: String,
    /// Execution id; generated when absent.
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default, alias = "params")]
    pub input_params: Option<Value>,
    #[serde(default)]
    pub ref_id: Option<String>,
    #[serde(default)]
    pub ref_type: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Result of [`Tracker::start_workflow`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartedWorkflow {
    pub workflow_id: i64,
    pub run_id: String,
    pub ref_id: Option<String>,
    pub ref_type: Option<String>,
}

/// A failed step attempt.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StepFailureReport {
    pub run_id: String,
    pub step_index: i32,
    /// Existing step row; looked up by `(run_id, step_index)` when absent.
    #[serde(default)]
    pub step_id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    pub error: StepError,
}

/// Result of [`Tracker::report_step_failure`].
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailureOutcome {
    pub step_id: i64,
    /// The error annotated with its retry state.
    pub error: StepError,
    /// `None` when the error was already non-retryable.
    pub decision: Option<RetryDecision>,
    /// The retry record appended, if the step will be retried.
    pub retry_id: Option<i64>,
}

fn run_exists(run_id: &str) -> TrackerError {
    TrackerError::validation("run_id", format!("run '{}' already exists", run_id))
}

// ============================================================================
// Tracker
// ============================================================================

/// Workflow state tracker.
#[derive(Clone)]
pub struct Tracker {
    persistence: Arc<dyn Persistence>,
    resolver: WorkflowResolver,
    propagator: StatusPropagator,
    query: QueryAggregator,
    hubs: Arc<HubRegistry>,
    partition: String,
    strict_step_indices: bool,
}

impl Tracker {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        let query = QueryAggregator::new(persistence.clone());
        Self {
            resolver: WorkflowResolver::new(persistence.clone()),
            propagator: StatusPropagator::new(persistence.clone()),
            hubs: Arc::new(HubRegistry::new(query.clone())),
            query,
            persistence,
            partition: DEFAULT_PARTITION.to_string(),
            strict_step_indices: false,
        }
    }

    /// Use `partition` as the default live-channel partition.
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    /// Reject step inserts with a negative or already used `step_index`.
    pub fn with_strict_step_indices(mut self, strict: bool) -> Self {
        self.strict_step_indices = strict;
        self
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn hubs(&self) -> &Arc<HubRegistry> {
        &self.hubs
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Insert or partially update a run, then propagate a settled status.
    #[instrument(skip(self, patch), fields(run_id = %patch.id, status = ?patch.status))]
    pub async fn upsert_run(&self, patch: RunPatch) -> Result<RunUpsert> {
        let outcome = self.persistence.upsert_run(&patch).await?;
        debug!(inserted = outcome.is_inserted(), "Run upserted");

        let propagation = if patch.status.is_some() {
            self.propagator.propagate(&patch).await
        } else {
            PropagationOutcome::NotSettled
        };

        Ok(RunUpsert {
            ack: MutationAck::from_outcome(outcome, patch.id),
            propagation,
        })
    }

    /// Insert a step, or update one by id.
    #[instrument(skip(self, patch), fields(step_id = ?patch.id, run_id = ?patch.run_id))]
    pub async fn upsert_step(&self, patch: StepPatch) -> Result<MutationAck<i64>> {
        if self.strict_step_indices && patch.id.is_none() {
            self.check_step_index(&patch).await?;
        }

        let (outcome, step_id) = self.persistence.upsert_step(&patch).await?;
        debug!(step_id, inserted = outcome.is_inserted(), "Step upserted");
        Ok(MutationAck::from_outcome(outcome, step_id))
    }

    /// Normalize a raw step payload, then [`upsert_step`](Self::upsert_step).
    pub async fn upsert_step_payload(&self, payload: Value) -> Result<MutationAck<i64>> {
        let patch = legacy::parse_step_patch(payload)?;
        self.upsert_step(patch).await
    }

    /// Append a retry record. Never deduplicates.
    #[instrument(skip(self, retry), fields(step_id = retry.step_id, retry_count = retry.retry_count))]
    pub async fn append_retry(&self, retry: NewRetry) -> Result<MutationAck<i64>> {
        if retry.retry_count < 1 {
            return Err(TrackerError::validation(
                "retry_count",
                "must be at least 1",
            ));
        }

        let id = self.persistence.append_retry(&retry).await?;
        Ok(MutationAck::inserted(id))
    }

    /// Resolve the workflow and create its run in `pending`.
    ///
    /// A run id that is already taken is rejected before the workflow is
    /// resolved, so no counter is bumped for it.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn start_workflow(&self, request: StartWorkflowRequest) -> Result<StartedWorkflow> {
        let run_id = request
            .run_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.persistence.get_run(&run_id).await?.is_some() {
            return Err(run_exists(&run_id));
        }

        let key = WorkflowKey {
            name: request.name,
            ref_id: request.ref_id,
            ref_type: request.ref_type,
            input_params: request.input_params,
            metadata: request.metadata,
            run_id: Some(run_id.clone()),
        };
        let workflow_id = self.resolver.resolve(&key).await?;

        let mut run = RunPatch::new(&run_id);
        run.workflow_id = Some(workflow_id);
        run.ref_id = key.ref_id.clone();
        run.ref_type = key.ref_type.clone();
        run.status = Some(RunStatus::Pending);
        run.input_params = key.input_params;
        run.metadata = key.metadata;
        if !self
            .persistence
            .insert_run(&run, workflow_id, Utc::now())
            .await?
        {
            // Lost a race with a concurrent start of the same run id.
            return Err(run_exists(&run_id));
        }

        info!(workflow_id, run_id = %run_id, "Workflow run started");
        Ok(StartedWorkflow {
            workflow_id,
            run_id,
            ref_id: key.ref_id,
            ref_type: key.ref_type,
        })
    }

    /// Record a failed step attempt and decide whether it is retried.
    ///
    /// The step is stored as `retrying` or `failed` with the error and retry
    /// metadata in its state. A retry record is appended only when another
    /// attempt is scheduled. An error that is already non-retryable is stored
    /// as failed without computing a new schedule.
    #[instrument(skip(self, report, policy), fields(run_id = %report.run_id, step_index = report.step_index))]
    pub async fn report_step_failure(
        &self,
        report: StepFailureReport,
        policy: &RetryPolicy,
    ) -> Result<StepFailureOutcome> {
        let now = Utc::now();
        let mut error = report.error;
        let decision = error.annotate(policy, now);

        let status = if error.will_retry() {
            StepStatus::Retrying
        } else {
            StepStatus::Failed
        };

        let step_id = match report.step_id {
            Some(step_id) => Some(step_id),
            None => self
                .persistence
                .list_steps(&report.run_id)
                .await?
                .into_iter()
                .rev()
                .find(|step| step.step_index == report.step_index)
                .map(|step| step.id),
        };

        let patch = StepPatch {
            id: step_id,
            run_id: Some(report.run_id.clone()),
            step_index: Some(report.step_index),
            name: report.name,
            status: Some(status),
            state: Some(error.to_state()),
            ..Default::default()
        };
        let (_, step_id) = self.persistence.upsert_step(&patch).await?;

        let retry_id = match (&decision, error.next_retry_at) {
            (Some(decision), Some(retry_at)) if decision.retryable => {
                let retry = NewRetry {
                    step_id,
                    retry_count: i32::try_from(error.retry_count).unwrap_or(i32::MAX),
                    retry_at,
                    last_error: Some(error.message.clone()),
                    created_at: Some(now),
                };
                Some(self.persistence.append_retry(&retry).await?)
            }
            _ => None,
        };

        if error.will_retry() {
            info!(step_id, retry = %error.annotation(), "Step will be retried");
        } else {
            warn!(step_id, error = %error.message, "Step failed with no further retries");
        }

        Ok(StepFailureOutcome {
            step_id,
            error,
            decision,
            retry_id,
        })
    }

    async fn check_step_index(&self, patch: &StepPatch) -> Result<()> {
        let (Some(run_id), Some(step_index)) = (patch.run_id.as_deref(), patch.step_index) else {
            // Missing fields are reported by the insert itself.
            return Ok(());
        };

        if step_index < 0 {
            return Err(TrackerError::validation(
                "step_index",
                "must not be negative",
            ));
        }
        if self.persistence.step_index_exists(run_id, step_index).await? {
            return Err(TrackerError::validation(
                "step_index",
                format!("step {} already exists in run '{}'", step_index, run_id),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Fetch a run with its steps and retries.
    pub async fn get_workflow_run(&self, run_id: &str) -> Result<Option<RunTree>> {
        self.query.get_run(run_id).await
    }

    /// List runs, newest first.
    pub async fn list_runs(&self, query: RunQuery) -> Result<Vec<RunTree>> {
        self.query.list_runs(query).await
    }

    /// List runs by external reference. Requires `ref_id` or `ref_type`.
    pub async fn get_runs_by_ref(&self, query: RunQuery) -> Result<Vec<RunTree>> {
        self.query.runs_by_ref(query).await
    }

    pub async fn get_workflow(&self, workflow_id: i64) -> Result<Option<WorkflowRecord>> {
        self.persistence.get_workflow(workflow_id).await
    }

    pub async fn health_check(&self) -> Result<bool> {
        self.persistence.health_check_db().await
    }

    // ------------------------------------------------------------------------
    // Live Channel
    // ------------------------------------------------------------------------

    /// Subscribe an observer to the default partition.
    pub async fn subscribe(
        &self,
        sink: Arc<dyn ObserverSink>,
    ) -> Result<(Arc<BroadcastHub>, ObserverId)> {
        self.hubs.subscribe(&self.partition, sink).await
    }

    /// Remove an observer from the default partition. Idempotent.
    pub async fn unsubscribe(&self, observer_id: ObserverId) -> bool {
        self.hubs.unsubscribe(&self.partition, observer_id).await
    }

    /// Broadcast an event to the default partition.
    pub async fn publish(&self, event: Value) -> BroadcastReport {
        self.publish_to(&self.partition, event).await
    }

    /// Broadcast an event to `partition`.
    pub async fn publish_to(&self, partition: &str, event: Value) -> BroadcastReport {
        let report = self.hubs.broadcast(partition, event).await;
        debug!(
            partition,
            delivered = report.delivered,
            failed = report.failed,
            "Event broadcast"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use serde_json::json;

    async fn test_tracker() -> Tracker {
        let persistence = SqlitePersistence::connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite persistence");
        Tracker::new(Arc::new(persistence))
    }

    async fn started(tracker: &Tracker) -> StartedWorkflow {
        tracker
            .start_workflow(StartWorkflowRequest {
                name: "checkout".into(),
                ref_id: Some("o-1".into()),
                ref_type: Some("order".into()),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_ack_serialization() {
        let ack = MutationAck::from_outcome(UpsertOutcome::Updated, "run-1".to_string());
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"updated": true, "id": "run-1"})
        );
        let ack = MutationAck::inserted(5i64);
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"inserted": true, "id": 5})
        );
    }

    #[tokio::test]
    async fn test_start_workflow_creates_pending_run() {
        let tracker = test_tracker().await;
        let started = started(&tracker).await;

        let run = tracker
            .get_workflow_run(&started.run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.run.status, "pending");
        assert_eq!(run.run.workflow_id, started.workflow_id);
        assert_eq!(run.run.ref_type.as_deref(), Some("order"));
        assert_eq!(started.ref_id.as_deref(), Some("o-1"));

        let workflow = tracker
            .get_workflow(started.workflow_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(workflow.last_run_id.as_deref(), Some(started.run_id.as_str()));
    }

    #[tokio::test]
    async fn test_start_workflow_rejects_existing_run() {
        let tracker = test_tracker().await;
        let first = tracker
            .start_workflow(StartWorkflowRequest {
                name: "a".into(),
                run_id: Some("x".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut done = RunPatch::new("x");
        done.status = Some(RunStatus::Completed);
        tracker.upsert_run(done).await.unwrap();

        let err = tracker
            .start_workflow(StartWorkflowRequest {
                name: "b".into(),
                run_id: Some("x".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let run = tracker.get_workflow_run("x").await.unwrap().unwrap();
        assert_eq!(run.run.workflow_id, first.workflow_id);
        assert_eq!(run.run.status, "completed");

        let workflow = tracker
            .get_workflow(first.workflow_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(workflow.run_count, 1);
        assert_eq!(workflow.status, "completed");
        // The rejected start never created workflow "b".
        assert!(
            tracker
                .persistence()
                .find_workflow("b", None, None)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_upsert_run_reports_propagation() {
        let tracker = test_tracker().await;
        let started = started(&tracker).await;

        let mut patch = RunPatch::new(&started.run_id);
        patch.status = Some(RunStatus::Completed);
        patch.output_result = Some(json!({"x": 1}));
        let result = tracker.upsert_run(patch).await.unwrap();

        assert!(result.ack.updated);
        assert_eq!(
            result.propagation,
            PropagationOutcome::Applied {
                workflow_id: started.workflow_id
            }
        );
    }

    #[tokio::test]
    async fn test_strict_step_indices() {
        let tracker = test_tracker().await.with_strict_step_indices(true);
        let started = started(&tracker).await;

        let patch = StepPatch {
            run_id: Some(started.run_id.clone()),
            step_index: Some(0),
            ..Default::default()
        };
        tracker.upsert_step(patch.clone()).await.unwrap();

        let err = tracker.upsert_step(patch).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let negative = StepPatch {
            run_id: Some(started.run_id.clone()),
            step_index: Some(-1),
            ..Default::default()
        };
        assert!(tracker.upsert_step(negative).await.is_err());
    }

    #[tokio::test]
    async fn test_permissive_step_indices_by_default() {
        let tracker = test_tracker().await;
        let started = started(&tracker).await;
        let patch = StepPatch {
            run_id: Some(started.run_id.clone()),
            step_index: Some(0),
            ..Default::default()
        };
        let first = tracker.upsert_step(patch.clone()).await.unwrap();
        let second = tracker.upsert_step(patch).await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_append_retry_rejects_zero_count() {
        let tracker = test_tracker().await;
        let err = tracker
            .append_retry(NewRetry {
                step_id: 1,
                retry_count: 0,
                retry_at: Utc::now(),
                last_error: None,
                created_at: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_report_step_failure_schedules_retry() {
        let tracker = test_tracker().await;
        let started = started(&tracker).await;
        let running = tracker
            .upsert_step(StepPatch {
                run_id: Some(started.run_id.clone()),
                step_index: Some(0),
                status: Some(StepStatus::Running),
                ..Default::default()
            })
            .await
            .unwrap();

        let outcome = tracker
            .report_step_failure(
                StepFailureReport {
                    run_id: started.run_id.clone(),
                    step_index: 0,
                    step_id: None,
                    name: None,
                    error: StepError::new("timeout"),
                },
                &RetryPolicy::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.step_id, running.id);
        assert!(outcome.error.will_retry());
        assert!(outcome.retry_id.is_some());

        let step = tracker
            .persistence()
            .get_step(running.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(step.status, "retrying");
        let state = step.state.unwrap();
        assert_eq!(state["error"], "timeout");
        assert_eq!(state["retry"]["retry_count"], 1);

        let retries = tracker.persistence().list_retries(running.id).await.unwrap();
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_report_step_failure_terminal_and_short_circuit() {
        let tracker = test_tracker().await;
        let started = started(&tracker).await;

        let exhausted = tracker
            .report_step_failure(
                StepFailureReport {
                    run_id: started.run_id.clone(),
                    step_index: 2,
                    step_id: None,
                    name: Some("charge".into()),
                    error: StepError::new("declined").with_retry_count(3),
                },
                &RetryPolicy::default(),
            )
            .await
            .unwrap();
        assert!(exhausted.error.non_retryable);
        assert!(exhausted.retry_id.is_none());

        let again = tracker
            .report_step_failure(
                StepFailureReport {
                    run_id: started.run_id.clone(),
                    step_index: 2,
                    step_id: Some(exhausted.step_id),
                    name: None,
                    error: exhausted.error.clone(),
                },
                &RetryPolicy::default(),
            )
            .await
            .unwrap();
        assert!(again.decision.is_none());
        assert_eq!(again.error, exhausted.error);

        let step = tracker
            .persistence()
            .get_step(exhausted.step_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(step.status, "failed");
        assert_eq!(step.name.as_deref(), Some("charge"));
        assert!(
            tracker
                .persistence()
                .list_retries(exhausted.step_id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_report_step_failure_keeps_step_in_its_run() {
        let tracker = test_tracker().await;
        let owner = started(&tracker).await;
        let other = tracker
            .start_workflow(StartWorkflowRequest {
                name: "refund".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let step = tracker
            .upsert_step(StepPatch {
                run_id: Some(owner.run_id.clone()),
                step_index: Some(0),
                status: Some(StepStatus::Running),
                ..Default::default()
            })
            .await
            .unwrap();

        let err = tracker
            .report_step_failure(
                StepFailureReport {
                    run_id: other.run_id.clone(),
                    step_index: 0,
                    step_id: Some(step.id),
                    name: None,
                    error: StepError::new("timeout"),
                },
                &RetryPolicy::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let stored = tracker
            .persistence()
            .get_step(step.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.run_id, owner.run_id);
        assert_eq!(stored.status, "running");
    }

    #[tokio::test]
    async fn test_publish_reaches_default_partition() {
        use crate::broadcast::{ChannelSink, HubMessage};

        let tracker = test_tracker().await.with_partition("orders");
        let (sink, mut rx) = ChannelSink::channel(8);
        let (_, observer_id) = tracker.subscribe(Arc::new(sink)).await.unwrap();
        rx.recv().await.unwrap();

        let report = tracker.publish(json!({"run_id": "r-1"})).await;
        assert_eq!(report.delivered, 1);
        assert!(matches!(
            rx.recv().await.unwrap().as_ref(),
            HubMessage::Update { .. }
        ));

        assert!(tracker.unsubscribe(observer_id).await);
        assert!(!tracker.unsubscribe(observer_id).await);
    }
}
