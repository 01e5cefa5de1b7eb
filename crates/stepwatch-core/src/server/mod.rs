// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP and WebSocket transport over [`Tracker`].
//!
//! | Method | Path | Operation |
//! |---|---|---|
//! | `POST` | `/runs` | [`Tracker::upsert_run`] |
//! | `POST` | `/steps` | [`Tracker::upsert_step_payload`] |
//! | `POST` | `/steps/failures` | [`Tracker::report_step_failure`] |
//! | `POST` | `/retries` | [`Tracker::append_retry`] |
//! | `POST` | `/workflows/start` | [`Tracker::start_workflow`] |
//! | `GET` | `/workflows/{id}` | [`Tracker::get_workflow`] |
//! | `GET` | `/runs/{id}` | [`Tracker::get_workflow_run`] |
//! | `GET` | `/runs` | [`Tracker::list_runs`] |
//! | `GET` | `/runs/by-ref` | [`Tracker::get_runs_by_ref`] |
//! | `POST` | `/broadcast` | [`Tracker::publish_to`] |
//! | `GET` | `/live` | WebSocket observer |
//! | `GET` | `/health` | [`Tracker::health_check`] |

mod live;

use axum::{
    Json, Router,
    extract::{Path, Query, State, ws::WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::broadcast::BroadcastReport;
use crate::error::TrackerError;
use crate::persistence::{NewRetry, RunPatch, WorkflowRecord};
use crate::query::{RunQuery, RunTree};
use crate::retry::RetryPolicy;
use crate::tracker::{
    MutationAck, RunUpsert, StartWorkflowRequest, StartedWorkflow, StepFailureReport, Tracker,
};

/// Default outbound queue depth for a live observer.
pub const DEFAULT_OBSERVER_BUFFER: usize = 64;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub tracker: Tracker,
    pub observer_buffer: usize,
}

impl HttpState {
    pub fn new(tracker: Tracker) -> Self {
        Self {
            tracker,
            observer_buffer: DEFAULT_OBSERVER_BUFFER,
        }
    }

    pub fn with_observer_buffer(mut self, observer_buffer: usize) -> Self {
        self.observer_buffer = observer_buffer.max(1);
        self
    }
}

/// Build the router.
pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/runs", post(upsert_run).get(list_runs))
        .route("/runs/by-ref", get(runs_by_ref))
        .route("/runs/{run_id}", get(get_run))
        .route("/steps", post(upsert_step))
        .route("/steps/failures", post(report_step_failure))
        .route("/retries", post(append_retry))
        .route("/workflows/start", post(start_workflow))
        .route("/workflows/{workflow_id}", get(get_workflow))
        .route("/broadcast", post(broadcast))
        .route("/live", get(live))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve the router on `listener` until `shutdown_rx` flips to true.
pub async fn run_http_server(
    listener: TcpListener,
    state: HttpState,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP server starting");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            while shutdown_rx.changed().await.is_ok() {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Serialize)]
struct ErrorResponseBody {
    code: &'static str,
    message: String,
}

/// Error returned by handlers, rendered as `{ "code", "message" }`.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl HttpError {
    fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<TrackerError> for HttpError {
    fn from(err: TrackerError) -> Self {
        let status = match &err {
            TrackerError::ValidationError { .. } => StatusCode::BAD_REQUEST,
            TrackerError::StepNotFound { .. } => StatusCode::NOT_FOUND,
            TrackerError::HubUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }
        Self {
            status,
            code: err.error_code(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for HttpError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::from(err).into()
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponseBody {
            code: self.code,
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

type HttpResult<T> = Result<Json<T>, HttpError>;

// ============================================================================
// Mutations
// ============================================================================

// Bodies are taken as raw JSON so malformed payloads get the same error shape
// as every other validation failure.

async fn upsert_run(
    State(state): State<HttpState>,
    Json(payload): Json<Value>,
) -> HttpResult<RunUpsert> {
    let patch: RunPatch = serde_json::from_value(payload)?;
    Ok(Json(state.tracker.upsert_run(patch).await?))
}

async fn upsert_step(
    State(state): State<HttpState>,
    Json(payload): Json<Value>,
) -> HttpResult<MutationAck<i64>> {
    Ok(Json(state.tracker.upsert_step_payload(payload).await?))
}

async fn append_retry(
    State(state): State<HttpState>,
    Json(payload): Json<Value>,
) -> HttpResult<MutationAck<i64>> {
    let retry: NewRetry = serde_json::from_value(payload)?;
    Ok(Json(state.tracker.append_retry(retry).await?))
}

async fn start_workflow(
    State(state): State<HttpState>,
    Json(payload): Json<Value>,
) -> HttpResult<StartedWorkflow> {
    let request: StartWorkflowRequest = serde_json::from_value(payload)?;
    Ok(Json(state.tracker.start_workflow(request).await?))
}

#[derive(Debug, Deserialize)]
struct StepFailureRequest {
    #[serde(flatten)]
    report: StepFailureReport,
    #[serde(default)]
    policy: RetryPolicy,
}

#[derive(Debug, Serialize)]
struct StepFailureResponse {
    step_id: i64,
    /// Error message with its retry annotation.
    error: String,
    retry_count: u32,
    will_retry: bool,
    next_retry_at: Option<DateTime<Utc>>,
    retry_id: Option<i64>,
}

async fn report_step_failure(
    State(state): State<HttpState>,
    Json(payload): Json<Value>,
) -> HttpResult<StepFailureResponse> {
    let request: StepFailureRequest = serde_json::from_value(payload)?;
    let outcome = state
        .tracker
        .report_step_failure(request.report, &request.policy)
        .await?;

    Ok(Json(StepFailureResponse {
        step_id: outcome.step_id,
        error: outcome.error.to_string(),
        retry_count: outcome.error.retry_count,
        will_retry: outcome.error.will_retry(),
        next_retry_at: outcome.error.next_retry_at,
        retry_id: outcome.retry_id,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct PartitionParam {
    partition: Option<String>,
}

async fn broadcast(
    State(state): State<HttpState>,
    Query(target): Query<PartitionParam>,
    Json(event): Json<Value>,
) -> Json<BroadcastReport> {
    let report = match target.partition {
        Some(partition) => state.tracker.publish_to(&partition, event).await,
        None => state.tracker.publish(event).await,
    };
    Json(report)
}

// ============================================================================
// Queries
// ============================================================================

async fn get_run(
    State(state): State<HttpState>,
    Path(run_id): Path<String>,
) -> HttpResult<RunTree> {
    state
        .tracker
        .get_workflow_run(&run_id)
        .await?
        .map(Json)
        .ok_or_else(|| HttpError::not_found("RUN_NOT_FOUND", format!("Run '{}' not found", run_id)))
}

async fn list_runs(
    State(state): State<HttpState>,
    Query(query): Query<RunQuery>,
) -> HttpResult<Vec<RunTree>> {
    Ok(Json(state.tracker.list_runs(query).await?))
}

async fn runs_by_ref(
    State(state): State<HttpState>,
    Query(query): Query<RunQuery>,
) -> HttpResult<Vec<RunTree>> {
    Ok(Json(state.tracker.get_runs_by_ref(query).await?))
}

async fn get_workflow(
    State(state): State<HttpState>,
    Path(workflow_id): Path<i64>,
) -> HttpResult<WorkflowRecord> {
    state
        .tracker
        .get_workflow(workflow_id)
        .await?
        .map(Json)
        .ok_or_else(|| {
            HttpError::not_found(
                "WORKFLOW_NOT_FOUND",
                format!("Workflow '{}' not found", workflow_id),
            )
        })
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    database: bool,
}

async fn health(State(state): State<HttpState>) -> (StatusCode, Json<HealthResponse>) {
    let database = match state.tracker.health_check().await {
        Ok(healthy) => healthy,
        Err(e) => {
            warn!(error = %e, "Database health check failed");
            false
        }
    };

    if database {
        (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                database,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unavailable",
                database,
            }),
        )
    }
}

// ============================================================================
// Live Channel
// ============================================================================

async fn live(
    ws: WebSocketUpgrade,
    State(state): State<HttpState>,
    Query(target): Query<PartitionParam>,
) -> Response {
    let partition = target
        .partition
        .unwrap_or_else(|| state.tracker.partition().to_string());

    ws.on_upgrade(move |socket| {
        live::serve_observer(socket, state.tracker, partition, state.observer_buffer)
    })
}
