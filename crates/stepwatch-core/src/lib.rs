// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stepwatch Core - Workflow State Tracker
//!
//! This crate records the progress of workflow executions reported by many
//! independent callers and fans state changes out to live observers. State is
//! persisted to PostgreSQL or SQLite.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐        ┌──────────────────────────────┐
//! │   Workflow executors         │        │   Live observers (UI, CLI)   │
//! │   (report runs/steps)        │        │   WebSocket /live            │
//! └──────────────────────────────┘        └──────────────────────────────┘
//!                │ HTTP / in-process                    ▲
//!                ▼                                      │ initial_data / update
//! ┌─────────────────────────────────────────────────────┴────────────────┐
//! │                              Tracker                                 │
//! │  WorkflowResolver  StatusPropagator  QueryAggregator  HubRegistry    │
//! │                    RetryPolicy                        BroadcastHub   │
//! └──────────────────────────────────────────────────────────────────────┘
//!                │
//!                ▼
//! ┌──────────────────────────────┐
//! │  Persistence                 │
//! │  (PostgreSQL / SQLite)       │
//! └──────────────────────────────┘
//! ```
//!
//! # Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `upsert_run` | Insert or partially update a run; settled statuses are mirrored onto the workflow |
//! | `upsert_step` | Insert a step, or update one by id |
//! | `append_retry` | Append a retry record (never deduplicated) |
//! | `start_workflow` | Resolve the workflow by identity and create a `pending` run |
//! | `report_step_failure` | Apply a retry policy to a failed step |
//! | `get_workflow_run` | A run with its steps (by `step_index`) and retries |
//! | `list_runs` / `get_runs_by_ref` | Newest-first run trees with filtering and paging |
//! | `subscribe` / `unsubscribe` / `publish` | Live channel fan-out |
//!
//! # Status Propagation
//!
//! A run update carrying `completed`, `errored` or `sleeping` is copied onto
//! the owning workflow together with the run's output. Propagation failures
//! are logged and never fail the run update.
//!
//! # Live Channel
//!
//! Observers subscribe to a partition's [`broadcast::BroadcastHub`]. Each new
//! observer receives one `initial_data` snapshot, then `update` messages for
//! every published event. A failing observer never affects the others.
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the environment variables read by the
//! `stepwatch-core` binary.

/// Live fan-out hubs, observer sinks and wire messages.
pub mod broadcast;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types shared by every operation.
pub mod error;

/// Normalization of legacy step payloads.
pub mod legacy;

/// Embedded database migrations.
pub mod migrations;

/// Storage trait, record types and the PostgreSQL/SQLite backends.
pub mod persistence;

/// Mirroring of settled run statuses onto workflows.
pub mod propagation;

/// Hierarchical run/step/retry queries.
pub mod query;

/// Workflow get-or-create by identity.
pub mod resolver;

/// Retry policies and step error annotation.
pub mod retry;

/// Embeddable runtime (HTTP server plus background workers).
#[cfg(feature = "server")]
pub mod runtime;

/// HTTP and WebSocket transport.
#[cfg(feature = "server")]
pub mod server;

/// The tracker service composing all components.
pub mod tracker;

pub use error::{Result, TrackerError};
pub use persistence::{Persistence, PostgresPersistence, SqlitePersistence};
pub use retry::{BackoffType, RetryPolicy, StepError};
pub use tracker::Tracker;
