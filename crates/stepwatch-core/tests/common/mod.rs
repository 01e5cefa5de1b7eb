// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stepwatch-core integration tests.
//!
//! Provides TestContext wrapping a [`Tracker`] over a fresh SQLite database.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::Value;
use tempfile::TempDir;

use stepwatch_core::broadcast::{ChannelSink, HubMessage};
use stepwatch_core::persistence::{Persistence, RunPatch, RunStatus, SqlitePersistence, StepPatch, StepStatus};
use stepwatch_core::tracker::{StartWorkflowRequest, StartedWorkflow};
use stepwatch_core::Tracker;
use tokio::sync::mpsc;

/// Test context owning a tracker and its database.
pub struct TestContext {
    pub tracker: Tracker,
    pub persistence: Arc<dyn Persistence>,
    // Keeps a file-backed database alive for the test's duration.
    _dir: Option<TempDir>,
}

impl TestContext {
    /// Tracker over an in-memory database.
    pub async fn new() -> Self {
        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::connect("sqlite::memory:")
                .await
                .expect("Failed to create in-memory SQLite persistence"),
        );
        Self {
            tracker: Tracker::new(persistence.clone()),
            persistence,
            _dir: None,
        }
    }

    /// Tracker over a file-backed database, for tests that need several
    /// pooled connections.
    pub async fn file_backed() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("tracker.db");
        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::from_path(&path)
                .await
                .expect("Failed to create file-backed SQLite persistence"),
        );
        Self {
            tracker: Tracker::new(persistence.clone()),
            persistence,
            _dir: Some(dir),
        }
    }

    /// Start a run of workflow `name`.
    pub async fn start(&self, name: &str, run_id: &str, ref_id: Option<&str>) -> StartedWorkflow {
        self.tracker
            .start_workflow(StartWorkflowRequest {
                name: name.to_string(),
                run_id: Some(run_id.to_string()),
                ref_id: ref_id.map(str::to_string),
                ..Default::default()
            })
            .await
            .expect("Failed to start workflow")
    }

    /// Move a run to `status`.
    pub async fn set_run_status(&self, run_id: &str, status: RunStatus, output: Option<Value>) {
        let mut patch = RunPatch::new(run_id);
        patch.status = Some(status);
        patch.output_result = output;
        self.tracker
            .upsert_run(patch)
            .await
            .expect("Failed to update run");
    }

    /// Insert a step and return its id.
    pub async fn add_step(&self, run_id: &str, step_index: i32, status: StepStatus) -> i64 {
        self.tracker
            .upsert_step(StepPatch {
                run_id: Some(run_id.to_string()),
                step_index: Some(step_index),
                name: Some(format!("step-{}", step_index)),
                status: Some(status),
                ..Default::default()
            })
            .await
            .expect("Failed to insert step")
            .id
    }

    /// Subscribe a channel-backed observer to the default partition and
    /// consume its snapshot.
    pub async fn observe(&self, buffer: usize) -> (uuid::Uuid, Vec<Value>, mpsc::Receiver<Arc<HubMessage>>) {
        let (sink, mut rx) = ChannelSink::channel(buffer);
        let (_, observer_id) = self
            .tracker
            .subscribe(Arc::new(sink))
            .await
            .expect("Failed to subscribe");

        let snapshot = match rx.recv().await.as_deref() {
            Some(HubMessage::InitialData { data }) => data
                .iter()
                .map(|run| serde_json::to_value(run).expect("run serializes"))
                .collect(),
            other => panic!("expected initial_data, got {:?}", other),
        };
        (observer_id, snapshot, rx)
    }
}
