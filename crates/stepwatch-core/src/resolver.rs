// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow resolution by identity key.
//!
//! A workflow is identified by `(name, ref_id, ref_type)`. Resolution finds the
//! existing aggregate and counts a new run against it, or creates it with a
//! run count of one. Concurrent first sightings of the same key converge on a
//! single row through the unique identity index.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::{Result, TrackerError};
use crate::persistence::{NewWorkflow, Persistence};

/// Inputs for [`WorkflowResolver::resolve`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowKey {
    pub name: String,
    pub ref_id: Option<String>,
    pub ref_type: Option<String>,
    pub input_params: Option<Value>,
    pub metadata: Option<Value>,
    /// Run being started, recorded as the workflow's `last_run_id`.
    pub run_id: Option<String>,
}

impl WorkflowKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_ref(mut self, ref_id: Option<String>, ref_type: Option<String>) -> Self {
        self.ref_id = ref_id;
        self.ref_type = ref_type;
        self
    }
}

/// Resolves or creates workflow aggregates.
#[derive(Clone)]
pub struct WorkflowResolver {
    persistence: Arc<dyn Persistence>,
}

impl WorkflowResolver {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Resolve the workflow for `key`, creating it on first sight.
    ///
    /// An existing workflow has its run count incremented and its status set
    /// to running. Returns the workflow id.
    #[instrument(skip(self, key), fields(name = %key.name, ref_id = ?key.ref_id, ref_type = ?key.ref_type))]
    pub async fn resolve(&self, key: &WorkflowKey) -> Result<i64> {
        if key.name.trim().is_empty() {
            return Err(TrackerError::validation("name", "workflow name is required"));
        }

        if let Some(workflow_id) = self.record_existing(key).await? {
            return Ok(workflow_id);
        }

        let new_workflow = NewWorkflow {
            name: key.name.clone(),
            ref_id: key.ref_id.clone(),
            ref_type: key.ref_type.clone(),
            input_params: key.input_params.clone(),
            metadata: key.metadata.clone(),
            last_run_id: key.run_id.clone(),
        };

        if let Some(workflow_id) = self
            .persistence
            .insert_workflow(&new_workflow, Utc::now())
            .await?
        {
            debug!(workflow_id, "Created workflow");
            return Ok(workflow_id);
        }

        // Lost the insert race: the winner's row is visible now.
        debug!("Workflow created concurrently, resolving existing row");
        self.record_existing(key).await?.ok_or_else(|| {
            TrackerError::database(
                "resolve_workflow",
                format!("workflow '{}' conflicted but could not be found", key.name),
            )
        })
    }

    async fn record_existing(&self, key: &WorkflowKey) -> Result<Option<i64>> {
        let Some(existing) = self
            .persistence
            .find_workflow(&key.name, key.ref_id.as_deref(), key.ref_type.as_deref())
            .await?
        else {
            return Ok(None);
        };

        let counted = self
            .persistence
            .record_workflow_run(existing.id, key.run_id.as_deref(), Utc::now())
            .await?;
        if !counted {
            return Ok(None);
        }

        debug!(workflow_id = existing.id, "Resolved existing workflow");
        Ok(Some(existing.id))
    }
}
