// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Upward status propagation from runs to their workflow.
//!
//! Only settled statuses (completed, errored, sleeping) are mirrored. A
//! propagation failure is reported in the outcome and logged; it never fails
//! the run mutation that triggered it.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::persistence::{Persistence, RunPatch, RunStatus};

/// What happened when a run update was propagated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PropagationOutcome {
    /// The workflow now mirrors the run status.
    Applied { workflow_id: i64 },
    /// The update carried no settled status.
    NotSettled,
    /// The run's owner could not be resolved.
    RunNotFound,
    /// The workflow update failed in storage.
    Failed { reason: String },
}

impl PropagationOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Mirrors settled run statuses onto the owning workflow.
#[derive(Clone)]
pub struct StatusPropagator {
    persistence: Arc<dyn Persistence>,
}

impl StatusPropagator {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Propagate a run update that has already been written.
    pub async fn propagate(&self, update: &RunPatch) -> PropagationOutcome {
        let Some(status) = update.status.filter(RunStatus::is_settled) else {
            return PropagationOutcome::NotSettled;
        };

        let run = match self.persistence.get_run(&update.id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                warn!(run_id = %update.id, "Run not found, skipping status propagation");
                return PropagationOutcome::RunNotFound;
            }
            Err(e) => {
                warn!(run_id = %update.id, error = %e, "Run lookup failed during propagation");
                return PropagationOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        // The run row is authoritative for the result; the update may omit it.
        let output = update.output_result.as_ref().or(run.output_result.as_ref());

        match self
            .persistence
            .settle_workflow(run.workflow_id, status, output, Utc::now())
            .await
        {
            Ok(true) => {
                debug!(
                    run_id = %update.id,
                    workflow_id = run.workflow_id,
                    status = %status,
                    "Propagated run status to workflow"
                );
                PropagationOutcome::Applied {
                    workflow_id: run.workflow_id,
                }
            }
            Ok(false) => {
                warn!(
                    run_id = %update.id,
                    workflow_id = run.workflow_id,
                    "Owning workflow missing, skipping status propagation"
                );
                PropagationOutcome::RunNotFound
            }
            Err(e) => {
                warn!(
                    run_id = %update.id,
                    workflow_id = run.workflow_id,
                    error = %e,
                    "Failed to propagate run status"
                );
                PropagationOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}
