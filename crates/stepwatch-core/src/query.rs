// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hierarchical run queries.
//!
//! Every query returns fully assembled trees: a run with its steps ordered by
//! `step_index`, each step with its retries ordered by `retry_count`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::{Result, TrackerError};
use crate::persistence::{
    DEFAULT_RUN_LIMIT, Persistence, RetryRecord, RunFilter, RunRecord, RunStatus, StepRecord,
};

/// Largest page a single query may request.
pub const MAX_RUN_LIMIT: i64 = 1000;

/// A run with its steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTree {
    #[serde(flatten)]
    pub run: RunRecord,
    pub steps: Vec<StepTree>,
}

/// A step with its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTree {
    #[serde(flatten)]
    pub step: StepRecord,
    pub retries: Vec<RetryRecord>,
}

/// Caller-facing filter. Paging defaults are applied by [`RunQuery::into_filter`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunQuery {
    #[serde(default)]
    pub ref_id: Option<String>,
    #[serde(default)]
    pub ref_type: Option<String>,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl RunQuery {
    /// True when at least one reference parameter is present.
    pub fn has_ref(&self) -> bool {
        self.ref_id.is_some() || self.ref_type.is_some()
    }

    /// Validate paging and build a storage filter.
    pub fn into_filter(self) -> Result<RunFilter> {
        let limit = self.limit.unwrap_or(DEFAULT_RUN_LIMIT);
        if !(1..=MAX_RUN_LIMIT).contains(&limit) {
            return Err(TrackerError::validation(
                "limit",
                format!("must be between 1 and {}", MAX_RUN_LIMIT),
            ));
        }
        let offset = self.offset.unwrap_or(0);
        if offset < 0 {
            return Err(TrackerError::validation("offset", "must not be negative"));
        }

        Ok(RunFilter {
            ref_id: self.ref_id,
            ref_type: self.ref_type,
            status: self.status,
            limit,
            offset,
        })
    }
}

/// Assembles run trees from storage.
#[derive(Clone)]
pub struct QueryAggregator {
    persistence: Arc<dyn Persistence>,
}

impl QueryAggregator {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Fetch one run tree. A missing run is `Ok(None)`.
    #[instrument(skip(self))]
    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunTree>> {
        match self.persistence.get_run(run_id).await? {
            Some(run) => Ok(Some(self.hydrate(run).await?)),
            None => Ok(None),
        }
    }

    /// List run trees, newest first. Every filter field is optional.
    #[instrument(skip(self))]
    pub async fn list_runs(&self, query: RunQuery) -> Result<Vec<RunTree>> {
        let filter = query.into_filter()?;
        let runs = self.persistence.list_runs(&filter).await?;

        let mut trees = Vec::with_capacity(runs.len());
        for run in runs {
            trees.push(self.hydrate(run).await?);
        }
        Ok(trees)
    }

    /// List run trees by external reference. Requires `ref_id` or `ref_type`.
    pub async fn runs_by_ref(&self, query: RunQuery) -> Result<Vec<RunTree>> {
        if !query.has_ref() {
            return Err(TrackerError::validation(
                "ref_id",
                "ref_id or ref_type is required",
            ));
        }
        self.list_runs(query).await
    }

    async fn hydrate(&self, run: RunRecord) -> Result<RunTree> {
        let steps = self.persistence.list_steps(&run.id).await?;

        let mut step_trees = Vec::with_capacity(steps.len());
        for step in steps {
            let retries = self.persistence.list_retries(step.id).await?;
            step_trees.push(StepTree { step, retries });
        }

        Ok(RunTree {
            run,
            steps: step_trees,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{NewRetry, NewWorkflow, RunPatch, SqlitePersistence, StepPatch};
    use chrono::Utc;

    async fn setup() -> (QueryAggregator, Arc<dyn Persistence>, i64) {
        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::connect("sqlite::memory:")
                .await
                .expect("Failed to create in-memory SQLite persistence"),
        );
        let workflow_id = persistence
            .insert_workflow(
                &NewWorkflow {
                    name: "query".into(),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await
            .unwrap()
            .unwrap();
        (
            QueryAggregator::new(persistence.clone()),
            persistence,
            workflow_id,
        )
    }

    async fn add_run(persistence: &Arc<dyn Persistence>, workflow_id: i64, id: &str, ref_type: &str) {
        let mut patch = RunPatch::new(id);
        patch.workflow_id = Some(workflow_id);
        patch.ref_type = Some(ref_type.to_string());
        persistence.upsert_run(&patch).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_run_is_none() {
        let (query, _, _) = setup().await;
        assert!(query.get_run("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tree_is_ordered() {
        let (query, persistence, workflow_id) = setup().await;
        add_run(&persistence, workflow_id, "run-1", "order").await;

        let mut step_ids = Vec::new();
        for index in [1, 0] {
            let (_, id) = persistence
                .upsert_step(&StepPatch {
                    run_id: Some("run-1".into()),
                    step_index: Some(index),
                    ..Default::default()
                })
                .await
                .unwrap();
            step_ids.push((index, id));
        }
        let step_one = step_ids.iter().find(|(i, _)| *i == 1).unwrap().1;
        persistence
            .append_retry(&NewRetry {
                step_id: step_one,
                retry_count: 1,
                retry_at: Utc::now(),
                last_error: Some("flaky".into()),
                created_at: None,
            })
            .await
            .unwrap();

        let tree = query.get_run("run-1").await.unwrap().unwrap();
        let indices: Vec<i32> = tree.steps.iter().map(|s| s.step.step_index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert!(tree.steps[0].retries.is_empty());
        assert_eq!(tree.steps[1].retries.len(), 1);
    }

    #[tokio::test]
    async fn test_by_ref_requires_reference() {
        let (query, _, _) = setup().await;
        let err = query.runs_by_ref(RunQuery::default()).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let err = query
            .runs_by_ref(RunQuery {
                status: Some(RunStatus::Pending),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_by_ref_type_filters() {
        let (query, persistence, workflow_id) = setup().await;
        add_run(&persistence, workflow_id, "a", "order").await;
        add_run(&persistence, workflow_id, "b", "invoice").await;
        add_run(&persistence, workflow_id, "c", "order").await;

        let trees = query
            .runs_by_ref(RunQuery {
                ref_type: Some("order".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(trees.len(), 2);
        assert!(
            trees
                .iter()
                .all(|t| t.run.ref_type.as_deref() == Some("order"))
        );
    }

    #[tokio::test]
    async fn test_list_runs_without_filters() {
        let (query, persistence, workflow_id) = setup().await;
        add_run(&persistence, workflow_id, "a", "order").await;
        add_run(&persistence, workflow_id, "b", "invoice").await;

        let trees = query.list_runs(RunQuery::default()).await.unwrap();
        assert_eq!(trees.len(), 2);
    }

    #[test]
    fn test_paging_validation() {
        let filter = RunQuery::default().into_filter().unwrap();
        assert_eq!(filter.limit, DEFAULT_RUN_LIMIT);
        assert_eq!(filter.offset, 0);

        for query in [
            RunQuery {
                limit: Some(0),
                ..Default::default()
            },
            RunQuery {
                limit: Some(MAX_RUN_LIMIT + 1),
                ..Default::default()
            },
            RunQuery {
                offset: Some(-1),
                ..Default::default()
            },
        ] {
            assert!(query.into_filter().is_err());
        }
    }

    #[test]
    fn test_tree_serializes_flat() {
        let now = Utc::now();
        let tree = RunTree {
            run: RunRecord {
                id: "run-1".into(),
                workflow_id: 1,
                ref_id: None,
                ref_type: None,
                status: "running".into(),
                input_params: None,
                output_result: None,
                metadata: None,
                created_at: now,
                updated_at: now,
                completed_at: None,
                sleep_until: None,
            },
            steps: Vec::new(),
        };

        let value = serde_json::to_value(&tree).unwrap();
        assert_eq!(value["id"], "run-1");
        assert_eq!(value["status"], "running");
        assert!(value["steps"].as_array().unwrap().is_empty());
    }
}
