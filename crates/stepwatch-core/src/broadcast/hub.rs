// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-partition observer set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ClientMessage, DeliveryError, HubMessage, LiveQuery, ObserverSink};
use crate::error::{Result, TrackerError};
use crate::query::{QueryAggregator, RunQuery, RunTree};

/// Identifies one observer within a hub.
pub type ObserverId = Uuid;

/// Result of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Observers that accepted the message.
    pub delivered: usize,
    /// Observers that did not.
    pub failed: usize,
    /// Disconnected observers removed during the fan-out.
    pub pruned: usize,
}

struct HubState {
    observers: HashMap<ObserverId, Arc<dyn ObserverSink>>,
    last_activity: Instant,
    closed: bool,
}

/// Live observer set for one tracking partition.
///
/// Registration, deregistration and fan-out are serialized by one lock, so no
/// observer sees a partially updated set.
pub struct BroadcastHub {
    partition: String,
    query: QueryAggregator,
    state: Mutex<HubState>,
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("partition", &self.partition)
            .finish_non_exhaustive()
    }
}

impl BroadcastHub {
    pub fn new(partition: impl Into<String>, query: QueryAggregator) -> Self {
        Self {
            partition: partition.into(),
            query,
            state: Mutex::new(HubState {
                observers: HashMap::new(),
                last_activity: Instant::now(),
                closed: false,
            }),
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Register an observer and send it an `initial_data` snapshot.
    ///
    /// Returns `Ok(None)` when the hub has been torn down; the caller should
    /// subscribe to a fresh hub instead. A sink that is already closed is not
    /// registered and yields [`TrackerError::ObserverClosed`].
    pub async fn subscribe(&self, sink: Arc<dyn ObserverSink>) -> Result<Option<ObserverId>> {
        if !self.touch().await {
            return Ok(None);
        }

        let snapshot = self.query.list_runs(RunQuery::default()).await?;
        let message = Arc::new(HubMessage::InitialData { data: snapshot });

        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(None);
        }

        let observer_id = Uuid::new_v4();
        match sink.deliver(message) {
            Err(DeliveryError::Closed) => {
                debug!(partition = %self.partition, "Observer closed before snapshot delivery");
                return Err(TrackerError::ObserverClosed);
            }
            Err(e) => {
                warn!(partition = %self.partition, error = %e, "Failed to deliver initial snapshot");
            }
            Ok(()) => {}
        }

        state.observers.insert(observer_id, sink);
        state.last_activity = Instant::now();
        info!(
            partition = %self.partition,
            observer_id = %observer_id,
            observers = state.observers.len(),
            "Observer subscribed"
        );
        Ok(Some(observer_id))
    }

    /// Deregister an observer. Unknown ids are ignored.
    pub async fn unsubscribe(&self, observer_id: ObserverId) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.observers.remove(&observer_id).is_some();
        state.last_activity = Instant::now();
        if removed {
            info!(
                partition = %self.partition,
                observer_id = %observer_id,
                observers = state.observers.len(),
                "Observer unsubscribed"
            );
        }
        removed
    }

    /// Send an `update` carrying `event` to every registered observer.
    pub async fn broadcast(&self, event: Value) -> BroadcastReport {
        let message = Arc::new(HubMessage::Update { data: event });
        let mut report = BroadcastReport::default();

        let mut state = self.state.lock().await;
        state.last_activity = Instant::now();

        let mut disconnected = Vec::new();
        for (observer_id, sink) in &state.observers {
            match sink.deliver(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    debug!(
                        partition = %self.partition,
                        observer_id = %observer_id,
                        error = %e,
                        "Update not delivered"
                    );
                    if e == DeliveryError::Closed {
                        disconnected.push(*observer_id);
                    }
                }
            }
        }

        for observer_id in disconnected {
            state.observers.remove(&observer_id);
            report.pruned += 1;
        }

        report
    }

    /// Answer a client message to the observer that sent it.
    ///
    /// Returns false when the observer is not registered here.
    pub async fn handle_client_message(
        &self,
        observer_id: ObserverId,
        message: ClientMessage,
    ) -> bool {
        let Some(sink) = self.observer(observer_id).await else {
            return false;
        };

        let reply = match message {
            ClientMessage::Query(query) => match self.run_query(query).await {
                Ok(data) => HubMessage::QueryResult { data },
                Err(e) => HubMessage::Error {
                    message: e.to_string(),
                },
            },
        };

        if let Err(e) = sink.deliver(Arc::new(reply)) {
            debug!(
                partition = %self.partition,
                observer_id = %observer_id,
                error = %e,
                "Query reply not delivered"
            );
        }
        true
    }

    /// Drop every observer and refuse further subscriptions.
    pub async fn teardown(&self) -> usize {
        let mut state = self.state.lock().await;
        state.closed = true;
        let dropped = state.observers.len();
        state.observers.clear();
        info!(partition = %self.partition, dropped, "Hub torn down");
        dropped
    }

    pub async fn observer_count(&self) -> usize {
        self.state.lock().await.observers.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// True when the hub has no observers and no activity for `threshold`.
    pub async fn is_idle(&self, threshold: Duration) -> bool {
        let state = self.state.lock().await;
        state.observers.is_empty() && state.last_activity.elapsed() >= threshold
    }

    async fn touch(&self) -> bool {
        let mut state = self.state.lock().await;
        state.last_activity = Instant::now();
        !state.closed
    }

    async fn observer(&self, observer_id: ObserverId) -> Option<Arc<dyn ObserverSink>> {
        self.state.lock().await.observers.get(&observer_id).cloned()
    }

    async fn run_query(&self, query: LiveQuery) -> Result<Vec<RunTree>> {
        if let Some(run_id) = query.run_id {
            return Ok(self.query.get_run(&run_id).await?.into_iter().collect());
        }
        if query.filter.has_ref() {
            self.query.runs_by_ref(query.filter).await
        } else {
            self.query.list_runs(query.filter).await
        }
    }
}
