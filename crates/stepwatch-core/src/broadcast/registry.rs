// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Partition-keyed hub registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{BroadcastHub, BroadcastReport, ObserverId, ObserverSink};
use crate::error::{Result, TrackerError};
use crate::query::QueryAggregator;

/// Owns one [`BroadcastHub`] per partition name.
pub struct HubRegistry {
    query: QueryAggregator,
    hubs: Mutex<HashMap<String, Arc<BroadcastHub>>>,
}

impl HubRegistry {
    pub fn new(query: QueryAggregator) -> Self {
        Self {
            query,
            hubs: Mutex::new(HashMap::new()),
        }
    }

    /// Get the hub for `partition`, creating it if needed.
    pub async fn hub(&self, partition: &str) -> Arc<BroadcastHub> {
        let mut hubs = self.hubs.lock().await;
        hubs.entry(partition.to_string())
            .or_insert_with(|| {
                debug!(partition, "Creating broadcast hub");
                Arc::new(BroadcastHub::new(partition, self.query.clone()))
            })
            .clone()
    }

    /// Get the hub for `partition` if one is live.
    pub async fn get(&self, partition: &str) -> Option<Arc<BroadcastHub>> {
        self.hubs.lock().await.get(partition).cloned()
    }

    /// Subscribe to a partition's hub.
    ///
    /// Retries once against a fresh hub if the current one is torn down
    /// between lookup and registration.
    pub async fn subscribe(
        &self,
        partition: &str,
        sink: Arc<dyn ObserverSink>,
    ) -> Result<(Arc<BroadcastHub>, ObserverId)> {
        for _ in 0..2 {
            let hub = self.hub(partition).await;
            if let Some(observer_id) = hub.subscribe(sink.clone()).await? {
                return Ok((hub, observer_id));
            }
            self.forget(partition, &hub).await;
        }

        warn!(partition, "Hub torn down twice during subscribe");
        Err(TrackerError::HubUnavailable {
            partition: partition.to_string(),
        })
    }

    /// Deregister an observer from a partition. Unknown ids are ignored.
    pub async fn unsubscribe(&self, partition: &str, observer_id: ObserverId) -> bool {
        match self.get(partition).await {
            Some(hub) => hub.unsubscribe(observer_id).await,
            None => false,
        }
    }

    /// Publish an event to a partition. A partition without a hub has no
    /// observers, so nothing is delivered.
    pub async fn broadcast(&self, partition: &str, event: Value) -> BroadcastReport {
        match self.get(partition).await {
            Some(hub) => hub.broadcast(event).await,
            None => BroadcastReport::default(),
        }
    }

    /// Tear down and remove a partition's hub.
    pub async fn remove(&self, partition: &str) -> Option<usize> {
        let hub = self.hubs.lock().await.remove(partition)?;
        Some(hub.teardown().await)
    }

    /// Tear down every hub that has been empty and idle for `threshold`.
    pub async fn reap_idle(&self, threshold: Duration) -> Vec<String> {
        let mut hubs = self.hubs.lock().await;

        let mut reaped = Vec::new();
        for (partition, hub) in hubs.iter() {
            if hub.is_idle(threshold).await {
                hub.teardown().await;
                reaped.push(partition.clone());
            }
        }
        for partition in &reaped {
            hubs.remove(partition);
        }

        if !reaped.is_empty() {
            info!(count = reaped.len(), "Reaped idle broadcast hubs");
        }
        reaped
    }

    pub async fn partitions(&self) -> Vec<String> {
        let mut partitions: Vec<String> = self.hubs.lock().await.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    /// Drop `hub` from the map if it is still the registered instance.
    async fn forget(&self, partition: &str, hub: &Arc<BroadcastHub>) {
        let mut hubs = self.hubs.lock().await;
        if hubs.get(partition).is_some_and(|current| Arc::ptr_eq(current, hub)) {
            hubs.remove(partition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{ChannelSink, HubMessage};
    use crate::persistence::{Persistence, SqlitePersistence};
    use serde_json::json;

    async fn test_registry() -> HubRegistry {
        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::connect("sqlite::memory:")
                .await
                .expect("Failed to create in-memory SQLite persistence"),
        );
        HubRegistry::new(QueryAggregator::new(persistence))
    }

    #[tokio::test]
    async fn test_hub_is_shared_per_partition() {
        let registry = test_registry().await;
        let a = registry.hub("orders").await;
        let b = registry.hub("orders").await;
        let c = registry.hub("invoices").await;

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.partitions().await, vec!["invoices", "orders"]);
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let registry = test_registry().await;
        let (sink_orders, mut rx_orders) = ChannelSink::channel(8);
        let (sink_invoices, mut rx_invoices) = ChannelSink::channel(8);
        registry
            .subscribe("orders", Arc::new(sink_orders))
            .await
            .unwrap();
        registry
            .subscribe("invoices", Arc::new(sink_invoices))
            .await
            .unwrap();
        rx_orders.recv().await.unwrap();
        rx_invoices.recv().await.unwrap();

        let report = registry.broadcast("orders", json!({"n": 1})).await;
        assert_eq!(report.delivered, 1);

        assert!(matches!(
            rx_orders.recv().await.unwrap().as_ref(),
            HubMessage::Update { .. }
        ));
        assert!(rx_invoices.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_to_unknown_partition_creates_nothing() {
        let registry = test_registry().await;
        let report = registry.broadcast("ghost", json!({})).await;
        assert_eq!(report, BroadcastReport::default());
        assert!(registry.partitions().await.is_empty());
    }

    #[tokio::test]
    async fn test_reap_only_empty_hubs() {
        let registry = test_registry().await;
        registry.hub("empty").await;
        let (sink, _rx) = ChannelSink::channel(8);
        registry.subscribe("busy", Arc::new(sink)).await.unwrap();

        let reaped = registry.reap_idle(Duration::ZERO).await;
        assert_eq!(reaped, vec!["empty".to_string()]);
        assert_eq!(registry.partitions().await, vec!["busy"]);
    }

    #[tokio::test]
    async fn test_recreated_hub_requires_resubscribe() {
        let registry = test_registry().await;
        let (sink, mut rx) = ChannelSink::channel(8);
        let (old_hub, _) = registry
            .subscribe("orders", Arc::new(sink))
            .await
            .unwrap();
        rx.recv().await.unwrap();

        assert_eq!(registry.remove("orders").await, Some(1));
        assert!(rx.recv().await.is_none());

        let new_hub = registry.hub("orders").await;
        assert!(!Arc::ptr_eq(&old_hub, &new_hub));
        assert_eq!(new_hub.observer_count().await, 0);
    }
}
