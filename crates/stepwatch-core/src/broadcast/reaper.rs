// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that tears down idle broadcast hubs.
//!
//! A hub is reaped once it has had no observers and no activity for the
//! configured threshold. Observers of a reaped hub are dropped and must
//! resubscribe to get a fresh snapshot.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use super::HubRegistry;

/// Configuration for the hub reaper.
#[derive(Debug, Clone)]
pub struct HubReaperConfig {
    /// How long a hub must sit empty before teardown.
    pub idle_threshold: Duration,
    /// How often to check.
    pub poll_interval: Duration,
}

impl Default for HubReaperConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(300),
            poll_interval: Duration::from_secs(60),
        }
    }
}

impl HubReaperConfig {
    /// Derive a config from an idle threshold, polling at a fraction of it.
    pub fn with_idle_threshold(idle_threshold: Duration) -> Self {
        let poll_interval = (idle_threshold / 5).clamp(Duration::from_secs(1), Duration::from_secs(60));
        Self {
            idle_threshold,
            poll_interval,
        }
    }
}

/// Background worker that reaps idle hubs.
pub struct HubReaper {
    registry: Arc<HubRegistry>,
    config: HubReaperConfig,
    shutdown: Arc<Notify>,
}

impl HubReaper {
    pub fn new(registry: Arc<HubRegistry>, config: HubReaperConfig) -> Self {
        Self {
            registry,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reaper loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            idle_threshold_secs = self.config.idle_threshold.as_secs(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Hub reaper started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Hub reaper shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let reaped = self.run_once().await;
                    if !reaped.is_empty() {
                        debug!(partitions = ?reaped, "Reaped idle hubs");
                    }
                }
            }
        }
    }

    /// Run a single reaping pass.
    pub async fn run_once(&self) -> Vec<String> {
        self.registry.reap_idle(self.config.idle_threshold).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{Persistence, SqlitePersistence};
    use crate::query::QueryAggregator;

    async fn test_registry() -> Arc<HubRegistry> {
        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::connect("sqlite::memory:")
                .await
                .expect("Failed to create in-memory SQLite persistence"),
        );
        Arc::new(HubRegistry::new(QueryAggregator::new(persistence)))
    }

    #[test]
    fn test_config_poll_interval_is_bounded() {
        let config = HubReaperConfig::with_idle_threshold(Duration::from_secs(300));
        assert_eq!(config.poll_interval, Duration::from_secs(60));

        let config = HubReaperConfig::with_idle_threshold(Duration::from_secs(2));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_run_once_respects_threshold() {
        let registry = test_registry().await;
        registry.hub("fresh").await;

        let patient = HubReaper::new(
            registry.clone(),
            HubReaperConfig::with_idle_threshold(Duration::from_secs(3600)),
        );
        assert!(patient.run_once().await.is_empty());

        let eager = HubReaper::new(registry.clone(), HubReaperConfig {
            idle_threshold: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
        });
        assert_eq!(eager.run_once().await, vec!["fresh".to_string()]);
        assert!(registry.partitions().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let registry = test_registry().await;
        let reaper = Arc::new(HubReaper::new(registry, HubReaperConfig {
            idle_threshold: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
        }));
        let shutdown = reaper.shutdown_handle();

        let task = tokio::spawn({
            let reaper = reaper.clone();
            async move { reaper.run().await }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("reaper should stop after shutdown")
            .unwrap();
    }
}
