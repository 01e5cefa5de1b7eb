// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for stepwatch-core.
//!
//! [`TrackerRuntime`] runs the HTTP/WebSocket transport and the idle hub
//! reaper inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stepwatch_core::runtime::TrackerRuntime;
//! use stepwatch_core::persistence::SqlitePersistence;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::connect("sqlite:tracker.db?mode=rwc").await?);
//!
//!     let runtime = TrackerRuntime::builder()
//!         .persistence(persistence)
//!         .bind_addr("0.0.0.0:8080".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // Record state in-process through the same tracker the server uses.
//!     runtime.tracker().publish(serde_json::json!({"hello": "world"})).await;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::broadcast::{HubReaper, HubReaperConfig};
use crate::persistence::Persistence;
use crate::server::{self, DEFAULT_OBSERVER_BUFFER, HttpState};
use crate::tracker::{DEFAULT_PARTITION, Tracker};

/// Builder for creating a [`TrackerRuntime`].
pub struct TrackerRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    bind_addr: SocketAddr,
    partition: String,
    observer_buffer: usize,
    hub_idle_timeout: Option<Duration>,
    strict_step_indices: bool,
}

impl std::fmt::Debug for TrackerRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("bind_addr", &self.bind_addr)
            .field("partition", &self.partition)
            .field("observer_buffer", &self.observer_buffer)
            .field("hub_idle_timeout", &self.hub_idle_timeout)
            .field("strict_step_indices", &self.strict_step_indices)
            .finish()
    }
}

impl Default for TrackerRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            partition: DEFAULT_PARTITION.to_string(),
            observer_buffer: DEFAULT_OBSERVER_BUFFER,
            hub_idle_timeout: Some(Duration::from_secs(300)),
            strict_step_indices: false,
        }
    }
}

impl TrackerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the bind address for the HTTP server.
    ///
    /// Default: `0.0.0.0:8080`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the default live-channel partition.
    ///
    /// Default: `workflow-tracker`
    pub fn partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    /// Set the outbound queue depth per live observer.
    pub fn observer_buffer(mut self, observer_buffer: usize) -> Self {
        self.observer_buffer = observer_buffer;
        self
    }

    /// Set the idle teardown threshold for hubs. `None` disables the reaper.
    pub fn hub_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.hub_idle_timeout = timeout;
        self
    }

    /// Reject reused or negative step indices on insert.
    pub fn strict_step_indices(mut self, strict: bool) -> Self {
        self.strict_step_indices = strict;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or invalid.
    pub fn build(self) -> Result<TrackerRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;

        if self.partition.trim().is_empty() {
            anyhow::bail!("partition must not be empty");
        }
        if self.observer_buffer == 0 {
            anyhow::bail!("observer_buffer must be positive");
        }

        Ok(TrackerRuntimeConfig {
            persistence,
            bind_addr: self.bind_addr,
            partition: self.partition,
            observer_buffer: self.observer_buffer,
            hub_idle_timeout: self.hub_idle_timeout,
            strict_step_indices: self.strict_step_indices,
        })
    }
}

/// Configuration for a [`TrackerRuntime`].
pub struct TrackerRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    bind_addr: SocketAddr,
    partition: String,
    observer_buffer: usize,
    hub_idle_timeout: Option<Duration>,
    strict_step_indices: bool,
}

impl std::fmt::Debug for TrackerRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerRuntimeConfig")
            .field("persistence", &"...")
            .field("bind_addr", &self.bind_addr)
            .field("partition", &self.partition)
            .field("observer_buffer", &self.observer_buffer)
            .field("hub_idle_timeout", &self.hub_idle_timeout)
            .field("strict_step_indices", &self.strict_step_indices)
            .finish()
    }
}

impl TrackerRuntimeConfig {
    /// Start the runtime, spawning the HTTP server and hub reaper tasks.
    pub async fn start(self) -> Result<TrackerRuntime> {
        let tracker = Tracker::new(self.persistence)
            .with_partition(self.partition)
            .with_strict_step_indices(self.strict_step_indices);

        let listener = TcpListener::bind(self.bind_addr).await?;
        let bind_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = HttpState::new(tracker.clone()).with_observer_buffer(self.observer_buffer);
        let server_handle = tokio::spawn(server::run_http_server(listener, state, shutdown_rx));

        let reaper = self.hub_idle_timeout.map(|threshold| {
            let reaper = HubReaper::new(
                tracker.hubs().clone(),
                HubReaperConfig::with_idle_threshold(threshold),
            );
            let shutdown = reaper.shutdown_handle();
            let handle = tokio::spawn(async move { reaper.run().await });
            (shutdown, handle)
        });

        info!(addr = %bind_addr, partition = %tracker.partition(), "TrackerRuntime started");

        Ok(TrackerRuntime {
            server_handle,
            reaper,
            shutdown_tx,
            tracker,
            bind_addr,
        })
    }
}

/// A running stepwatch-core instance that can be embedded in an application.
///
/// The runtime manages:
/// - HTTP/WebSocket server over the [`Tracker`]
/// - Idle hub reaper (unless disabled)
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct TrackerRuntime {
    server_handle: JoinHandle<Result<()>>,
    reaper: Option<(Arc<Notify>, JoinHandle<()>)>,
    shutdown_tx: watch::Sender<bool>,
    tracker: Tracker,
    bind_addr: SocketAddr,
}

impl TrackerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> TrackerRuntimeBuilder {
        TrackerRuntimeBuilder::new()
    }

    /// Get the address the HTTP server is bound to.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// The tracker shared with the HTTP server.
    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Get a reference to the persistence layer.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        self.tracker.persistence()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the reaper, signals the HTTP server to stop accepting requests
    /// and waits for in-flight requests to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("TrackerRuntime shutting down...");

        if let Some((shutdown, handle)) = self.reaper {
            shutdown.notify_one();
            if let Err(e) = handle.await {
                error!("Hub reaper task panicked: {}", e);
            }
        }

        let _ = self.shutdown_tx.send(true);

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("TrackerRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("TrackerRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("TrackerRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }
}
