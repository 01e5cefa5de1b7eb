// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use crate::tracker::DEFAULT_PARTITION;

/// Stepwatch configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// HTTP server address
    pub http_addr: SocketAddr,
    /// Default live-channel partition
    pub partition: String,
    /// Outbound queue depth per live observer
    pub observer_buffer: usize,
    /// Idle time before an empty hub is torn down; `None` disables teardown
    pub hub_idle_timeout: Option<Duration>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `STEPWATCH_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `STEPWATCH_HTTP_PORT`: HTTP server port (default: 8080)
    /// - `STEPWATCH_PARTITION`: default live-channel partition (default: workflow-tracker)
    /// - `STEPWATCH_OBSERVER_BUFFER`: per-observer queue depth (default: 64)
    /// - `STEPWATCH_HUB_IDLE_SECS`: idle hub teardown threshold, 0 disables (default: 300)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STEPWATCH_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("STEPWATCH_DATABASE_URL"))?;

        let http_port: u16 = std::env::var("STEPWATCH_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("STEPWATCH_HTTP_PORT", "must be a valid port number")
            })?;

        let partition = std::env::var("STEPWATCH_PARTITION")
            .unwrap_or_else(|_| DEFAULT_PARTITION.to_string());
        if partition.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "STEPWATCH_PARTITION",
                "must not be empty",
            ));
        }

        let observer_buffer: usize = std::env::var("STEPWATCH_OBSERVER_BUFFER")
            .unwrap_or_else(|_| "64".to_string())
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "STEPWATCH_OBSERVER_BUFFER",
                "must be a positive integer",
            ))?;

        let hub_idle_secs: u64 = std::env::var("STEPWATCH_HUB_IDLE_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "STEPWATCH_HUB_IDLE_SECS",
                    "must be a non-negative integer",
                )
            })?;

        Ok(Self {
            database_url,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            partition,
            observer_buffer,
            hub_idle_timeout: (hub_idle_secs > 0).then(|| Duration::from_secs(hub_idle_secs)),
        })
    }

    /// True when the database URL points at SQLite.
    pub fn is_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite:")
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
