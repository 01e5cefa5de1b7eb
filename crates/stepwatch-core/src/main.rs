// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stepwatch Core - Workflow State Tracker
//!
//! Core is responsible for:
//! - Workflow, run, step and retry records
//! - Status propagation from runs to workflows
//! - Live fan-out of state changes to WebSocket observers

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use stepwatch_core::config::Config;
use stepwatch_core::migrations;
use stepwatch_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use stepwatch_core::runtime::TrackerRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stepwatch_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting Stepwatch Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        http_addr = %config.http_addr,
        partition = %config.partition,
        observer_buffer = config.observer_buffer,
        hub_idle_secs = config.hub_idle_timeout.map(|d| d.as_secs()).unwrap_or(0),
        "Configuration loaded"
    );

    // Connect to database
    info!("Connecting to database...");
    let persistence: Arc<dyn Persistence> = if config.is_sqlite() {
        Arc::new(SqlitePersistence::connect(&config.database_url).await?)
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;

        info!("Running database migrations...");
        migrations::run_postgres(&pool).await?;
        info!("Migrations completed");

        Arc::new(PostgresPersistence::new(pool))
    };

    if !persistence.health_check_db().await? {
        anyhow::bail!("database health check failed");
    }
    info!("Database health check passed");

    let runtime = TrackerRuntime::builder()
        .persistence(persistence)
        .bind_addr(config.http_addr)
        .partition(config.partition)
        .observer_buffer(config.observer_buffer)
        .hub_idle_timeout(config.hub_idle_timeout)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.bind_addr(), "Stepwatch Core initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
