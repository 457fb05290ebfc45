// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connector Transfer daemon
//!
//! Runs the transfer process manager against SQLite or PostgreSQL until Ctrl-C.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use connector_core::persistence::{PostgresEntityStore, SqliteEntityStore, postgres, sqlite};
use connector_core::{Clock, StateEntityManager, StateEntityStore, SystemClock, telemetry};
use connector_transfer::{
    Config, InMemoryAssetIndex, InMemoryDataFlowController, TransferProcess,
    TransferProcessManager,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    telemetry::init_subscriber()?;

    info!("Starting Connector Transfer");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        runtime_id = %config.runtime_id,
        batch_size = config.transfer.batch_size,
        lease_duration_ms = config.transfer.lease_duration.as_millis() as u64,
        assets = config.asset_ids.len(),
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let lease_duration = config.transfer.lease_duration;

    // Connect to database; both backends run migrations on connect
    info!("Connecting to database...");
    let store: Arc<dyn StateEntityStore<TransferProcess>> = if config.is_sqlite() {
        let pool = sqlite::connect(&config.database_url).await?;
        info!("SQLite database ready");
        Arc::new(SqliteEntityStore::new(
            pool,
            config.runtime_id.clone(),
            lease_duration,
            clock.clone(),
        ))
    } else {
        let pool = postgres::connect(&config.database_url, config.max_connections).await?;
        info!(max_connections = config.max_connections, "PostgreSQL database ready");
        Arc::new(PostgresEntityStore::new(
            pool,
            config.runtime_id.clone(),
            lease_duration,
            clock.clone(),
        ))
    };

    let entities = StateEntityManager::new("transfer-process", store, clock, config.transfer);
    let manager = TransferProcessManager::new(
        entities,
        Arc::new(InMemoryAssetIndex::new(config.asset_ids)),
        Arc::new(InMemoryDataFlowController::new()),
    );

    manager.start()?;
    info!("Connector Transfer initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    manager.stop().await?;
    info!("Shutdown complete");

    Ok(())
}
