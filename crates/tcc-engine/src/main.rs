// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCC Engine - transaction coordinator server

use anyhow::Result;
use tracing::{error, info};

use tcc_engine::config::Config;
use tcc_engine::{Engine, storage};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tcc_engine=info".parse()?),
        )
        .init();

    info!("Starting TCC Engine");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        quic_addr = %config.quic_addr,
        queue_capacity = config.notifier.queue_capacity,
        replay_interval_secs = config.notifier.replay_interval.as_secs(),
        retention_secs = config.notifier.retention.as_secs(),
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let storage = storage::connect(&config.database_url).await?;
    storage.health_check().await?;
    info!("Database health check passed");

    let engine = Engine::builder()
        .storage(storage)
        .notifier_config(config.notifier)
        .bind_addr(config.quic_addr)
        .build()?
        .start()
        .await?;

    info!("TCC Engine initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    engine.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
