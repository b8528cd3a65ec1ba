// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::notifier::NotifierConfig;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// QUIC server address for callers and agents
    pub quic_addr: SocketAddr,
    pub notifier: NotifierConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `TCC_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `TCC_QUIC_PORT`: QUIC server port (default: 8001)
    /// - `TCC_AGENT_QUEUE_CAPACITY`: per-agent commit/cancel queue size (default: 1024)
    /// - `TCC_REPLAY_INTERVAL_SECS`: seconds between replay sweeps (default: 60)
    /// - `TCC_RETENTION_SECS`: age after which pending commands are logged as stale, 0 to disable (default: 600)
    /// - `TCC_ENQUEUE_TIMEOUT_MS`: wait for queue space before deferring to replay (default: 5000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("TCC_DATABASE_URL").map_err(|_| ConfigError::Missing("TCC_DATABASE_URL"))?;

        let quic_port: u16 = parse_var("TCC_QUIC_PORT", 8001, "must be a valid port number")?;

        let defaults = NotifierConfig::default();

        let queue_capacity: usize = parse_var(
            "TCC_AGENT_QUEUE_CAPACITY",
            defaults.queue_capacity,
            "must be a positive integer",
        )?;
        if queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "TCC_AGENT_QUEUE_CAPACITY",
                "must be a positive integer",
            ));
        }

        let replay_secs: u64 = parse_var(
            "TCC_REPLAY_INTERVAL_SECS",
            defaults.replay_interval.as_secs(),
            "must be a positive number of seconds",
        )?;
        if replay_secs == 0 {
            return Err(ConfigError::Invalid(
                "TCC_REPLAY_INTERVAL_SECS",
                "must be a positive number of seconds",
            ));
        }

        let retention_secs: u64 = parse_var(
            "TCC_RETENTION_SECS",
            defaults.retention.as_secs(),
            "must be a number of seconds",
        )?;

        let enqueue_timeout_ms: u64 = parse_var(
            "TCC_ENQUEUE_TIMEOUT_MS",
            defaults.enqueue_timeout.as_millis() as u64,
            "must be a number of milliseconds",
        )?;

        Ok(Self {
            database_url,
            quic_addr: SocketAddr::from(([0, 0, 0, 0], quic_port)),
            notifier: NotifierConfig {
                queue_capacity,
                replay_interval: Duration::from_secs(replay_secs),
                retention: Duration::from_secs(retention_secs),
                enqueue_timeout: Duration::from_millis(enqueue_timeout_ms),
            },
        })
    }
}

fn parse_var<T: FromStr>(
    key: &'static str,
    default: T,
    message: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid(key, message)),
        Err(_) => Ok(default),
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
