// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent configuration for connecting to tcc-engine.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{AgentError, Result};

const DEFAULT_REATTACH_BACKOFF_MS: u64 = 10_000;

/// Agent configuration for connecting to tcc-engine.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent ID (required) - commands for this agent's resources are routed to it
    pub agent_id: String,
    /// Engine address (required)
    pub engine_addr: SocketAddr,
    /// Server name for TLS verification (default: "localhost")
    pub server_name: String,
    /// Skip TLS certificate verification (default: false, use true for dev)
    pub skip_cert_verification: bool,
    /// Connection timeout in milliseconds (default: 10_000)
    pub connect_timeout_ms: u64,
    /// Request timeout in milliseconds (default: 30_000)
    pub request_timeout_ms: u64,
    /// Delay before re-attaching after the command stream drops (default: 10s)
    pub reattach_backoff: Duration,
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Required Environment Variables
    /// - `TCC_AGENT_ID` - Agent identifier
    /// - `TCC_ENGINE_ADDR` - Engine QUIC address, e.g. "127.0.0.1:8001"
    ///
    /// # Optional Environment Variables
    /// - `TCC_SERVER_NAME` - Server name for TLS (default: "localhost")
    /// - `TCC_SKIP_CERT_VERIFICATION` - Skip TLS verification (default: false)
    /// - `TCC_CONNECT_TIMEOUT_MS` - Connection timeout (default: 10000)
    /// - `TCC_REQUEST_TIMEOUT_MS` - Request timeout (default: 30000)
    /// - `TCC_REATTACH_BACKOFF_MS` - Re-attach delay (default: 10000)
    pub fn from_env() -> Result<Self> {
        let agent_id = env::var("TCC_AGENT_ID")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AgentError::Config("TCC_AGENT_ID is required".to_string()))?;

        let engine_addr = env::var("TCC_ENGINE_ADDR")
            .map_err(|_| AgentError::Config("TCC_ENGINE_ADDR is required".to_string()))?
            .parse()
            .map_err(|e| AgentError::Config(format!("invalid TCC_ENGINE_ADDR: {}", e)))?;

        let server_name = env::var("TCC_SERVER_NAME").unwrap_or_else(|_| "localhost".to_string());

        let skip_cert_verification = env::var("TCC_SKIP_CERT_VERIFICATION")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let connect_timeout_ms = env::var("TCC_CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);

        let request_timeout_ms = env::var("TCC_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30_000);

        let reattach_backoff_ms = env::var("TCC_REATTACH_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REATTACH_BACKOFF_MS);

        Ok(Self {
            agent_id,
            engine_addr,
            server_name,
            skip_cert_verification,
            connect_timeout_ms,
            request_timeout_ms,
            reattach_backoff: Duration::from_millis(reattach_backoff_ms),
        })
    }

    /// Configuration for a local engine with a self-signed certificate.
    pub fn localhost(agent_id: impl Into<String>, engine_addr: SocketAddr) -> Self {
        Self {
            agent_id: agent_id.into(),
            engine_addr,
            server_name: "localhost".to_string(),
            skip_cert_verification: true,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            reattach_backoff: Duration::from_millis(DEFAULT_REATTACH_BACKOFF_MS),
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn with_reattach_backoff(mut self, backoff: Duration) -> Self {
        self.reattach_backoff = backoff;
        self
    }

    #[cfg(feature = "quic")]
    pub(crate) fn client_config(&self) -> tcc_protocol::EngineClientConfig {
        tcc_protocol::EngineClientConfig {
            server_addr: self.engine_addr,
            server_name: self.server_name.clone(),
            dangerous_skip_cert_verification: self.skip_cert_verification,
            connect_timeout_ms: self.connect_timeout_ms,
            request_timeout_ms: self.request_timeout_ms,
            ..Default::default()
        }
    }
}
