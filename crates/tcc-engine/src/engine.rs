// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable engine runtime.
//!
//! [`Engine`] wires storage, notifier and scheduler together, runs the replay
//! loop and, with the `server` feature, the QUIC server.
//!
//! # Example
//!
//! ```rust,ignore
//! use tcc_engine::{Engine, storage};
//!
//! let engine = Engine::builder()
//!     .storage(storage::connect("sqlite::memory:").await?)
//!     .bind_addr("0.0.0.0:8001".parse()?)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! let tx_id = engine.scheduler().new_tx("").await?;
//!
//! engine.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::ids::{IdGenerator, UuidV7Generator};
use crate::notifier::{NotifierConfig, StreamNotifier};
use crate::scheduler::Scheduler;
use crate::storage::Storage;

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    storage: Option<Arc<dyn Storage>>,
    ids: Arc<dyn IdGenerator>,
    notifier: NotifierConfig,
    bind_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("storage", &self.storage.as_ref().map(|_| "..."))
            .field("notifier", &self.notifier)
            .field("bind_addr", &self.bind_addr)
            .finish()
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            storage: None,
            ids: Arc::new(UuidV7Generator),
            notifier: NotifierConfig::default(),
            bind_addr: None,
        }
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage backend (required).
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn notifier_config(mut self, config: NotifierConfig) -> Self {
        self.notifier = config;
        self
    }

    /// Serve the QUIC protocol on `addr`. Without it the engine is in-process only.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        let storage = self
            .storage
            .ok_or_else(|| anyhow::anyhow!("storage is required"))?;

        Ok(EngineConfig {
            storage,
            ids: self.ids,
            notifier: self.notifier,
            bind_addr: self.bind_addr,
        })
    }
}

/// Validated configuration for an [`Engine`].
pub struct EngineConfig {
    storage: Arc<dyn Storage>,
    ids: Arc<dyn IdGenerator>,
    notifier: NotifierConfig,
    bind_addr: Option<SocketAddr>,
}

impl EngineConfig {
    /// Start background tasks and return the running engine.
    pub async fn start(self) -> Result<Engine> {
        let notifier = Arc::new(StreamNotifier::new(self.storage.clone(), self.notifier));
        let scheduler = Arc::new(Scheduler::new(self.storage, notifier.clone(), self.ids));
        let shutdown = CancellationToken::new();

        let mut tasks = vec![tokio::spawn(notifier.clone().run_replay(shutdown.clone()))];
        let mut local_addr = None;

        if let Some(addr) = self.bind_addr {
            #[cfg(feature = "server")]
            {
                let server = tcc_protocol::server::EngineServer::localhost(addr)?;
                local_addr = Some(server.local_addr()?);
                let scheduler = scheduler.clone();
                let shutdown = shutdown.clone();
                tasks.push(tokio::spawn(async move {
                    crate::server::serve_until(server, scheduler, shutdown).await;
                }));
            }
            #[cfg(not(feature = "server"))]
            anyhow::bail!("cannot serve on {}: built without the `server` feature", addr);
        }

        info!(addr = ?local_addr, "Engine started");

        Ok(Engine {
            scheduler,
            notifier,
            shutdown,
            tasks,
            local_addr,
        })
    }
}

/// A running coordinator.
pub struct Engine {
    scheduler: Arc<Scheduler>,
    notifier: Arc<StreamNotifier>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn notifier(&self) -> &Arc<StreamNotifier> {
        &self.notifier
    }

    /// Address the QUIC server is bound to, if serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    /// Stop the replay loop and the server, waiting for both to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("Engine shutting down...");
        self.shutdown.cancel();

        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Engine task panicked: {}", e);
                return Err(anyhow::anyhow!("engine task panicked: {}", e));
            }
        }

        info!("Engine shutdown complete");
        Ok(())
    }
}
