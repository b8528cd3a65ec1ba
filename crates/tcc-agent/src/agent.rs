// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The agent: owns resource handlers, takes locks around protected calls and
//! applies the engine's commit/cancel commands.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{Command, CommandKind, EngineBackend, LockRequest};
use crate::context::TxContext;
use crate::error::{AgentError, Result};
use crate::handler::ResourceHandler;

/// Prefix of agent-issued lock ids.
pub const LOCK_ID_PREFIX: &str = "R_";

const DEFAULT_REATTACH_BACKOFF: Duration = Duration::from_secs(10);

struct Inner {
    agent_id: String,
    backend: Arc<dyn EngineBackend>,
    handlers: RwLock<HashMap<String, Arc<dyn ResourceHandler>>>,
}

/// A process hosting protected resources.
///
/// Cloning is cheap; clones share handlers, backend and shutdown state.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<Inner>,
    reattach_backoff: Duration,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("agent_id", &self.inner.agent_id)
            .field("reattach_backoff", &self.reattach_backoff)
            .finish()
    }
}

impl Agent {
    pub fn new(agent_id: impl Into<String>, backend: Arc<dyn EngineBackend>) -> Self {
        Self {
            inner: Arc::new(Inner {
                agent_id: agent_id.into(),
                backend,
                handlers: RwLock::new(HashMap::new()),
            }),
            reattach_backoff: DEFAULT_REATTACH_BACKOFF,
            shutdown: CancellationToken::new(),
        }
    }

    /// Agent talking to a remote engine over QUIC.
    #[cfg(feature = "quic")]
    pub fn connect(config: &crate::config::AgentConfig) -> Result<Self> {
        if config.agent_id.is_empty() {
            return Err(AgentError::Config("agent id must not be empty".to_string()));
        }
        let backend = crate::backend::quic::QuicBackend::new(config)?;
        Ok(Self::new(config.agent_id.clone(), Arc::new(backend))
            .with_reattach_backoff(config.reattach_backoff))
    }

    /// Agent calling an in-process scheduler.
    #[cfg(feature = "embedded")]
    pub fn embedded(
        agent_id: impl Into<String>,
        scheduler: Arc<tcc_engine::Scheduler>,
    ) -> Self {
        let backend = crate::backend::embedded::EmbeddedBackend::new(scheduler);
        Self::new(agent_id, Arc::new(backend))
    }

    pub fn with_reattach_backoff(mut self, backoff: Duration) -> Self {
        self.reattach_backoff = backoff;
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn backend(&self) -> &Arc<dyn EngineBackend> {
        &self.inner.backend
    }

    /// Register the handler for `resource`. Each name can be registered once.
    pub fn register(
        &self,
        resource: impl Into<String>,
        handler: Arc<dyn ResourceHandler>,
    ) -> Result<()> {
        let resource = resource.into();
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&resource) {
            return Err(AgentError::AlreadyRegistered(resource));
        }
        info!(agent_id = %self.inner.agent_id, resource = %resource, "Resource registered");
        handlers.insert(resource, handler);
        Ok(())
    }

    pub fn is_registered(&self, resource: &str) -> bool {
        self.handler(resource).is_some()
    }

    fn handler(&self, resource: &str) -> Option<Arc<dyn ResourceHandler>> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource)
            .cloned()
    }

    fn lock_request(&self, tx_id: &str, resource: &str, require_id: &str) -> LockRequest {
        LockRequest {
            tx_id: tx_id.to_string(),
            agent: self.inner.agent_id.clone(),
            resource: resource.to_string(),
            require_id: require_id.to_string(),
        }
    }

    /// Take a lock on `resource` for `tx_id` before the protected call runs.
    ///
    /// Returns the issued lock id, or `None` when the resource is not
    /// registered here and the call passes through unprotected.
    #[instrument(skip(self), fields(agent_id = %self.inner.agent_id))]
    pub async fn before_require(&self, tx_id: &str, resource: &str) -> Result<Option<String>> {
        if !self.is_registered(resource) {
            return Ok(None);
        }

        let require_id = format!("{}{}", LOCK_ID_PREFIX, Uuid::now_v7());
        let lock = self.lock_request(tx_id, resource, &require_id);
        if let Err(e) = self.inner.backend.begin_lock_resource(&lock).await {
            error!(require_id = %require_id, error = %e, "BeginLockResource failed");
            return Err(e);
        }

        debug!(require_id = %require_id, "Lock taken");
        Ok(Some(require_id))
    }

    /// Mark the lock taken by [`before_require`](Self::before_require) as held.
    #[instrument(skip(self), fields(agent_id = %self.inner.agent_id))]
    pub async fn after_require(&self, tx_id: &str, resource: &str, require_id: &str) -> Result<()> {
        if !self.is_registered(resource) {
            return Ok(());
        }

        let lock = self.lock_request(tx_id, resource, require_id);
        if let Err(e) = self.inner.backend.end_lock_resource(&lock).await {
            error!(error = %e, "EndLockResource failed");
            return Err(e);
        }
        Ok(())
    }

    /// Intercept an inbound protected call.
    ///
    /// A call arriving without a transaction gets an implicit root
    /// transaction, marked `locally_rooted` so [`exit`](Self::exit) commits it.
    pub async fn enter(&self, ctx: &TxContext, resource: &str) -> Result<TxContext> {
        if !self.is_registered(resource) {
            return Ok(ctx.clone());
        }

        let (tx_id, locally_rooted) = if ctx.has_tx() {
            // Only the agent that opened the transaction commits it.
            (ctx.tx_id.clone(), false)
        } else {
            let tx_id = self.inner.backend.new_tx("").await?;
            debug!(tx_id = %tx_id, resource = %resource, "Opened implicit transaction");
            (tx_id, true)
        };

        let lock_id = self.before_require(&tx_id, resource).await?;
        Ok(TxContext {
            tx_id,
            lock_id,
            locally_rooted,
        })
    }

    /// Finish an intercepted call entered with [`enter`](Self::enter).
    pub async fn exit(&self, ctx: &TxContext, resource: &str) -> Result<()> {
        let Some(lock_id) = &ctx.lock_id else {
            return Ok(());
        };

        self.after_require(&ctx.tx_id, resource, lock_id).await?;
        if ctx.locally_rooted {
            self.inner.backend.commit(&ctx.tx_id).await?;
        }
        Ok(())
    }

    pub async fn new_tx(&self, parent_tx_id: &str) -> Result<String> {
        self.inner.backend.new_tx(parent_tx_id).await
    }

    pub async fn commit(&self, tx_id: &str) -> Result<()> {
        self.inner.backend.commit(tx_id).await
    }

    pub async fn cancel(&self, tx_id: &str) -> Result<()> {
        self.inner.backend.cancel(tx_id).await
    }

    /// Spawn the attach loop. It re-attaches after `reattach_backoff`
    /// whenever the stream fails or ends, until shutdown.
    pub fn start(&self) -> AgentHandle {
        let agent = self.clone();
        AgentHandle {
            task: tokio::spawn(agent.run()),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Stop the attach loop of every clone of this agent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn run(self) {
        info!(agent_id = %self.inner.agent_id, "Agent attach loop started");

        while !self.shutdown.is_cancelled() {
            match self.serve_stream().await {
                Ok(()) if self.shutdown.is_cancelled() => break,
                Ok(()) => info!(agent_id = %self.inner.agent_id, "Command stream ended"),
                Err(e) => warn!(agent_id = %self.inner.agent_id, error = %e, "Command stream failed"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.reattach_backoff) => {}
            }
        }

        info!(agent_id = %self.inner.agent_id, "Agent attach loop stopped");
    }

    async fn serve_stream(&self) -> Result<()> {
        let mut stream = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Ok(()),
            stream = self.inner.backend.attach(&self.inner.agent_id) => stream?,
        };
        debug!(agent_id = %self.inner.agent_id, "Attached");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                next = stream.next_command() => next?,
            };
            match next {
                Some(cmd) => self.handle_command(cmd).await,
                None => return Ok(()),
            }
        }
    }

    /// Apply one pushed command and report the outcome.
    #[instrument(
        skip(self, cmd),
        fields(agent_id = %self.inner.agent_id, tx_id = %cmd.tx_id, resource = %cmd.resource, kind = ?cmd.kind)
    )]
    pub(crate) async fn handle_command(&self, cmd: Command) {
        let Some(handler) = self.handler(&cmd.resource) else {
            warn!("No handler registered for resource, dropping command");
            return;
        };

        let applied = match cmd.kind {
            CommandKind::Commit => handler.commit(&cmd.tx_id).await,
            CommandKind::Cancel => handler.cancel(&cmd.tx_id).await,
        };
        if let Err(e) = applied {
            error!(error = %e, "Resource handler failed, status not reported");
            return;
        }

        if let Err(e) = self
            .inner
            .backend
            .resource_status_changed(&cmd.tx_id, &self.inner.agent_id, &cmd.resource, cmd.outcome())
            .await
        {
            warn!(error = %e, "ResourceStatusChanged failed");
        }
    }
}

/// Handle to a running attach loop.
pub struct AgentHandle {
    task: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl AgentHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.task
            .await
            .map_err(|e| AgentError::Internal(format!("attach loop panicked: {}", e)))
    }
}
