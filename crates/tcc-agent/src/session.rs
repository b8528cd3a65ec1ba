// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client-side transaction scope.
//!
//! ```rust,ignore
//! let session = Session::new(&agent, &incoming_ctx).await?;
//! let reserved = session
//!     .local_call("inventory.reserve", |ctx| inventory.reserve(ctx, sku))
//!     .await;
//! match reserved {
//!     Ok(_) => session.commit().await?,
//!     Err(_) => session.cancel().await?,
//! }
//!
//! // Or let the scope pick the outcome.
//! Session::scope(&agent, &incoming_ctx, |session| async move {
//!     session
//!         .local_call("inventory.reserve", |ctx| inventory.reserve(ctx, sku))
//!         .await
//! })
//! .await?;
//! ```

use std::future::Future;

use tracing::{debug, warn};

use crate::agent::Agent;
use crate::context::TxContext;
use crate::error::{AgentError, BoxError, CallPhase, Result};

/// A transaction either owned by this caller or joined from its context.
#[derive(Debug, Clone)]
pub struct Session {
    agent: Agent,
    tx_id: String,
    linked: bool,
}

impl Session {
    /// Join the transaction carried by `ctx`, or open a new root one.
    pub async fn new(agent: &Agent, ctx: &TxContext) -> Result<Self> {
        if ctx.has_tx() {
            debug!(tx_id = %ctx.tx_id, "Joining propagated transaction");
            return Ok(Self {
                agent: agent.clone(),
                tx_id: ctx.tx_id.clone(),
                linked: true,
            });
        }

        let tx_id = agent.new_tx("").await?;
        debug!(tx_id = %tx_id, "Opened transaction");
        Ok(Self {
            agent: agent.clone(),
            tx_id,
            linked: false,
        })
    }

    /// Run `f` in a session and finish it by outcome: commit on `Ok`,
    /// cancel on `Err`. Both are no-ops for a joined transaction.
    pub async fn scope<F, Fut, T>(agent: &Agent, ctx: &TxContext, f: F) -> Result<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = Self::new(agent, ctx).await?;
        match f(session.clone()).await {
            Ok(output) => {
                session.commit().await?;
                Ok(output)
            }
            Err(e) => {
                if let Err(cancel_err) = session.cancel().await {
                    warn!(tx_id = %session.tx_id, error = %cancel_err, "Cancel after failed scope failed");
                }
                Err(e)
            }
        }
    }

    pub fn tx_id(&self) -> &str {
        &self.tx_id
    }

    /// True when the transaction belongs to an outer caller.
    pub fn is_linked(&self) -> bool {
        self.linked
    }

    /// Context to hand to nested calls.
    pub fn context(&self) -> TxContext {
        TxContext::with_tx(self.tx_id.clone())
    }

    /// Commit, unless the transaction is owned by an outer caller.
    pub async fn commit(&self) -> Result<()> {
        if self.linked {
            return Ok(());
        }
        self.agent.commit(&self.tx_id).await
    }

    /// Cancel, unless the transaction is owned by an outer caller.
    pub async fn cancel(&self) -> Result<()> {
        if self.linked {
            return Ok(());
        }
        self.agent.cancel(&self.tx_id).await
    }

    /// Run `f` under a lock on `resource`.
    ///
    /// `f` receives the context carrying the issued lock id. Failures are
    /// wrapped with the resource name and the phase that failed.
    pub async fn local_call<F, Fut, T, E>(&self, resource: &str, f: F) -> Result<T>
    where
        F: FnOnce(TxContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let wrap = |phase: CallPhase, source: BoxError| AgentError::LocalCall {
            resource: resource.to_string(),
            phase,
            source,
        };

        let lock_id = self
            .agent
            .before_require(&self.tx_id, resource)
            .await
            .map_err(|e| wrap(CallPhase::BeforeRequire, Box::new(e)))?;

        let ctx = TxContext {
            tx_id: self.tx_id.clone(),
            lock_id: lock_id.clone(),
            locally_rooted: false,
        };
        let output = f(ctx).await.map_err(|e| wrap(CallPhase::Call, e.into()))?;

        if let Some(lock_id) = lock_id {
            self.agent
                .after_require(&self.tx_id, resource, &lock_id)
                .await
                .map_err(|e| wrap(CallPhase::AfterRequire, Box::new(e)))?;
        }
        Ok(output)
    }
}
