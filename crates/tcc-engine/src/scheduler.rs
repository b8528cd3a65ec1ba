// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authoritative transaction and resource lifecycle.
//!
//! The scheduler persists every state change before acting on it. Agent
//! notification after commit/cancel is spawned and never awaited by the
//! caller; the notifier's replay loop covers anything that gets lost.

use std::sync::Arc;

use tracing::{debug, error, info, instrument};

use crate::error::{EngineError, Result};
use crate::ids::{IdGenerator, resource_id};
use crate::notifier::{CommandSink, Notifier};
use crate::storage::{LockKey, ResourceStatus, Storage, TxStatus};

pub struct Scheduler {
    storage: Arc<dyn Storage>,
    notifier: Arc<dyn Notifier>,
    ids: Arc<dyn IdGenerator>,
}

impl Scheduler {
    pub fn new(
        storage: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            storage,
            notifier,
            ids,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Create a transaction, optionally nested under `parent_id` (empty for a
    /// root transaction).
    #[instrument(skip(self))]
    pub async fn new_tx(&self, parent_id: &str) -> Result<String> {
        let tx_id = self.ids.next_id();
        self.storage.new_tx(&tx_id, parent_id).await?;
        info!(tx_id = %tx_id, "Transaction created");
        Ok(tx_id)
    }

    /// Confirm `tx_id`. Repeating a commit is a no-op.
    #[instrument(skip(self))]
    pub async fn commit(&self, tx_id: &str) -> Result<()> {
        self.finish(tx_id, TxStatus::Confirmed).await
    }

    /// Cancel `tx_id`. Repeating a cancel is a no-op.
    #[instrument(skip(self))]
    pub async fn cancel(&self, tx_id: &str) -> Result<()> {
        self.finish(tx_id, TxStatus::Canceled).await
    }

    async fn finish(&self, tx_id: &str, status: TxStatus) -> Result<()> {
        if tx_id.is_empty() {
            return Err(EngineError::validation("tx_id", "must not be empty"));
        }

        if !self.storage.update_tx_status(tx_id, status).await? {
            let current = self
                .storage
                .get_tx(tx_id)
                .await?
                .ok_or_else(|| EngineError::NotFound {
                    entity: "Transaction",
                    id: tx_id.to_string(),
                })?
                .status()?;

            if current == status {
                debug!(tx_id = %tx_id, status = %status, "Transaction already finished");
                return Ok(());
            }
            return Err(EngineError::InvalidTransition {
                tx_id: tx_id.to_string(),
                from: current.to_string(),
                to: status.to_string(),
            });
        }

        info!(tx_id = %tx_id, status = %status, "Transaction finished");

        let notifier = self.notifier.clone();
        let tx_id = tx_id.to_string();
        tokio::spawn(async move {
            let result = match status {
                TxStatus::Canceled => notifier.cancel_tx(&tx_id).await,
                _ => notifier.commit_tx(&tx_id).await,
            };
            if let Err(e) = result {
                error!(tx_id = %tx_id, error = %e, "Failed to notify agents, leaving to replay");
            }
        });

        Ok(())
    }

    /// Record the start of a lock attempt. A repeated attempt with the same
    /// key fails with `AlreadyExists`.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn begin_lock_resource(&self, key: &LockKey) -> Result<String> {
        key.validate()?;
        let id = resource_id(&self.ids.next_id());
        self.storage.new_resource(&id, key).await?;
        debug!(resource_id = %id, "Resource lock started");
        Ok(id)
    }

    /// Mark a lock attempt as held.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn end_lock_resource(&self, key: &LockKey) -> Result<()> {
        key.validate()?;
        if self
            .storage
            .update_resource_status(key, ResourceStatus::Locked)
            .await?
        {
            debug!("Resource locked");
            return Ok(());
        }

        // Nothing moved: either the row is unknown or it already left `created`.
        let exists = self
            .storage
            .get_resources_by_tx(&key.tx_id)
            .await?
            .iter()
            .any(|r| r.key() == *key);
        if exists {
            Ok(())
        } else {
            Err(EngineError::NotFound {
                entity: "Resource lock",
                id: key.to_string(),
            })
        }
    }

    /// Attach an agent's command stream. Completes when the stream ends.
    pub async fn attach_agent(&self, agent_id: &str, sink: Box<dyn CommandSink>) -> Result<()> {
        if agent_id.is_empty() {
            return Err(EngineError::validation("agent", "must not be empty"));
        }
        self.notifier.run_agent(agent_id, sink).await
    }

    /// Record an agent's outcome for every lock of `(tx, agent, resource)`.
    #[instrument(skip(self))]
    pub async fn resource_status_changed(
        &self,
        tx_id: &str,
        agent: &str,
        resource: &str,
        status: ResourceStatus,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(EngineError::validation(
                "status",
                format!("expected confirmed or canceled, got {}", status),
            ));
        }
        for (field, value) in [("tx_id", tx_id), ("agent", agent), ("resource", resource)] {
            if value.is_empty() {
                return Err(EngineError::validation(field, "must not be empty"));
            }
        }

        let changed = self
            .storage
            .update_resources_status(tx_id, agent, resource, status)
            .await?;
        debug!(changed, "Resource status recorded");
        Ok(())
    }
}
