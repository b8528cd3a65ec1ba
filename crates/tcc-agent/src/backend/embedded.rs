// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded backend calling an in-process [`Scheduler`] directly.
//!
//! Commands travel over a bounded channel instead of a QUIC stream; dropping
//! the [`CommandStream`] detaches the agent.

use std::sync::Arc;

use async_trait::async_trait;
use tcc_engine::{ChannelCommandSink, LockKey, ResourceStatus, Scheduler};
use tcc_protocol::engine_proto::AgentCommand;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Command, CommandStream, EngineBackend, LockRequest, Outcome};
use crate::error::Result;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Embedded backend for agents living in the engine's process.
pub struct EmbeddedBackend {
    scheduler: Arc<Scheduler>,
}

impl EmbeddedBackend {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}

fn lock_key(lock: &LockRequest) -> LockKey {
    LockKey::new(&lock.tx_id, &lock.agent, &lock.resource, &lock.require_id)
}

#[async_trait]
impl EngineBackend for EmbeddedBackend {
    async fn new_tx(&self, parent_tx_id: &str) -> Result<String> {
        Ok(self.scheduler.new_tx(parent_tx_id).await?)
    }

    async fn commit(&self, tx_id: &str) -> Result<()> {
        Ok(self.scheduler.commit(tx_id).await?)
    }

    async fn cancel(&self, tx_id: &str) -> Result<()> {
        Ok(self.scheduler.cancel(tx_id).await?)
    }

    async fn begin_lock_resource(&self, lock: &LockRequest) -> Result<()> {
        let resource_id = self.scheduler.begin_lock_resource(&lock_key(lock)).await?;
        debug!(resource_id = %resource_id, "Lock row created");
        Ok(())
    }

    async fn end_lock_resource(&self, lock: &LockRequest) -> Result<()> {
        Ok(self.scheduler.end_lock_resource(&lock_key(lock)).await?)
    }

    async fn resource_status_changed(
        &self,
        tx_id: &str,
        agent: &str,
        resource: &str,
        outcome: Outcome,
    ) -> Result<()> {
        let status = match outcome {
            Outcome::Confirmed => ResourceStatus::Confirmed,
            Outcome::Canceled => ResourceStatus::Canceled,
        };
        Ok(self
            .scheduler
            .resource_status_changed(tx_id, agent, resource, status)
            .await?)
    }

    async fn attach(&self, agent: &str) -> Result<Box<dyn CommandStream>> {
        let (sink, commands) = ChannelCommandSink::channel(agent, COMMAND_CHANNEL_CAPACITY);

        let scheduler = self.scheduler.clone();
        let agent_id = agent.to_string();
        tokio::spawn(async move {
            if let Err(e) = scheduler.attach_agent(&agent_id, Box::new(sink)).await {
                warn!(agent_id = %agent_id, error = %e, "Embedded attach ended with error");
            }
        });

        Ok(Box::new(ChannelCommandStream { commands }))
    }
}

struct ChannelCommandStream {
    commands: mpsc::Receiver<AgentCommand>,
}

#[async_trait]
impl CommandStream for ChannelCommandStream {
    async fn next_command(&mut self) -> Result<Option<Command>> {
        match self.commands.recv().await {
            Some(cmd) => Ok(Some(Command::try_from(cmd)?)),
            None => Ok(None),
        }
    }
}
