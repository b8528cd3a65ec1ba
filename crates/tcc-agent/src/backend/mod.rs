// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent backend implementations.
//!
//! This module provides different backends for talking to the engine:
//! - `quic`: QUIC-based communication with tcc-engine (default)
//! - `embedded`: Direct scheduler calls for in-process deployments

#[cfg(feature = "quic")]
pub mod quic;

#[cfg(feature = "embedded")]
pub mod embedded;

use async_trait::async_trait;
use tcc_protocol::engine_proto::{AgentCommand, AgentCommandKind, LockResourceRequest, TxStatus};

use crate::error::{AgentError, Result};

/// Backend trait for engine operations.
///
/// Abstracts the communication layer so the agent works the same against a
/// remote engine or an in-process scheduler.
#[async_trait]
pub trait EngineBackend: Send + Sync {
    /// Open a transaction. `parent_tx_id` is empty for root transactions.
    async fn new_tx(&self, parent_tx_id: &str) -> Result<String>;

    async fn commit(&self, tx_id: &str) -> Result<()>;

    async fn cancel(&self, tx_id: &str) -> Result<()>;

    async fn begin_lock_resource(&self, lock: &LockRequest) -> Result<()>;

    async fn end_lock_resource(&self, lock: &LockRequest) -> Result<()>;

    /// Report that a resource reached its terminal state for a transaction.
    async fn resource_status_changed(
        &self,
        tx_id: &str,
        agent: &str,
        resource: &str,
        outcome: Outcome,
    ) -> Result<()>;

    /// Attach as `agent` and return the stream of pushed commands.
    async fn attach(&self, agent: &str) -> Result<Box<dyn CommandStream>>;
}

/// Commands pushed by the engine to an attached agent.
#[async_trait]
pub trait CommandStream: Send {
    /// Next command, or `None` once the engine ended the stream.
    async fn next_command(&mut self) -> Result<Option<Command>>;
}

/// One lock attempt on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub tx_id: String,
    pub agent: String,
    pub resource: String,
    pub require_id: String,
}

impl From<&LockRequest> for LockResourceRequest {
    fn from(lock: &LockRequest) -> Self {
        LockResourceRequest {
            tx_id: lock.tx_id.clone(),
            agent: lock.agent.clone(),
            resource: lock.resource.clone(),
            require_id: lock.require_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Commit,
    Cancel,
}

/// Commit or cancel one resource of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub tx_id: String,
    pub resource: String,
}

impl Command {
    /// Status to report once the handler applied this command.
    pub fn outcome(&self) -> Outcome {
        match self.kind {
            CommandKind::Commit => Outcome::Confirmed,
            CommandKind::Cancel => Outcome::Canceled,
        }
    }
}

impl TryFrom<AgentCommand> for Command {
    type Error = AgentError;

    fn try_from(cmd: AgentCommand) -> Result<Self> {
        let kind = match AgentCommandKind::try_from(cmd.kind) {
            Ok(AgentCommandKind::Commit) => CommandKind::Commit,
            Ok(AgentCommandKind::Cancel) => CommandKind::Cancel,
            Err(_) => {
                return Err(AgentError::UnexpectedResponse(format!(
                    "unknown command kind {}",
                    cmd.kind
                )));
            }
        };
        Ok(Command {
            kind,
            tx_id: cmd.tx_id,
            resource: cmd.resource,
        })
    }
}

/// Terminal state of a resource after its handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Confirmed,
    Canceled,
}

impl From<Outcome> for TxStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Confirmed => TxStatus::Confirmed,
            Outcome::Canceled => TxStatus::Canceled,
        }
    }
}
