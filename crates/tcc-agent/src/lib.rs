// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCC Agent SDK - protected resources for the tcc-engine coordinator.
//!
//! An agent owns a set of named resources. Calls into a resource are wrapped
//! in a lock registered with the engine under the caller's transaction; once
//! the transaction is committed or canceled the engine pushes a command back
//! to the agent, which runs the resource handler and reports the outcome.
//!
//! # Features
//!
//! - **Resource Registration**: one [`ResourceHandler`] per resource name
//! - **Lock Interception**: [`Agent::before_require`] / [`Agent::after_require`]
//!   around protected calls, or [`Agent::enter`] / [`Agent::exit`] with an
//!   implicit root transaction
//! - **Command Loop**: attach, apply commands, report status, re-attach with backoff
//! - **Sessions**: [`Session`] opens or joins a transaction and scopes local calls
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tcc_agent::{Agent, AgentConfig, Session, TxContext};
//!
//! let agent = Agent::connect(&AgentConfig::from_env()?)?;
//! agent.register("payment.charge", Arc::new(ChargeHandler::new(db)))?;
//! let handle = agent.start();
//!
//! let session = Session::new(&agent, &TxContext::default()).await?;
//! session
//!     .local_call("payment.charge", |ctx| charge(ctx, order_id))
//!     .await?;
//! session.commit().await?;
//!
//! handle.shutdown().await?;
//! ```
//!
//! # Backends
//!
//! - `quic` (default): talks to a remote engine over QUIC
//! - `embedded`: calls an in-process `tcc_engine::Scheduler`

pub mod agent;
pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod session;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentHandle, LOCK_ID_PREFIX};
pub use backend::{Command, CommandKind, CommandStream, EngineBackend, LockRequest, Outcome};
pub use config::AgentConfig;
pub use context::TxContext;
pub use error::{AgentError, BoxError, CallPhase, Result};
pub use handler::ResourceHandler;
pub use session::Session;

#[cfg(feature = "quic")]
pub use backend::quic::QuicBackend;

#[cfg(feature = "embedded")]
pub use backend::embedded::EmbeddedBackend;
