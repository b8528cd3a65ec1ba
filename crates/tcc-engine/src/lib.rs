// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCC Engine - Try-Confirm-Cancel transaction coordinator
//!
//! The engine is the source of truth for transaction outcome. Callers open,
//! commit and cancel transactions; agents lock resources under them and
//! receive commit/cancel commands over a long-lived stream.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   NewTx / Commit / Cancel   ┌──────────────────────┐
//! │  Callers         │────────────────────────────►│      Scheduler       │
//! │  (Session)       │                             │  tx + lock lifecycle │
//! └──────────────────┘                             └──────────────────────┘
//!                                                     │              │
//! ┌──────────────────┐   Begin/EndLockResource        │              │ commit_tx /
//! │  Agents          │────────────────────────────────┘              │ cancel_tx
//! │  (tcc-agent)     │                                               ▼
//! │                  │◄── AgentCommand stream ──┌──────────────────────────────┐
//! │                  │                          │  Notifier (dispatch+replay)  │
//! └──────────────────┘                          └──────────────────────────────┘
//!           │ ResourceStatusChanged                          │
//!           ▼                                                ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  Storage (SQLite / PostgreSQL via sqlx)                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol (Port 8001)
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `NewTx` | Create a root or nested transaction |
//! | `Commit` / `Cancel` | Finish a transaction; repeats are no-ops |
//! | `BeginLockResource` | Record a lock attempt (`ALREADY_EXISTS` on repeats) |
//! | `EndLockResource` | Mark a lock attempt as held |
//! | `AttachAgent` | Open an agent's command stream (last attach wins) |
//! | `ResourceStatusChanged` | Agent reports a confirmed/canceled resource |
//!
//! Delivery of agent commands is at-least-once. Commands that cannot be
//! delivered immediately are re-sent by the replay loop until the agent
//! reports the matching resource status.

pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod ids;
pub mod migrations;
pub mod notifier;
pub mod scheduler;
#[cfg(feature = "server")]
pub mod server;
pub mod storage;

pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, Result};
pub use ids::{IdGenerator, UuidV7Generator};
pub use notifier::{ChannelCommandSink, CommandSink, Notifier, NotifierConfig, StreamNotifier};
pub use scheduler::Scheduler;
pub use storage::{LockKey, ResourceStatus, Storage, TxStatus};
