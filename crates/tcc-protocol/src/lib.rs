// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCC Protocol - QUIC + Protobuf communication layer
//!
//! Wire protocol between the coordinator engine, transaction callers and
//! resource agents.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       tcc-protocol                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC Layer: unary Request/Response + server push streams    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn)                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tcc_protocol::{EngineClient, engine_proto::*};
//!
//! let client = EngineClient::localhost("127.0.0.1:8001".parse()?)?;
//! let resp: RpcResponse = client
//!     .request(&RpcRequest {
//!         request: Some(rpc_request::Request::NewTx(NewTxRequest::default())),
//!     })
//!     .await?;
//! ```

pub mod client;
pub mod engine_proto;
pub mod frame;
pub mod server;

pub use client::{ClientError, EngineClient, EngineClientConfig};
pub use frame::{Frame, FrameError, MessageType};
pub use server::{ConnectionHandler, EngineServer, EngineServerConfig, ServerError, StreamHandler};
