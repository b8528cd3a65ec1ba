// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf messages exchanged between agents, callers and the engine.
//!
//! Every unary call is an [`RpcRequest`] answered by an [`RpcResponse`].
//! `AttachAgent` is the exception: the engine answers with a `StreamStart`
//! frame carrying [`AttachAgentAck`], then pushes [`AgentCommand`] messages as
//! `StreamData` frames until one side goes away.

/// Lifecycle status shared by transactions and resources.
///
/// Transactions only use `Created`, `Confirmed` and `Canceled`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TxStatus {
    Created = 0,
    Locked = 1,
    Confirmed = 2,
    Canceled = 3,
}

/// Kind of command pushed to an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AgentCommandKind {
    Commit = 0,
    Cancel = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcError {
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NewTxRequest {
    /// Empty for root transactions.
    #[prost(string, tag = "1")]
    pub parent_tx_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NewTxResponse {
    #[prost(string, tag = "1")]
    pub tx_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommitRequest {
    #[prost(string, tag = "1")]
    pub tx_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommitResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelRequest {
    #[prost(string, tag = "1")]
    pub tx_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelResponse {}

/// Identifies a single lock attempt on a resource.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LockResourceRequest {
    #[prost(string, tag = "1")]
    pub tx_id: String,
    #[prost(string, tag = "2")]
    pub agent: String,
    #[prost(string, tag = "3")]
    pub resource: String,
    #[prost(string, tag = "4")]
    pub require_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LockResourceResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AttachAgentRequest {
    #[prost(string, tag = "1")]
    pub agent: String,
}

/// Payload of the `StreamStart` frame acknowledging an attach.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AttachAgentAck {
    #[prost(string, tag = "1")]
    pub agent: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceStatusChangedRequest {
    #[prost(string, tag = "1")]
    pub tx_id: String,
    #[prost(string, tag = "2")]
    pub agent: String,
    #[prost(string, tag = "3")]
    pub resource: String,
    #[prost(enumeration = "TxStatus", tag = "4")]
    pub status: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceStatusChangedResponse {}

/// Command pushed by the engine on an attached agent stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentCommand {
    #[prost(enumeration = "AgentCommandKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub resource: String,
    #[prost(string, tag = "3")]
    pub tx_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcRequest {
    #[prost(oneof = "rpc_request::Request", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub request: Option<rpc_request::Request>,
}

pub mod rpc_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        NewTx(super::NewTxRequest),
        #[prost(message, tag = "2")]
        Commit(super::CommitRequest),
        #[prost(message, tag = "3")]
        Cancel(super::CancelRequest),
        #[prost(message, tag = "4")]
        BeginLockResource(super::LockResourceRequest),
        #[prost(message, tag = "5")]
        EndLockResource(super::LockResourceRequest),
        #[prost(message, tag = "6")]
        AttachAgent(super::AttachAgentRequest),
        #[prost(message, tag = "7")]
        ResourceStatusChanged(super::ResourceStatusChangedRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcResponse {
    #[prost(oneof = "rpc_response::Response", tags = "1, 2, 3, 4, 5, 7, 15")]
    pub response: Option<rpc_response::Response>,
}

pub mod rpc_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Response {
        #[prost(message, tag = "1")]
        NewTx(super::NewTxResponse),
        #[prost(message, tag = "2")]
        Commit(super::CommitResponse),
        #[prost(message, tag = "3")]
        Cancel(super::CancelResponse),
        #[prost(message, tag = "4")]
        BeginLockResource(super::LockResourceResponse),
        #[prost(message, tag = "5")]
        EndLockResource(super::LockResourceResponse),
        #[prost(message, tag = "7")]
        ResourceStatusChanged(super::ResourceStatusChangedResponse),
        #[prost(message, tag = "15")]
        Error(super::RpcError),
    }
}

impl AgentCommand {
    pub fn commit(resource: impl Into<String>, tx_id: impl Into<String>) -> Self {
        Self {
            kind: AgentCommandKind::Commit as i32,
            resource: resource.into(),
            tx_id: tx_id.into(),
        }
    }

    pub fn cancel(resource: impl Into<String>, tx_id: impl Into<String>) -> Self {
        Self {
            kind: AgentCommandKind::Cancel as i32,
            resource: resource.into(),
            tx_id: tx_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_agent_command_constructors() {
        let cmd = AgentCommand::commit("inventory.reserve", "tx-1");
        assert_eq!(cmd.kind(), AgentCommandKind::Commit);
        assert_eq!(cmd.resource, "inventory.reserve");

        let cmd = AgentCommand::cancel("payment.charge", "tx-2");
        assert_eq!(cmd.kind(), AgentCommandKind::Cancel);
        assert_eq!(cmd.tx_id, "tx-2");
    }

    #[test]
    fn test_unknown_status_value_falls_back_to_default() {
        let req = ResourceStatusChangedRequest {
            tx_id: "tx".to_string(),
            agent: "a".to_string(),
            resource: "r".to_string(),
            status: 42,
        };
        assert_eq!(req.status(), TxStatus::Created);
        assert!(TxStatus::try_from(42).is_err());
    }

    #[test]
    fn test_rpc_request_oneof_decodes_lock_variants_distinctly() {
        let lock = LockResourceRequest {
            tx_id: "tx".to_string(),
            agent: "inventory".to_string(),
            resource: "inventory.reserve".to_string(),
            require_id: "R_1".to_string(),
        };
        let begin = RpcRequest {
            request: Some(rpc_request::Request::BeginLockResource(lock.clone())),
        };
        let end = RpcRequest {
            request: Some(rpc_request::Request::EndLockResource(lock)),
        };

        let begin = RpcRequest::decode(begin.encode_to_vec().as_slice()).unwrap();
        let end = RpcRequest::decode(end.encode_to_vec().as_slice()).unwrap();

        assert!(matches!(
            begin.request,
            Some(rpc_request::Request::BeginLockResource(_))
        ));
        assert!(matches!(
            end.request,
            Some(rpc_request::Request::EndLockResource(_))
        ));
    }
}
