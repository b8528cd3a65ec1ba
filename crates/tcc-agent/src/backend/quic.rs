// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC-based agent backend for remote communication with tcc-engine.

use async_trait::async_trait;
use quinn::{RecvStream, SendStream};
use tcc_protocol::engine_proto::{
    AgentCommand, AttachAgentAck, AttachAgentRequest, CancelRequest, CommitRequest, NewTxRequest,
    ResourceStatusChangedRequest, RpcRequest, RpcResponse, TxStatus, rpc_request, rpc_response,
};
use tcc_protocol::frame::{Frame, FrameError, MessageType, read_frame, write_frame};
use tcc_protocol::EngineClient;
use tracing::{debug, info, instrument};

use super::{Command, CommandStream, EngineBackend, LockRequest, Outcome};
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};

/// QUIC-based backend for agent operations.
pub struct QuicBackend {
    client: EngineClient,
}

impl QuicBackend {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = EngineClient::new(config.client_config())?;
        Ok(Self { client })
    }

    /// Get a reference to the underlying QUIC client.
    pub fn client(&self) -> &EngineClient {
        &self.client
    }

    async fn call(&self, request: rpc_request::Request) -> Result<rpc_response::Response> {
        let rpc_request = RpcRequest {
            request: Some(request),
        };
        let rpc_response: RpcResponse = self.client.request(&rpc_request).await?;

        match rpc_response.response {
            Some(rpc_response::Response::Error(e)) => Err(AgentError::server(e.code, e.message)),
            Some(response) => Ok(response),
            None => Err(AgentError::UnexpectedResponse(
                "empty RpcResponse".to_string(),
            )),
        }
    }
}

fn unexpected(expected: &str) -> AgentError {
    AgentError::UnexpectedResponse(format!("expected {}", expected))
}

#[async_trait]
impl EngineBackend for QuicBackend {
    #[instrument(skip(self))]
    async fn new_tx(&self, parent_tx_id: &str) -> Result<String> {
        let request = rpc_request::Request::NewTx(NewTxRequest {
            parent_tx_id: parent_tx_id.to_string(),
        });
        match self.call(request).await? {
            rpc_response::Response::NewTx(resp) => Ok(resp.tx_id),
            _ => Err(unexpected("NewTxResponse")),
        }
    }

    #[instrument(skip(self))]
    async fn commit(&self, tx_id: &str) -> Result<()> {
        let request = rpc_request::Request::Commit(CommitRequest {
            tx_id: tx_id.to_string(),
        });
        match self.call(request).await? {
            rpc_response::Response::Commit(_) => Ok(()),
            _ => Err(unexpected("CommitResponse")),
        }
    }

    #[instrument(skip(self))]
    async fn cancel(&self, tx_id: &str) -> Result<()> {
        let request = rpc_request::Request::Cancel(CancelRequest {
            tx_id: tx_id.to_string(),
        });
        match self.call(request).await? {
            rpc_response::Response::Cancel(_) => Ok(()),
            _ => Err(unexpected("CancelResponse")),
        }
    }

    async fn begin_lock_resource(&self, lock: &LockRequest) -> Result<()> {
        match self
            .call(rpc_request::Request::BeginLockResource(lock.into()))
            .await?
        {
            rpc_response::Response::BeginLockResource(_) => Ok(()),
            _ => Err(unexpected("BeginLockResource response")),
        }
    }

    async fn end_lock_resource(&self, lock: &LockRequest) -> Result<()> {
        match self
            .call(rpc_request::Request::EndLockResource(lock.into()))
            .await?
        {
            rpc_response::Response::EndLockResource(_) => Ok(()),
            _ => Err(unexpected("EndLockResource response")),
        }
    }

    async fn resource_status_changed(
        &self,
        tx_id: &str,
        agent: &str,
        resource: &str,
        outcome: Outcome,
    ) -> Result<()> {
        let request = rpc_request::Request::ResourceStatusChanged(ResourceStatusChangedRequest {
            tx_id: tx_id.to_string(),
            agent: agent.to_string(),
            resource: resource.to_string(),
            status: TxStatus::from(outcome) as i32,
        });
        match self.call(request).await? {
            rpc_response::Response::ResourceStatusChanged(_) => Ok(()),
            _ => Err(unexpected("ResourceStatusChangedResponse")),
        }
    }

    #[instrument(skip(self))]
    async fn attach(&self, agent: &str) -> Result<Box<dyn CommandStream>> {
        let (mut send, mut recv) = self.client.open_stream().await?;

        let request = RpcRequest {
            request: Some(rpc_request::Request::AttachAgent(AttachAgentRequest {
                agent: agent.to_string(),
            })),
        };
        write_frame(&mut send, &Frame::request(&request)?).await?;

        // The engine answers with StreamStart, or a plain Response on rejection.
        let first = read_frame(&mut recv).await?;
        match first.message_type {
            MessageType::StreamStart => {
                let ack: AttachAgentAck = first.decode()?;
                info!(agent = %ack.agent, "Attached to tcc-engine");
            }
            MessageType::Response => {
                let response: RpcResponse = first.decode()?;
                return Err(match response.response {
                    Some(rpc_response::Response::Error(e)) => AgentError::server(e.code, e.message),
                    _ => unexpected("AttachAgentAck"),
                });
            }
            other => {
                return Err(AgentError::UnexpectedResponse(format!(
                    "unexpected {:?} frame on attach",
                    other
                )));
            }
        }

        Ok(Box::new(QuicCommandStream { send, recv }))
    }
}

/// Attach stream. The send half stays open; finishing it tells the engine
/// the agent went away.
struct QuicCommandStream {
    send: SendStream,
    recv: RecvStream,
}

#[async_trait]
impl CommandStream for QuicCommandStream {
    async fn next_command(&mut self) -> Result<Option<Command>> {
        let frame = match read_frame(&mut self.recv).await {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match frame.message_type {
            MessageType::StreamData => {
                let cmd: AgentCommand = frame.decode()?;
                Ok(Some(Command::try_from(cmd)?))
            }
            MessageType::StreamEnd => {
                debug!("Engine ended the attach stream");
                Ok(None)
            }
            other => Err(AgentError::UnexpectedResponse(format!(
                "unexpected {:?} frame on attach stream",
                other
            ))),
        }
    }
}

impl Drop for QuicCommandStream {
    fn drop(&mut self) {
        let _ = self.send.finish();
    }
}

