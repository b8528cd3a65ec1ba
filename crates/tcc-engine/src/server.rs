// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine QUIC server.
//!
//! Accepts connections from callers and agents. Every bidirectional stream
//! carries one unary call, except `AttachAgent`, which keeps the stream open
//! and pushes [`AgentCommand`] frames to the agent.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use quinn::{RecvStream, SendStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use tcc_protocol::engine_proto::{
    AgentCommand, AttachAgentAck, AttachAgentRequest, RpcError, RpcRequest, RpcResponse,
    rpc_request::Request, rpc_response::Response,
};
use tcc_protocol::frame::{Frame, read_frame, write_frame};
use tcc_protocol::server::{ConnectionHandler, EngineServer, StreamHandler};

use crate::error::EngineError;
use crate::handlers;
use crate::notifier::CommandSink;
use crate::scheduler::Scheduler;

/// Accept connections on `server` until `shutdown` is cancelled.
pub async fn serve_until(
    server: EngineServer,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
) {
    match server.local_addr() {
        Ok(addr) => info!(addr = %addr, "Engine QUIC server starting"),
        Err(e) => warn!(error = %e, "Engine QUIC server starting on unknown address"),
    }

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("Engine QUIC server received shutdown signal");
                server.close();
                break;
            }

            incoming = server.accept() => {
                let Some(incoming) = incoming else {
                    // Endpoint closed
                    break;
                };
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(connection) => {
                            handle_connection(ConnectionHandler::new(connection), scheduler).await;
                        }
                        Err(e) => debug!("failed to accept connection: {}", e),
                    }
                });
            }
        }
    }

    info!("Engine QUIC server stopped");
}

#[instrument(skip(conn, scheduler), fields(remote = %conn.remote_address()))]
pub async fn handle_connection(conn: ConnectionHandler, scheduler: Arc<Scheduler>) {
    debug!("Connection accepted");

    conn.run(move |stream: StreamHandler| {
        let scheduler = scheduler.clone();
        async move {
            if let Err(e) = handle_stream(stream, scheduler).await {
                error!("Stream error: {}", e);
            }
        }
    })
    .await;

    debug!("Connection closed");
}

async fn handle_stream(mut stream: StreamHandler, scheduler: Arc<Scheduler>) -> Result<()> {
    let rpc_request: RpcRequest = stream.read_frame().await?.decode()?;

    let response = match rpc_request.request {
        Some(Request::AttachAgent(req)) => return handle_attach(stream, scheduler, req).await,
        Some(request) => handlers::dispatch(&scheduler, request).await,
        None => {
            warn!("Received empty RpcRequest");
            RpcResponse {
                response: Some(Response::Error(RpcError {
                    code: "EMPTY_REQUEST".to_string(),
                    message: "RpcRequest contained no request".to_string(),
                })),
            }
        }
    };

    stream.write_frame(&Frame::response(&response)?).await?;
    stream.finish()?;
    Ok(())
}

async fn handle_attach(
    mut stream: StreamHandler,
    scheduler: Arc<Scheduler>,
    req: AttachAgentRequest,
) -> Result<()> {
    let agent_id = req.agent;
    if agent_id.is_empty() {
        let err = EngineError::validation("agent", "must not be empty");
        let response = RpcResponse {
            response: Some(Response::Error(err.to_rpc_error())),
        };
        stream.write_frame(&Frame::response(&response)?).await?;
        stream.finish()?;
        return Ok(());
    }

    stream
        .write_frame(&Frame::stream_start(&AttachAgentAck {
            agent: agent_id.clone(),
        })?)
        .await?;

    let (send, recv) = stream.into_parts();
    let sink = QuicCommandSink::new(agent_id.clone(), send, recv);

    match scheduler.attach_agent(&agent_id, Box::new(sink)).await {
        Ok(()) => debug!(agent_id = %agent_id, "Agent stream ended"),
        Err(e) => info!(agent_id = %agent_id, error = %e, "Agent stream failed"),
    }
    Ok(())
}

/// Pushes commands as `StreamData` frames on an attach stream.
///
/// The agent keeps its half of the stream open; end of input on the receive
/// half means it went away.
pub struct QuicCommandSink {
    agent_id: String,
    send: Mutex<SendStream>,
    recv: Mutex<RecvStream>,
}

impl QuicCommandSink {
    pub fn new(agent_id: String, send: SendStream, recv: RecvStream) -> Self {
        Self {
            agent_id,
            send: Mutex::new(send),
            recv: Mutex::new(recv),
        }
    }
}

#[async_trait]
impl CommandSink for QuicCommandSink {
    async fn send(&self, command: AgentCommand) -> crate::error::Result<()> {
        let transport = |details: String| EngineError::TransportError {
            agent: self.agent_id.clone(),
            details,
        };

        let frame = Frame::stream_data(&command).map_err(|e| transport(e.to_string()))?;
        let mut send = self.send.lock().await;
        write_frame(&mut *send, &frame)
            .await
            .map_err(|e| transport(e.to_string()))
    }

    async fn closed(&self) {
        let mut recv = self.recv.lock().await;
        loop {
            match read_frame(&mut *recv).await {
                Ok(frame) => {
                    debug!(agent_id = %self.agent_id, message_type = ?frame.message_type, "Ignoring frame on attach stream");
                }
                Err(_) => return,
            }
        }
    }
}
