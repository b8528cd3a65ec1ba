// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf request handlers.
//!
//! Thin adapters between wire messages and [`Scheduler`] calls, shared by the
//! QUIC server and in-process agents.

use tcc_protocol::engine_proto::{
    CancelRequest, CancelResponse, CommitRequest, CommitResponse, LockResourceRequest,
    LockResourceResponse, NewTxRequest, NewTxResponse, ResourceStatusChangedRequest,
    ResourceStatusChangedResponse, RpcResponse, TxStatus as ProtoTxStatus, rpc_request::Request,
    rpc_response::Response,
};

use crate::error::{EngineError, Result};
use crate::scheduler::Scheduler;
use crate::storage::{LockKey, ResourceStatus};

pub async fn handle_new_tx(scheduler: &Scheduler, req: NewTxRequest) -> Result<NewTxResponse> {
    let tx_id = scheduler.new_tx(&req.parent_tx_id).await?;
    Ok(NewTxResponse { tx_id })
}

pub async fn handle_commit(scheduler: &Scheduler, req: CommitRequest) -> Result<CommitResponse> {
    scheduler.commit(&req.tx_id).await?;
    Ok(CommitResponse {})
}

pub async fn handle_cancel(scheduler: &Scheduler, req: CancelRequest) -> Result<CancelResponse> {
    scheduler.cancel(&req.tx_id).await?;
    Ok(CancelResponse {})
}

pub async fn handle_begin_lock_resource(
    scheduler: &Scheduler,
    req: LockResourceRequest,
) -> Result<LockResourceResponse> {
    scheduler.begin_lock_resource(&lock_key(req)).await?;
    Ok(LockResourceResponse {})
}

pub async fn handle_end_lock_resource(
    scheduler: &Scheduler,
    req: LockResourceRequest,
) -> Result<LockResourceResponse> {
    scheduler.end_lock_resource(&lock_key(req)).await?;
    Ok(LockResourceResponse {})
}

pub async fn handle_resource_status_changed(
    scheduler: &Scheduler,
    req: ResourceStatusChangedRequest,
) -> Result<ResourceStatusChangedResponse> {
    let status = ProtoTxStatus::try_from(req.status)
        .map(ResourceStatus::from)
        .map_err(|_| {
            EngineError::validation("status", format!("unknown status value {}", req.status))
        })?;
    scheduler
        .resource_status_changed(&req.tx_id, &req.agent, &req.resource, status)
        .await?;
    Ok(ResourceStatusChangedResponse {})
}

/// Dispatch a unary request. `AttachAgent` opens a push stream and is
/// rejected here.
pub async fn dispatch(scheduler: &Scheduler, request: Request) -> RpcResponse {
    let result = match request {
        Request::NewTx(req) => handle_new_tx(scheduler, req).await.map(Response::NewTx),
        Request::Commit(req) => handle_commit(scheduler, req).await.map(Response::Commit),
        Request::Cancel(req) => handle_cancel(scheduler, req).await.map(Response::Cancel),
        Request::BeginLockResource(req) => handle_begin_lock_resource(scheduler, req)
            .await
            .map(Response::BeginLockResource),
        Request::EndLockResource(req) => handle_end_lock_resource(scheduler, req)
            .await
            .map(Response::EndLockResource),
        Request::ResourceStatusChanged(req) => handle_resource_status_changed(scheduler, req)
            .await
            .map(Response::ResourceStatusChanged),
        Request::AttachAgent(_) => Err(EngineError::validation(
            "request",
            "AttachAgent is a streaming call",
        )),
    };

    RpcResponse {
        response: Some(result.unwrap_or_else(|e| Response::Error(e.to_rpc_error()))),
    }
}

fn lock_key(req: LockResourceRequest) -> LockKey {
    LockKey {
        tx_id: req.tx_id,
        agent: req.agent,
        resource: req.resource,
        require_id: req.require_id,
    }
}
