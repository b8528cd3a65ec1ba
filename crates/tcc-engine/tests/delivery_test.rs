// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command delivery through the in-process engine: dedup, replay and
//! stream replacement.

mod common;

use std::time::Duration;

use common::{
    assert_quiet, attach, drain, locked_tx, next_command, start_engine, start_engine_with_replay,
};
use tcc_engine::storage::{ResourceStatus, TxStatus};
use tcc_protocol::engine_proto::AgentCommandKind;

#[tokio::test]
async fn test_commit_sends_one_command_per_agent_resource() {
    // Replay stays out of the way so every command comes from the commit.
    let engine = start_engine_with_replay(Duration::from_secs(3600)).await;
    let mut inventory = attach(&engine, "inventory").await;
    let mut payment = attach(&engine, "payment").await;

    let tx_id = locked_tx(
        &engine,
        &[
            ("inventory", "inventory.reserve", "R_1"),
            ("inventory", "inventory.reserve", "R_2"),
            ("payment", "payment.charge", "R_3"),
        ],
    )
    .await;

    engine.scheduler().commit(&tx_id).await.unwrap();

    let cmd = next_command(&mut inventory.commands).await;
    assert_eq!(cmd.kind(), AgentCommandKind::Commit);
    assert_eq!(cmd.tx_id, tx_id);
    assert_eq!(cmd.resource, "inventory.reserve");

    let cmd = next_command(&mut payment.commands).await;
    assert_eq!(cmd.kind(), AgentCommandKind::Commit);
    assert_eq!(cmd.resource, "payment.charge");

    assert_quiet(&mut inventory.commands, Duration::from_millis(200)).await;
    assert_quiet(&mut payment.commands, Duration::from_millis(50)).await;

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_acknowledged_commit_is_not_replayed() {
    let engine = start_engine().await;
    let mut agent = attach(&engine, "inventory").await;
    let tx_id = locked_tx(&engine, &[("inventory", "inventory.reserve", "R_1")]).await;

    engine.scheduler().commit(&tx_id).await.unwrap();
    engine.scheduler().commit(&tx_id).await.unwrap();

    next_command(&mut agent.commands).await;
    engine
        .scheduler()
        .resource_status_changed(&tx_id, "inventory", "inventory.reserve", ResourceStatus::Confirmed)
        .await
        .unwrap();

    drain(&mut agent.commands).await;
    assert_quiet(&mut agent.commands, common::REPLAY_INTERVAL * 3).await;

    let tx = engine.scheduler().storage().get_tx(&tx_id).await.unwrap().unwrap();
    assert_eq!(tx.status().unwrap(), TxStatus::Confirmed);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_is_replayed_after_reconnect() {
    let engine = start_engine().await;
    let tx_id = locked_tx(&engine, &[("payment", "payment.charge", "R_1")]).await;

    // Nobody is attached when the transaction is canceled.
    engine.scheduler().cancel(&tx_id).await.unwrap();

    let mut agent = attach(&engine, "payment").await;
    let cmd = next_command(&mut agent.commands).await;
    assert_eq!(cmd.kind(), AgentCommandKind::Cancel);
    assert_eq!(cmd.tx_id, tx_id);
    assert_eq!(cmd.resource, "payment.charge");

    engine
        .scheduler()
        .resource_status_changed(&tx_id, "payment", "payment.charge", ResourceStatus::Canceled)
        .await
        .unwrap();

    drain(&mut agent.commands).await;
    assert_quiet(&mut agent.commands, common::REPLAY_INTERVAL * 3).await;

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unacknowledged_commit_is_replayed() {
    let engine = start_engine().await;
    let mut agent = attach(&engine, "inventory").await;
    let tx_id = locked_tx(&engine, &[("inventory", "inventory.reserve", "R_1")]).await;

    engine.scheduler().commit(&tx_id).await.unwrap();

    // Without a status report the same command keeps coming back.
    let first = next_command(&mut agent.commands).await;
    let second = next_command(&mut agent.commands).await;
    assert_eq!(first, second);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_last_attach_wins() {
    let engine = start_engine().await;
    let first = attach(&engine, "inventory").await;
    let mut second = attach(&engine, "inventory").await;

    // The replaced dispatch loop ends on its own.
    tokio::time::timeout(Duration::from_secs(2), first.task)
        .await
        .expect("first stream was not closed")
        .unwrap()
        .unwrap();
    let mut first_commands = first.commands;

    let tx_id = locked_tx(&engine, &[("inventory", "inventory.reserve", "R_1")]).await;
    engine.scheduler().commit(&tx_id).await.unwrap();

    let cmd = next_command(&mut second.commands).await;
    assert_eq!(cmd.tx_id, tx_id);
    assert!(first_commands.recv().await.is_none());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dropped_agent_is_detached() {
    let engine = start_engine().await;
    let agent = attach(&engine, "payment").await;

    drop(agent.commands);
    agent.task.await.unwrap().unwrap();

    assert!(engine.notifier().attached_agents().await.is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_lock_is_rejected() {
    let engine = start_engine().await;
    let tx_id = locked_tx(&engine, &[("payment", "payment.charge", "R_1")]).await;

    let key = tcc_engine::LockKey::new(&tx_id, "payment", "payment.charge", "R_1");
    let err = engine.scheduler().begin_lock_resource(&key).await.unwrap_err();
    assert_eq!(err.error_code(), "ALREADY_EXISTS");

    let rows = engine
        .scheduler()
        .storage()
        .get_resources_by_tx(&tx_id)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status().unwrap(), ResourceStatus::Locked);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_commits_notify_once() {
    let engine = start_engine_with_replay(Duration::from_secs(3600)).await;
    let mut agent = attach(&engine, "inventory").await;
    let tx_id = locked_tx(&engine, &[("inventory", "inventory.reserve", "R_1")]).await;

    let commits = (0..8).map(|_| engine.scheduler().commit(&tx_id));
    for result in futures::future::join_all(commits).await {
        result.unwrap();
    }

    let cmd = next_command(&mut agent.commands).await;
    assert_eq!(cmd.kind(), AgentCommandKind::Commit);
    assert_quiet(&mut agent.commands, Duration::from_millis(200)).await;

    engine.shutdown().await.unwrap();
}
