// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tcc-engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tcc_engine::engine::Engine;
use tcc_engine::notifier::{ChannelCommandSink, NotifierConfig};
use tcc_engine::storage::{self, LockKey};
use tcc_protocol::engine_proto::AgentCommand;

/// Replay interval used by tests that wait for re-delivery.
pub const REPLAY_INTERVAL: Duration = Duration::from_millis(100);

/// In-process engine on a fresh in-memory SQLite database.
pub async fn start_engine() -> Engine {
    start_engine_with_replay(REPLAY_INTERVAL).await
}

pub async fn start_engine_with_replay(replay_interval: Duration) -> Engine {
    let storage = storage::connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory storage");

    Engine::builder()
        .storage(storage)
        .notifier_config(NotifierConfig {
            replay_interval,
            ..NotifierConfig::default()
        })
        .build()
        .expect("Failed to build engine")
        .start()
        .await
        .expect("Failed to start engine")
}

/// An in-process agent stream attached through the scheduler.
pub struct TestAgent {
    pub commands: mpsc::Receiver<AgentCommand>,
    pub task: JoinHandle<tcc_engine::Result<()>>,
}

pub async fn attach(engine: &Engine, agent: &str) -> TestAgent {
    let (sink, commands) = ChannelCommandSink::channel(agent, 64);
    let scheduler = Arc::clone(engine.scheduler());
    let agent_id = agent.to_string();
    let task = tokio::spawn(async move { scheduler.attach_agent(&agent_id, Box::new(sink)).await });

    wait_for(move || async move {
        engine
            .notifier()
            .attached_agents()
            .await
            .iter()
            .any(|a| a == agent)
    })
    .await;

    TestAgent { commands, task }
}

/// Poll `check` until it holds, failing after two seconds.
pub async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

/// Next command, failing if none arrives within two seconds.
pub async fn next_command(commands: &mut mpsc::Receiver<AgentCommand>) -> AgentCommand {
    tokio::time::timeout(Duration::from_secs(2), commands.recv())
        .await
        .expect("timed out waiting for command")
        .expect("command stream closed")
}

/// Discard commands replayed before an acknowledgement landed.
pub async fn drain(commands: &mut mpsc::Receiver<AgentCommand>) {
    while let Ok(Some(_)) = tokio::time::timeout(REPLAY_INTERVAL * 2, commands.recv()).await {}
}

/// Assert no command arrives within `window`.
pub async fn assert_quiet(commands: &mut mpsc::Receiver<AgentCommand>, window: Duration) {
    if let Ok(Some(cmd)) = tokio::time::timeout(window, commands.recv()).await {
        panic!("unexpected command: {:?}", cmd);
    }
}

/// Create a transaction and a held lock for each `(agent, resource, require_id)`.
pub async fn locked_tx(engine: &Engine, locks: &[(&str, &str, &str)]) -> String {
    let scheduler = engine.scheduler();
    let tx_id = scheduler.new_tx("").await.expect("new_tx failed");
    for (agent, resource, require_id) in locks {
        let key = LockKey::new(&tx_id, *agent, *resource, *require_id);
        scheduler
            .begin_lock_resource(&key)
            .await
            .expect("begin_lock_resource failed");
        scheduler
            .end_lock_resource(&key)
            .await
            .expect("end_lock_resource failed");
    }
    tx_id
}
