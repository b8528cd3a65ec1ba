// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command delivery to attached agents.
//!
//! Each attached agent owns an [`AgentStream`] with bounded commit and cancel
//! queues drained by a dispatch loop into the agent's [`CommandSink`].
//! Delivery is at-least-once: anything that cannot be queued or written is
//! picked up again by the replay loop (see [`replay`]).

pub mod replay;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tcc_protocol::engine_proto::{AgentCommand, AgentCommandKind};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::storage::{ResourceRecord, ResourceStatus, Storage};

/// Notifier tuning.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Capacity of each per-agent commit and cancel queue.
    pub queue_capacity: usize,
    pub replay_interval: Duration,
    /// Age after which replayed commands are logged as stale.
    /// `Duration::ZERO` disables the warning. Replay itself is never bounded.
    pub retention: Duration,
    /// How long an enqueue waits for queue space before deferring to replay.
    pub enqueue_timeout: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            replay_interval: Duration::from_secs(60),
            retention: Duration::from_secs(600),
            enqueue_timeout: Duration::from_secs(5),
        }
    }
}

/// Outgoing half of an attached agent's stream.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send(&self, command: AgentCommand) -> Result<()>;

    /// Resolves once the peer is gone. The default never resolves, leaving
    /// disconnect detection to the next failed `send`.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }
}

/// [`CommandSink`] over a tokio channel, for in-process agents.
pub struct ChannelCommandSink {
    agent_id: String,
    sender: mpsc::Sender<AgentCommand>,
}

impl ChannelCommandSink {
    pub fn new(agent_id: impl Into<String>, sender: mpsc::Sender<AgentCommand>) -> Self {
        Self {
            agent_id: agent_id.into(),
            sender,
        }
    }

    /// Sink plus the receiver the agent reads commands from.
    pub fn channel(
        agent_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<AgentCommand>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(agent_id, sender), receiver)
    }
}

#[async_trait]
impl CommandSink for ChannelCommandSink {
    async fn send(&self, command: AgentCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| EngineError::TransportError {
                agent: self.agent_id.clone(),
                details: "command receiver dropped".to_string(),
            })
    }

    async fn closed(&self) {
        self.sender.closed().await
    }
}

/// Delivers commit/cancel commands for a transaction's resources.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn commit_tx(&self, tx_id: &str) -> Result<()>;

    async fn cancel_tx(&self, tx_id: &str) -> Result<()>;

    /// Register `sink` as the live stream of `agent_id` and dispatch commands
    /// into it. Returns when the stream is replaced, fails or disconnects.
    async fn run_agent(&self, agent_id: &str, sink: Box<dyn CommandSink>) -> Result<()>;
}

#[derive(Debug)]
struct QueuedCommand {
    tx_id: String,
    resource: String,
}

/// Queues of one attached agent.
///
/// `closed` is cancelled when the stream is replaced or torn down. Senders
/// check it before and while waiting for queue space.
pub struct AgentStream {
    agent_id: String,
    commit_tx: mpsc::Sender<QueuedCommand>,
    cancel_tx: mpsc::Sender<QueuedCommand>,
    closed: CancellationToken,
}

impl AgentStream {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Result of handing a command to an agent's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// No stream attached for the agent.
    NotAttached,
    /// The stream closed before the command was queued.
    Closed,
    /// The queue stayed full for the whole enqueue timeout.
    TimedOut,
}

/// [`Notifier`] backed by per-agent streams.
pub struct StreamNotifier {
    storage: Arc<dyn Storage>,
    config: NotifierConfig,
    streams: RwLock<HashMap<String, Arc<AgentStream>>>,
    rng: Mutex<StdRng>,
}

impl StreamNotifier {
    pub fn new(storage: Arc<dyn Storage>, config: NotifierConfig) -> Self {
        Self::with_rng(storage, config, StdRng::from_entropy())
    }

    /// Notifier with an explicitly seeded replay shuffle.
    pub fn with_rng(storage: Arc<dyn Storage>, config: NotifierConfig, rng: StdRng) -> Self {
        Self {
            storage,
            config,
            streams: RwLock::new(HashMap::new()),
            rng: Mutex::new(rng),
        }
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    /// Ids of currently attached agents, sorted.
    pub async fn attached_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self.streams.read().await.keys().cloned().collect();
        agents.sort();
        agents
    }

    async fn notify(&self, tx_id: &str, kind: AgentCommandKind) -> Result<()> {
        let resources = self.storage.get_resources_by_tx(tx_id).await?;
        let targets = dedup_resources(&resources);

        debug!(tx_id = %tx_id, kind = ?kind, targets = targets.len(), "Notifying agents");

        for record in targets {
            self.enqueue(&record.agent, kind, tx_id, &record.resource)
                .await;
        }
        Ok(())
    }

    /// Queue one command for `agent_id`. Never fails: anything not queued is
    /// logged and left to replay.
    pub(crate) async fn enqueue(
        &self,
        agent_id: &str,
        kind: AgentCommandKind,
        tx_id: &str,
        resource: &str,
    ) -> EnqueueOutcome {
        let stream = self.streams.read().await.get(agent_id).cloned();
        let Some(stream) = stream else {
            debug!(agent_id = %agent_id, tx_id = %tx_id, resource = %resource, "Agent not attached, deferring to replay");
            return EnqueueOutcome::NotAttached;
        };

        if stream.is_closed() {
            return EnqueueOutcome::Closed;
        }

        let queue = match kind {
            AgentCommandKind::Commit => &stream.commit_tx,
            AgentCommandKind::Cancel => &stream.cancel_tx,
        };
        let command = QueuedCommand {
            tx_id: tx_id.to_string(),
            resource: resource.to_string(),
        };

        let outcome = tokio::select! {
            biased;
            _ = stream.closed.cancelled() => EnqueueOutcome::Closed,
            sent = tokio::time::timeout(self.config.enqueue_timeout, queue.send(command)) => match sent {
                Ok(Ok(())) => EnqueueOutcome::Queued,
                Ok(Err(_)) => EnqueueOutcome::Closed,
                Err(_) => EnqueueOutcome::TimedOut,
            },
        };

        match outcome {
            EnqueueOutcome::Queued => {}
            EnqueueOutcome::Closed => {
                info!(agent_id = %agent_id, tx_id = %tx_id, resource = %resource, "Agent stream closed, deferring to replay");
            }
            EnqueueOutcome::TimedOut => {
                warn!(agent_id = %agent_id, tx_id = %tx_id, resource = %resource, "Agent queue full, deferring to replay");
            }
            EnqueueOutcome::NotAttached => {}
        }
        outcome
    }

    /// Remove `stream` from the registry if it is still the current one for
    /// its agent, then close it.
    async fn detach(&self, stream: &Arc<AgentStream>) {
        {
            let mut streams = self.streams.write().await;
            if streams
                .get(&stream.agent_id)
                .is_some_and(|current| Arc::ptr_eq(current, stream))
            {
                streams.remove(&stream.agent_id);
            }
        }
        stream.closed.cancel();
    }

    async fn dispatch(
        &self,
        stream: &AgentStream,
        sink: &dyn CommandSink,
        mut commit_rx: mpsc::Receiver<QueuedCommand>,
        mut cancel_rx: mpsc::Receiver<QueuedCommand>,
    ) -> Result<()> {
        loop {
            let (kind, queued) = tokio::select! {
                biased;
                _ = stream.closed.cancelled() => {
                    debug!(agent_id = %stream.agent_id, "Agent stream replaced");
                    return Ok(());
                }
                _ = sink.closed() => {
                    info!(agent_id = %stream.agent_id, "Agent disconnected");
                    return Ok(());
                }
                Some(queued) = commit_rx.recv() => (AgentCommandKind::Commit, queued),
                Some(queued) = cancel_rx.recv() => (AgentCommandKind::Cancel, queued),
            };

            let command = AgentCommand {
                kind: kind as i32,
                resource: queued.resource,
                tx_id: queued.tx_id,
            };

            if let Err(e) = sink.send(command).await {
                warn!(agent_id = %stream.agent_id, error = %e, "Failed to write agent command, detaching");
                return Err(e);
            }
        }
    }
}

#[async_trait]
impl Notifier for StreamNotifier {
    async fn commit_tx(&self, tx_id: &str) -> Result<()> {
        self.notify(tx_id, AgentCommandKind::Commit).await
    }

    async fn cancel_tx(&self, tx_id: &str) -> Result<()> {
        self.notify(tx_id, AgentCommandKind::Cancel).await
    }

    async fn run_agent(&self, agent_id: &str, sink: Box<dyn CommandSink>) -> Result<()> {
        let (commit_tx, commit_rx) = mpsc::channel(self.config.queue_capacity);
        let (cancel_tx, cancel_rx) = mpsc::channel(self.config.queue_capacity);
        let stream = Arc::new(AgentStream {
            agent_id: agent_id.to_string(),
            commit_tx,
            cancel_tx,
            closed: CancellationToken::new(),
        });

        let previous = self
            .streams
            .write()
            .await
            .insert(agent_id.to_string(), stream.clone());
        if let Some(previous) = previous {
            info!(agent_id = %agent_id, "Agent re-attached, closing previous stream");
            previous.closed.cancel();
        }

        info!(agent_id = %agent_id, "Agent attached");

        let result = self
            .dispatch(&stream, sink.as_ref(), commit_rx, cancel_rx)
            .await;
        self.detach(&stream).await;

        info!(agent_id = %agent_id, "Agent detached");
        result
    }
}

/// One record per `(agent, resource)`, keeping the latest lock attempt.
/// `records` must be ordered oldest first.
pub fn dedup_resources(records: &[ResourceRecord]) -> Vec<&ResourceRecord> {
    let mut latest: BTreeMap<(&str, &str), &ResourceRecord> = BTreeMap::new();
    for record in records {
        latest.insert((record.agent.as_str(), record.resource.as_str()), record);
    }
    latest.into_values().collect()
}

/// Resource status an agent reaches after applying `kind`.
pub(crate) fn target_status(kind: AgentCommandKind) -> ResourceStatus {
    match kind {
        AgentCommandKind::Commit => ResourceStatus::Confirmed,
        AgentCommandKind::Cancel => ResourceStatus::Canceled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LockKey, SqliteStorage, TxStatus};
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_storage() -> Arc<SqliteStorage> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::SQLITE.run(&pool).await.unwrap();
        Arc::new(SqliteStorage::new(pool))
    }

    fn record(id: &str, agent: &str, resource: &str) -> ResourceRecord {
        ResourceRecord {
            id: id.to_string(),
            tx_id: "T1".to_string(),
            require_id: format!("req-{}", id),
            agent: agent.to_string(),
            resource: resource.to_string(),
            status: "locked".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn wait_attached(notifier: &StreamNotifier, agent: &str) {
        for _ in 0..100 {
            if notifier.attached_agents().await.iter().any(|a| a == agent) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent {} never attached", agent);
    }

    #[test]
    fn test_dedup_keeps_latest_per_agent_resource() {
        let records = vec![
            record("R_1", "inventory", "inventory.reserve"),
            record("R_2", "payment", "payment.charge"),
            record("R_3", "inventory", "inventory.reserve"),
        ];

        let deduped = dedup_resources(&records);
        let ids: Vec<_> = deduped.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["R_3", "R_2"]);
    }

    #[tokio::test]
    async fn test_commit_tx_sends_one_command_per_resource() {
        let storage = test_storage().await;
        storage.new_tx("T1", "").await.unwrap();
        for (id, req) in [("R_1", "a"), ("R_2", "b")] {
            storage
                .new_resource(id, &LockKey::new("T1", "inventory", "inventory.reserve", req))
                .await
                .unwrap();
        }
        storage.update_tx_status("T1", TxStatus::Confirmed).await.unwrap();

        let notifier = Arc::new(StreamNotifier::new(storage, NotifierConfig::default()));
        let (sink, mut commands) = ChannelCommandSink::channel("inventory", 8);
        let runner = {
            let notifier = notifier.clone();
            tokio::spawn(async move { notifier.run_agent("inventory", Box::new(sink)).await })
        };
        wait_attached(&notifier, "inventory").await;

        notifier.commit_tx("T1").await.unwrap();

        let cmd = commands.recv().await.unwrap();
        assert_eq!(cmd.kind(), AgentCommandKind::Commit);
        assert_eq!(cmd.tx_id, "T1");
        assert_eq!(cmd.resource, "inventory.reserve");
        assert!(commands.try_recv().is_err());

        drop(commands);
        runner.await.unwrap().unwrap();
        assert!(notifier.attached_agents().await.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_without_stream_is_deferred() {
        let storage = test_storage().await;
        let notifier = StreamNotifier::new(storage, NotifierConfig::default());

        let outcome = notifier
            .enqueue("ghost", AgentCommandKind::Cancel, "T1", "payment.charge")
            .await;
        assert_eq!(outcome, EnqueueOutcome::NotAttached);
    }

    #[tokio::test]
    async fn test_reattach_replaces_previous_stream() {
        let storage = test_storage().await;
        let notifier = Arc::new(StreamNotifier::new(storage, NotifierConfig::default()));

        let (first_sink, _first_rx) = ChannelCommandSink::channel("payment", 8);
        let first = {
            let notifier = notifier.clone();
            tokio::spawn(async move { notifier.run_agent("payment", Box::new(first_sink)).await })
        };
        wait_attached(&notifier, "payment").await;

        let (second_sink, mut second_rx) = ChannelCommandSink::channel("payment", 8);
        let second = {
            let notifier = notifier.clone();
            tokio::spawn(async move { notifier.run_agent("payment", Box::new(second_sink)).await })
        };

        // The first dispatch loop ends once it is replaced.
        first.await.unwrap().unwrap();
        assert_eq!(notifier.attached_agents().await, vec!["payment".to_string()]);

        let outcome = notifier
            .enqueue("payment", AgentCommandKind::Cancel, "T9", "payment.charge")
            .await;
        assert_eq!(outcome, EnqueueOutcome::Queued);

        let cmd = second_rx.recv().await.unwrap();
        assert_eq!(cmd.kind(), AgentCommandKind::Cancel);
        assert_eq!(cmd.tx_id, "T9");

        drop(second_rx);
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_times_out_on_full_queue() {
        let storage = test_storage().await;
        let config = NotifierConfig {
            queue_capacity: 1,
            enqueue_timeout: Duration::from_millis(50),
            ..NotifierConfig::default()
        };
        let notifier = Arc::new(StreamNotifier::new(storage, config));

        // Sink that never completes a write keeps the dispatch loop busy.
        struct StuckSink;

        #[async_trait]
        impl CommandSink for StuckSink {
            async fn send(&self, _command: AgentCommand) -> Result<()> {
                std::future::pending().await
            }
        }

        let runner = {
            let notifier = notifier.clone();
            tokio::spawn(async move { notifier.run_agent("stuck", Box::new(StuckSink)).await })
        };
        wait_attached(&notifier, "stuck").await;

        let mut outcomes = Vec::new();
        for i in 0..3 {
            outcomes.push(
                notifier
                    .enqueue("stuck", AgentCommandKind::Commit, &format!("T{}", i), "r")
                    .await,
            );
        }

        // One command is held by the blocked write, one fills the queue.
        assert_eq!(outcomes[0], EnqueueOutcome::Queued);
        assert_eq!(outcomes[2], EnqueueOutcome::TimedOut);

        runner.abort();
    }
}
