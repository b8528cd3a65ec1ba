// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic re-delivery of commands agents have not acknowledged.

use std::sync::{Arc, PoisonError};

use chrono::{DateTime, Utc};
use rand::Rng;
use tcc_protocol::engine_proto::AgentCommandKind;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{EnqueueOutcome, StreamNotifier, dedup_resources, target_status};
use crate::error::Result;
use crate::storage::TxStatus;

/// In-place Fisher-Yates shuffle.
pub fn shuffle<T, R: Rng + ?Sized>(items: &mut [T], rng: &mut R) {
    for i in 0..items.len() {
        let j = rng.gen_range(0..=i);
        items.swap(i, j);
    }
}

impl StreamNotifier {
    /// Re-send pending commands every `replay_interval` until `shutdown`.
    pub async fn run_replay(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.replay_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(
            interval_secs = self.config.replay_interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "Replay loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Replay loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let queued = self.replay_once().await;
                    if queued > 0 {
                        info!(queued, "Replayed pending commands");
                    }
                }
            }
        }
    }

    /// One replay sweep over every attached agent, in random order.
    /// Returns the number of commands queued.
    pub async fn replay_once(&self) -> usize {
        let mut agents = self.attached_agents().await;
        {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            shuffle(&mut agents, &mut *rng);
        }

        let mut queued = 0;
        for agent in &agents {
            match self.replay_agent(agent).await {
                Ok(n) => queued += n,
                Err(e) => error!(agent_id = %agent, error = %e, "Replay failed"),
            }
        }
        queued
    }

    /// Pending work finished before this instant is reported as stale.
    /// `None` when retention is zero.
    fn stale_before(&self) -> Option<DateTime<Utc>> {
        if self.config.retention.is_zero() {
            return None;
        }
        chrono::Duration::from_std(self.config.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
    }

    /// Re-send commands for terminal transactions whose resources of
    /// `agent_id` have not reached the matching state, however old.
    #[instrument(skip(self))]
    pub async fn replay_agent(&self, agent_id: &str) -> Result<usize> {
        let transactions = self.storage.query_notify_tx(agent_id).await?;
        let stale_before = self.stale_before();
        let mut queued = 0;

        for tx in transactions {
            let kind = match tx.status()? {
                TxStatus::Confirmed => AgentCommandKind::Commit,
                TxStatus::Canceled => AgentCommandKind::Cancel,
                TxStatus::Created => continue,
            };
            let target = target_status(kind);
            if stale_before.is_some_and(|cutoff| tx.updated_at < cutoff) {
                warn!(
                    tx_id = %tx.id,
                    agent_id = %agent_id,
                    finished_at = %tx.updated_at,
                    "Pending command outlived retention"
                );
            }

            let resources = self.storage.get_resources_by_tx(&tx.id).await?;
            for record in dedup_resources(&resources) {
                if record.agent != agent_id || record.status()? == target {
                    continue;
                }
                debug!(tx_id = %tx.id, resource = %record.resource, kind = ?kind, "Replaying command");
                if self.enqueue(agent_id, kind, &tx.id, &record.resource).await
                    == EnqueueOutcome::Queued
                {
                    queued += 1;
                }
            }
        }

        Ok(queued)
    }
}
