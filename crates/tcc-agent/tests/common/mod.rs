// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tcc-agent end-to-end tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tcc_agent::{Agent, AgentError, AgentHandle, BoxError, ResourceHandler, Session, TxContext};
use tcc_engine::engine::Engine;
use tcc_engine::notifier::NotifierConfig;
use tcc_engine::storage::{self, ResourceStatus};

pub const REPLAY_INTERVAL: Duration = Duration::from_millis(100);
pub const REATTACH_BACKOFF: Duration = Duration::from_millis(50);

/// Engine on a fresh in-memory database, serving QUIC when `serve` is set.
pub async fn start_engine(serve: bool) -> Engine {
    let storage = storage::connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory storage");

    let mut builder = Engine::builder().storage(storage).notifier_config(NotifierConfig {
        replay_interval: REPLAY_INTERVAL,
        ..NotifierConfig::default()
    });
    if serve {
        builder = builder.bind_addr("127.0.0.1:0".parse().unwrap());
    }

    builder
        .build()
        .expect("Failed to build engine")
        .start()
        .await
        .expect("Failed to start engine")
}

/// Wait until every agent in `agents` has a live command stream.
pub async fn wait_attached(engine: &Engine, agents: &[&str]) {
    for _ in 0..300 {
        let attached = engine.notifier().attached_agents().await;
        if agents.iter().all(|a| attached.iter().any(|x| x == a)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("agents {:?} did not attach within 3s", agents);
}

/// Poll `check` until it holds, failing after five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Statuses of every lock row of `tx_id`, in creation order.
pub async fn resource_statuses(engine: &Engine, tx_id: &str) -> Vec<(String, ResourceStatus)> {
    engine
        .scheduler()
        .storage()
        .get_resources_by_tx(tx_id)
        .await
        .unwrap()
        .iter()
        .map(|row| (row.resource.clone(), row.status().unwrap()))
        .collect()
}

pub async fn wait_statuses(engine: &Engine, tx_id: &str, expected: ResourceStatus) {
    for _ in 0..500 {
        let rows = resource_statuses(engine, tx_id).await;
        if !rows.is_empty() && rows.iter().all(|(_, status)| *status == expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "resources of {} never reached {:?}: {:?}",
        tx_id,
        expected,
        resource_statuses(engine, tx_id).await
    );
}

/// Records applied commands and fails the first `failures` calls.
#[derive(Default)]
pub struct LedgerHandler {
    applied: Mutex<Vec<(&'static str, String)>>,
    failures: AtomicUsize,
}

impl LedgerHandler {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Default::default()
        }
    }

    pub fn applied(&self) -> Vec<(&'static str, String)> {
        self.applied.lock().unwrap().clone()
    }

    pub fn has(&self, kind: &str, tx_id: &str) -> bool {
        self.applied()
            .iter()
            .any(|(k, tx)| *k == kind && tx == tx_id)
    }

    fn apply(&self, kind: &'static str, tx_id: &str) -> Result<(), BoxError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(format!("{} of {} refused", kind, tx_id).into());
        }
        self.applied.lock().unwrap().push((kind, tx_id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl ResourceHandler for LedgerHandler {
    async fn commit(&self, tx_id: &str) -> Result<(), BoxError> {
        self.apply("commit", tx_id)
    }

    async fn cancel(&self, tx_id: &str) -> Result<(), BoxError> {
        self.apply("cancel", tx_id)
    }
}

/// Two agents attached to one engine: `inventory` owns `inventory.reserve`,
/// `payment` owns `payment.charge`.
pub struct Deployment {
    pub engine: Engine,
    pub inventory: Agent,
    pub payment: Agent,
    pub stock: Arc<LedgerHandler>,
    pub ledger: Arc<LedgerHandler>,
    handles: Vec<AgentHandle>,
}

impl Deployment {
    pub async fn start(
        engine: Engine,
        inventory: Agent,
        payment: Agent,
        stock: Arc<LedgerHandler>,
    ) -> Self {
        let ledger = Arc::new(LedgerHandler::default());
        inventory.register("inventory.reserve", stock.clone()).unwrap();
        payment.register("payment.charge", ledger.clone()).unwrap();

        let handles = vec![inventory.start(), payment.start()];
        wait_attached(&engine, &["inventory", "payment"]).await;

        Self {
            engine,
            inventory,
            payment,
            stock,
            ledger,
            handles,
        }
    }

    pub async fn shutdown(self) {
        for handle in self.handles {
            handle.shutdown().await.unwrap();
        }
        self.engine.shutdown().await.unwrap();
    }
}

/// Open a session on `payment`, charge, and reserve stock on `inventory`
/// under the propagated context. Returns the still open session.
pub async fn checkout(d: &Deployment) -> Session {
    let session = Session::new(&d.payment, &TxContext::default()).await.unwrap();
    assert!(!session.is_linked());

    let inventory = d.inventory.clone();
    session
        .local_call("payment.charge", |ctx| async move {
            // Metadata is all that crosses the process boundary.
            let metadata = ctx.to_metadata();
            let remote = TxContext::from_metadata(metadata.iter().map(|(k, v)| (*k, v.as_str())));

            let inner = inventory.enter(&remote, "inventory.reserve").await?;
            assert_eq!(inner.tx_id, ctx.tx_id);
            assert!(!inner.locally_rooted);
            inventory.exit(&inner, "inventory.reserve").await?;
            Ok::<_, AgentError>(())
        })
        .await
        .unwrap();

    session
}

pub async fn commit_round_trip(d: &Deployment) {
    let session = checkout(d).await;
    let tx_id = session.tx_id().to_string();
    wait_statuses(&d.engine, &tx_id, ResourceStatus::Locked).await;

    session.commit().await.unwrap();

    eventually(|| d.stock.has("commit", &tx_id), "inventory commit").await;
    eventually(|| d.ledger.has("commit", &tx_id), "payment commit").await;
    wait_statuses(&d.engine, &tx_id, ResourceStatus::Confirmed).await;
}

pub async fn cancel_round_trip(d: &Deployment) {
    let session = checkout(d).await;
    let tx_id = session.tx_id().to_string();

    session.cancel().await.unwrap();

    eventually(|| d.stock.has("cancel", &tx_id), "inventory cancel").await;
    eventually(|| d.ledger.has("cancel", &tx_id), "payment cancel").await;
    wait_statuses(&d.engine, &tx_id, ResourceStatus::Canceled).await;
    assert!(!d.stock.has("commit", &tx_id));
}

pub async fn implicit_root_is_committed(d: &Deployment) {
    let ctx = d
        .inventory
        .enter(&TxContext::default(), "inventory.reserve")
        .await
        .unwrap();
    assert!(ctx.locally_rooted);
    d.inventory.exit(&ctx, "inventory.reserve").await.unwrap();

    eventually(|| d.stock.has("commit", &ctx.tx_id), "implicit commit").await;
    wait_statuses(&d.engine, &ctx.tx_id, ResourceStatus::Confirmed).await;
}
