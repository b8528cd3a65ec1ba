// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory backend and handler doubles for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::backend::{Command, CommandStream, EngineBackend, LockRequest, Outcome};
use crate::error::{AgentError, BoxError, Result};
use crate::handler::ResourceHandler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    NewTx(String),
    Commit(String),
    Cancel(String),
    BeginLock(LockRequest),
    EndLock(LockRequest),
    StatusChanged {
        tx_id: String,
        agent: String,
        resource: String,
        outcome: Outcome,
    },
}

/// Records every call. Attach hands out queued command channels and fails
/// once the queue is empty.
#[derive(Default)]
pub struct MockBackend {
    pub calls: Mutex<Vec<Call>>,
    streams: Mutex<VecDeque<mpsc::Receiver<Command>>>,
    pub attaches: AtomicUsize,
    pub reject_locks: AtomicBool,
    next_tx: AtomicUsize,
}

impl MockBackend {
    /// Queue a command stream for the next attach.
    pub fn push_stream(&self) -> mpsc::Sender<Command> {
        let (tx, rx) = mpsc::channel(16);
        self.streams.lock().unwrap().push_back(rx);
        tx
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl EngineBackend for MockBackend {
    async fn new_tx(&self, parent_tx_id: &str) -> Result<String> {
        self.record(Call::NewTx(parent_tx_id.to_string()));
        Ok(format!("T{}", self.next_tx.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn commit(&self, tx_id: &str) -> Result<()> {
        self.record(Call::Commit(tx_id.to_string()));
        Ok(())
    }

    async fn cancel(&self, tx_id: &str) -> Result<()> {
        self.record(Call::Cancel(tx_id.to_string()));
        Ok(())
    }

    async fn begin_lock_resource(&self, lock: &LockRequest) -> Result<()> {
        if self.reject_locks.load(Ordering::SeqCst) {
            return Err(AgentError::Server {
                code: "ALREADY_EXISTS".to_string(),
                message: "duplicate lock".to_string(),
            });
        }
        self.record(Call::BeginLock(lock.clone()));
        Ok(())
    }

    async fn end_lock_resource(&self, lock: &LockRequest) -> Result<()> {
        self.record(Call::EndLock(lock.clone()));
        Ok(())
    }

    async fn resource_status_changed(
        &self,
        tx_id: &str,
        agent: &str,
        resource: &str,
        outcome: Outcome,
    ) -> Result<()> {
        self.record(Call::StatusChanged {
            tx_id: tx_id.to_string(),
            agent: agent.to_string(),
            resource: resource.to_string(),
            outcome,
        });
        Ok(())
    }

    async fn attach(&self, _agent: &str) -> Result<Box<dyn CommandStream>> {
        self.attaches.fetch_add(1, Ordering::SeqCst);
        match self.streams.lock().unwrap().pop_front() {
            Some(commands) => Ok(Box::new(MockStream { commands })),
            None => Err(AgentError::Server {
                code: "TRANSPORT_ERROR".to_string(),
                message: "engine unavailable".to_string(),
            }),
        }
    }
}

struct MockStream {
    commands: mpsc::Receiver<Command>,
}

#[async_trait]
impl CommandStream for MockStream {
    async fn next_command(&mut self) -> Result<Option<Command>> {
        Ok(self.commands.recv().await)
    }
}

/// Handler that records `(kind, tx_id)` pairs and can be told to fail.
#[derive(Default)]
pub struct RecordingHandler {
    pub applied: Mutex<Vec<(&'static str, String)>>,
    pub fail: AtomicBool,
}

impl RecordingHandler {
    pub fn applied(&self) -> Vec<(&'static str, String)> {
        self.applied.lock().unwrap().clone()
    }

    fn apply(&self, kind: &'static str, tx_id: &str) -> std::result::Result<(), BoxError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err("handler failed".into());
        }
        self.applied.lock().unwrap().push((kind, tx_id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl ResourceHandler for RecordingHandler {
    async fn commit(&self, tx_id: &str) -> std::result::Result<(), BoxError> {
        self.apply("commit", tx_id)
    }

    async fn cancel(&self, tx_id: &str) -> std::result::Result<(), BoxError> {
        self.apply("cancel", tx_id)
    }
}
