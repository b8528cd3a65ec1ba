// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage contract and backends for transactions and resource locks.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresStorage;
pub use self::sqlite::SqliteStorage;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tcc_protocol::engine_proto;

use crate::error::{EngineError, Result};

/// Transaction outcome. Moves at most once, from `Created` to a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxStatus {
    Created,
    Confirmed,
    Canceled,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Confirmed => "confirmed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created)
    }
}

/// Status of a single resource lock row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceStatus {
    Created,
    Locked,
    Confirmed,
    Canceled,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Locked => "locked",
            Self::Confirmed => "confirmed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Canceled)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "confirmed" => Ok(Self::Confirmed),
            "canceled" => Ok(Self::Canceled),
            other => Err(EngineError::validation(
                "status",
                format!("unknown transaction status '{}'", other),
            )),
        }
    }
}

impl FromStr for ResourceStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "locked" => Ok(Self::Locked),
            "confirmed" => Ok(Self::Confirmed),
            "canceled" => Ok(Self::Canceled),
            other => Err(EngineError::validation(
                "status",
                format!("unknown resource status '{}'", other),
            )),
        }
    }
}

impl From<ResourceStatus> for engine_proto::TxStatus {
    fn from(status: ResourceStatus) -> Self {
        match status {
            ResourceStatus::Created => Self::Created,
            ResourceStatus::Locked => Self::Locked,
            ResourceStatus::Confirmed => Self::Confirmed,
            ResourceStatus::Canceled => Self::Canceled,
        }
    }
}

impl From<engine_proto::TxStatus> for ResourceStatus {
    fn from(status: engine_proto::TxStatus) -> Self {
        match status {
            engine_proto::TxStatus::Created => Self::Created,
            engine_proto::TxStatus::Locked => Self::Locked,
            engine_proto::TxStatus::Confirmed => Self::Confirmed,
            engine_proto::TxStatus::Canceled => Self::Canceled,
        }
    }
}

/// Transaction row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TransactionRecord {
    pub id: String,
    /// Empty for root transactions.
    pub parent_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn status(&self) -> Result<TxStatus> {
        self.status.parse()
    }
}

/// One lock attempt on a resource.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResourceRecord {
    /// `R_`-prefixed row id.
    pub id: String,
    pub tx_id: String,
    pub require_id: String,
    pub agent: String,
    pub resource: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    pub fn status(&self) -> Result<ResourceStatus> {
        self.status.parse()
    }

    pub fn key(&self) -> LockKey {
        LockKey {
            tx_id: self.tx_id.clone(),
            agent: self.agent.clone(),
            resource: self.resource.clone(),
            require_id: self.require_id.clone(),
        }
    }
}

/// Identifying tuple of a lock attempt. Unique per resource row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub tx_id: String,
    pub agent: String,
    pub resource: String,
    pub require_id: String,
}

impl LockKey {
    pub fn new(
        tx_id: impl Into<String>,
        agent: impl Into<String>,
        resource: impl Into<String>,
        require_id: impl Into<String>,
    ) -> Self {
        Self {
            tx_id: tx_id.into(),
            agent: agent.into(),
            resource: resource.into(),
            require_id: require_id.into(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("tx_id", &self.tx_id),
            ("agent", &self.agent),
            ("resource", &self.resource),
            ("require_id", &self.require_id),
        ] {
            if value.is_empty() {
                return Err(EngineError::validation(field, "must not be empty"));
            }
        }
        Ok(())
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.tx_id, self.agent, self.resource, self.require_id
        )
    }
}

/// Persistence contract used by the scheduler and notifier.
///
/// Resource status updates never move a row out of a terminal state.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a transaction with status `created`.
    async fn new_tx(&self, id: &str, parent_id: &str) -> Result<()>;

    async fn get_tx(&self, id: &str) -> Result<Option<TransactionRecord>>;

    /// Move a `created` transaction to `status`. Returns whether a row changed.
    async fn update_tx_status(&self, id: &str, status: TxStatus) -> Result<bool>;

    /// Insert a resource lock with status `created`.
    /// A duplicate [`LockKey`] fails with `AlreadyExists`.
    async fn new_resource(&self, id: &str, key: &LockKey) -> Result<()>;

    /// Update the single row identified by `key`. Returns whether a row changed.
    async fn update_resource_status(&self, key: &LockKey, status: ResourceStatus) -> Result<bool>;

    /// Update every row of `(tx, agent, resource)` regardless of require id.
    async fn update_resources_status(
        &self,
        tx_id: &str,
        agent: &str,
        resource: &str,
        status: ResourceStatus,
    ) -> Result<u64>;

    /// Resources of a transaction, oldest first.
    async fn get_resources_by_tx(&self, tx_id: &str) -> Result<Vec<ResourceRecord>>;

    /// Terminal transactions that still have a resource of `agent` short of
    /// the matching terminal state, least recently updated first.
    async fn query_notify_tx(&self, agent: &str) -> Result<Vec<TransactionRecord>>;

    async fn health_check(&self) -> Result<()>;
}

/// Map an insert failure, surfacing uniqueness violations as `AlreadyExists`
/// and a missing parent transaction as `NotFound`.
pub(crate) fn insert_error(
    err: sqlx::Error,
    entity: &'static str,
    id: &str,
    tx_id: &str,
) -> EngineError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return EngineError::AlreadyExists {
                entity,
                id: id.to_string(),
            };
        }
        if db.is_foreign_key_violation() {
            return EngineError::NotFound {
                entity: "Transaction",
                id: tx_id.to_string(),
            };
        }
    }
    EngineError::storage("insert", err)
}

/// Connect to the database named by `database_url` and apply migrations.
///
/// `sqlite:` URLs select [`SqliteStorage`] (append `?mode=rwc` to create the
/// file), `postgres://` and `postgresql://` select [`PostgresStorage`].
pub async fn connect(database_url: &str) -> Result<Arc<dyn Storage>> {
    if database_url.starts_with("sqlite:") {
        // Each connection to an in-memory database is a separate database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| EngineError::storage("connect", e))?;
        crate::migrations::run_sqlite(&pool).await?;
        Ok(Arc::new(SqliteStorage::new(pool)))
    } else if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://")
    {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| EngineError::storage("connect", e))?;
        crate::migrations::run_postgres(&pool).await?;
        Ok(Arc::new(PostgresStorage::new(pool)))
    } else {
        Err(EngineError::validation(
            "database_url",
            "expected a sqlite: or postgres:// URL",
        ))
    }
}
