// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed storage.

use std::path::Path;

use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{
    LockKey, ResourceRecord, ResourceStatus, Storage, TransactionRecord, TxStatus, insert_error,
};
use crate::error::{EngineError, Result};

#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Wrap an existing pool. Migrations must already be applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and apply migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| EngineError::storage("create_dir", e))?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| EngineError::storage("connect", e))?;

        crate::migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Storage for SqliteStorage {
    async fn new_tx(&self, id: &str, parent_id: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO tcc_transactions (id, parent_id, status, created_at, updated_at)
            VALUES (?, ?, 'created', ?, ?)
            "#,
        )
        .bind(id)
        .bind(parent_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error(e, "Transaction", id, id))?;

        Ok(())
    }

    async fn get_tx(&self, id: &str) -> Result<Option<TransactionRecord>> {
        let record = sqlx::query_as::<_, TransactionRecord>(
            r#"
            SELECT id, parent_id, status, created_at, updated_at
            FROM tcc_transactions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_tx_status(&self, id: &str, status: TxStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tcc_transactions
            SET status = ?, updated_at = ?
            WHERE id = ? AND status = 'created'
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn new_resource(&self, id: &str, key: &LockKey) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO tcc_resources
                (id, tx_id, require_id, agent, resource, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'created', ?, ?)
            "#,
        )
        .bind(id)
        .bind(&key.tx_id)
        .bind(&key.require_id)
        .bind(&key.agent)
        .bind(&key.resource)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error(e, "Resource lock", &key.to_string(), &key.tx_id))?;

        Ok(())
    }

    async fn update_resource_status(&self, key: &LockKey, status: ResourceStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tcc_resources
            SET status = ?, updated_at = ?
            WHERE tx_id = ? AND require_id = ? AND agent = ? AND resource = ?
              AND status IN ('created', 'locked')
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(&key.tx_id)
        .bind(&key.require_id)
        .bind(&key.agent)
        .bind(&key.resource)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_resources_status(
        &self,
        tx_id: &str,
        agent: &str,
        resource: &str,
        status: ResourceStatus,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tcc_resources
            SET status = ?, updated_at = ?
            WHERE tx_id = ? AND agent = ? AND resource = ?
              AND status IN ('created', 'locked')
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(tx_id)
        .bind(agent)
        .bind(resource)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get_resources_by_tx(&self, tx_id: &str) -> Result<Vec<ResourceRecord>> {
        let records = sqlx::query_as::<_, ResourceRecord>(
            r#"
            SELECT id, tx_id, require_id, agent, resource, status, created_at, updated_at
            FROM tcc_resources
            WHERE tx_id = ?
            ORDER BY created_at, id
            "#,
        )
        .bind(tx_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn query_notify_tx(&self, agent: &str) -> Result<Vec<TransactionRecord>> {
        let records = sqlx::query_as::<_, TransactionRecord>(
            r#"
            SELECT DISTINCT t.id, t.parent_id, t.status, t.created_at, t.updated_at
            FROM tcc_transactions t
            JOIN tcc_resources r ON r.tx_id = t.id
            WHERE r.agent = ?
              AND ((t.status = 'confirmed' AND r.status <> 'confirmed')
                OR (t.status = 'canceled' AND r.status <> 'canceled'))
            ORDER BY t.updated_at, t.id
            "#,
        )
        .bind(agent)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn health_check(&self) -> Result<()> {
        let _: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}
