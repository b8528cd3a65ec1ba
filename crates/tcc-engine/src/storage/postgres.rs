// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed storage.

use sqlx::PgPool;

use super::{
    LockKey, ResourceRecord, ResourceStatus, Storage, TransactionRecord, TxStatus, insert_error,
};
use crate::error::Result;

#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Create a new Postgres-backed storage. Migrations must already be applied.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Storage for PostgresStorage {
    async fn new_tx(&self, id: &str, parent_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tcc_transactions (id, parent_id, status, created_at, updated_at)
            VALUES ($1, $2, 'created', NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(parent_id)
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
            WHERE id = $1
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
            SET status = $1, updated_at = NOW()
            WHERE id = $2 AND status = 'created'
            "#,
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn new_resource(&self, id: &str, key: &LockKey) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tcc_resources
                (id, tx_id, require_id, agent, resource, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'created', NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(&key.tx_id)
        .bind(&key.require_id)
        .bind(&key.agent)
        .bind(&key.resource)
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error(e, "Resource lock", &key.to_string(), &key.tx_id))?;

        Ok(())
    }

    async fn update_resource_status(&self, key: &LockKey, status: ResourceStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tcc_resources
            SET status = $1, updated_at = NOW()
            WHERE tx_id = $2 AND require_id = $3 AND agent = $4 AND resource = $5
              AND status IN ('created', 'locked')
            "#,
        )
        .bind(status.as_str())
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
            SET status = $1, updated_at = NOW()
            WHERE tx_id = $2 AND agent = $3 AND resource = $4
              AND status IN ('created', 'locked')
            "#,
        )
        .bind(status.as_str())
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
            WHERE tx_id = $1
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
            WHERE r.agent = $1
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
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn test_storage() -> Option<PostgresStorage> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        crate::migrations::POSTGRES.run(&pool).await.ok()?;
        Some(PostgresStorage::new(pool))
    }

    async fn cleanup(storage: &PostgresStorage, tx_id: &str) {
        sqlx::query("DELETE FROM tcc_resources WHERE tx_id = $1")
            .bind(tx_id)
            .execute(storage.pool())
            .await
            .ok();
        sqlx::query("DELETE FROM tcc_transactions WHERE id = $1")
            .bind(tx_id)
            .execute(storage.pool())
            .await
            .ok();
    }

    #[tokio::test]
    async fn test_tx_lifecycle() {
        let Some(storage) = test_storage().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        let tx_id = Uuid::now_v7().to_string();
        storage.new_tx(&tx_id, "").await.unwrap();
        assert!(storage.new_tx(&tx_id, "").await.unwrap_err().is_already_exists());

        assert!(storage.update_tx_status(&tx_id, TxStatus::Canceled).await.unwrap());
        assert!(!storage.update_tx_status(&tx_id, TxStatus::Confirmed).await.unwrap());

        let tx = storage.get_tx(&tx_id).await.unwrap().unwrap();
        assert_eq!(tx.status().unwrap(), TxStatus::Canceled);

        cleanup(&storage, &tx_id).await;
    }

    #[tokio::test]
    async fn test_resources_and_replay_query() {
        let Some(storage) = test_storage().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        let tx_id = Uuid::now_v7().to_string();
        let agent = format!("inventory-{}", Uuid::now_v7());
        storage.new_tx(&tx_id, "").await.unwrap();

        let key = LockKey::new(&tx_id, &agent, "inventory.reserve", "R_a");
        storage.new_resource(&format!("R_{}", Uuid::now_v7()), &key).await.unwrap();
        let err = storage
            .new_resource(&format!("R_{}", Uuid::now_v7()), &key)
            .await
            .unwrap_err();
        assert!(err.is_already_exists());

        assert!(storage.update_resource_status(&key, ResourceStatus::Locked).await.unwrap());
        storage.update_tx_status(&tx_id, TxStatus::Confirmed).await.unwrap();

        let pending = storage.query_notify_tx(&agent).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, tx_id);

        let changed = storage
            .update_resources_status(&tx_id, &agent, "inventory.reserve", ResourceStatus::Confirmed)
            .await
            .unwrap();
        assert_eq!(changed, 1);
        assert!(storage.query_notify_tx(&agent).await.unwrap().is_empty());

        cleanup(&storage, &tx_id).await;
    }
}
