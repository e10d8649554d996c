//! SQLite implementation of the device-local ledger store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use sqlx::SqlitePool;
use std::path::Path;
use uuid::Uuid;

use crate::db;
use crate::domain::{
    Payload, ReceiptNumber, StatusChange, SyncBookkeeping, Transaction, TransactionStatus,
};
use crate::ports::{LedgerStore, SequenceSource, StoreError, StoreResult};

macro_rules! select_local {
    ($tail:literal) => {
        concat!(
            "SELECT id, device_id, device_sequence, organization_id, branch_id, payload, ",
            "recorded_at, status, receipt_number, failure_reason, attempt_count, ",
            "next_retry_at, last_pushed_at, inspection_note, updated_at ",
            "FROM local_transactions ",
            $tail
        )
    };
}

/// SQLite-backed device store.
#[derive(Clone)]
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (or creates) the database file and applies pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let pool = db::create_device_pool(path).await?;
        db::migrate_device(&pool).await?;
        Ok(Self::new(pool))
    }

    pub async fn in_memory() -> StoreResult<Self> {
        let pool = db::create_memory_device_pool().await?;
        db::migrate_device(&pool).await?;
        Ok(Self::new(pool))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn append(&self, tx: &Transaction) -> StoreResult<()> {
        let payload = serde_json::to_string(&tx.payload).map_err(|e| StoreError::Corrupt {
            key: tx.id.to_string(),
            reason: e.to_string(),
        })?;

        let mut conn = self.pool.begin().await?;

        let exists: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM local_transactions WHERE id = ?")
                .bind(tx.id.to_string())
                .fetch_optional(&mut *conn)
                .await?;
        if exists.is_some() {
            return Err(StoreError::DuplicateId(tx.id));
        }

        sqlx::query(
            r#"
            INSERT INTO local_transactions (
                id, device_id, device_sequence, organization_id, branch_id, payload,
                recorded_at, status, receipt_number, failure_reason, attempt_count,
                next_retry_at, last_pushed_at, inspection_note, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tx.id.to_string())
        .bind(&tx.device_id)
        .bind(tx.device_sequence)
        .bind(tx.organization_id.to_string())
        .bind(tx.branch_id.to_string())
        .bind(payload)
        .bind(tx.recorded_at)
        .bind(tx.status.as_str())
        .bind(tx.receipt_number.map(ReceiptNumber::to_db))
        .bind(&tx.failure_reason)
        .bind(i64::from(tx.sync.attempt_count))
        .bind(tx.sync.next_retry_at)
        .bind(tx.sync.last_pushed_at)
        .bind(&tx.inspection_note)
        .bind(tx.updated_at)
        .execute(&mut *conn)
        .await?;

        conn.commit().await?;
        Ok(())
    }

    fn list_pending(&self) -> BoxStream<'_, StoreResult<Transaction>> {
        sqlx::query_as::<_, LocalTransactionRow>(select_local!(
            "WHERE status IN (?, ?) ORDER BY device_sequence ASC"
        ))
        .bind(TransactionStatus::PendingLocal.as_str())
        .bind(TransactionStatus::Syncing.as_str())
        .fetch(&self.pool)
        .map(|row| {
            row.map_err(StoreError::from)
                .and_then(LocalTransactionRow::into_domain)
        })
        .boxed()
    }

    async fn update_status(
        &self,
        id: Uuid,
        change: &StatusChange,
        now: DateTime<Utc>,
    ) -> StoreResult<Transaction> {
        let mut conn = self.pool.begin().await?;

        let row = sqlx::query_as::<_, LocalTransactionRow>(select_local!("WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(StoreError::NotFound(id))?;

        let mut tx = row.into_domain()?;
        tx.apply(change, now)?;

        sqlx::query(
            r#"
            UPDATE local_transactions
            SET status = ?, receipt_number = ?, failure_reason = ?, attempt_count = ?,
                next_retry_at = ?, last_pushed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(tx.status.as_str())
        .bind(tx.receipt_number.map(ReceiptNumber::to_db))
        .bind(&tx.failure_reason)
        .bind(i64::from(tx.sync.attempt_count))
        .bind(tx.sync.next_retry_at)
        .bind(tx.sync.last_pushed_at)
        .bind(tx.updated_at)
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;

        conn.commit().await?;
        Ok(tx)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Transaction>> {
        sqlx::query_as::<_, LocalTransactionRow>(select_local!("WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(LocalTransactionRow::into_domain)
            .transpose()
    }

    async fn list(&self, status: Option<TransactionStatus>) -> StoreResult<Vec<Transaction>> {
        let status = status.map(|s| s.as_str());
        let rows = sqlx::query_as::<_, LocalTransactionRow>(select_local!(
            "WHERE (? IS NULL OR status = ?) ORDER BY device_sequence ASC"
        ))
        .bind(status)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LocalTransactionRow::into_domain).collect()
    }

    async fn flag_for_inspection(&self, key: &str, note: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE local_transactions SET inspection_note = ? WHERE id = ?")
            .bind(note)
            .bind(key)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(match Uuid::parse_str(key) {
                Ok(id) => StoreError::NotFound(id),
                Err(e) => StoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                },
            });
        }
        Ok(())
    }

    async fn clear_inspection(&self, id: Uuid) -> StoreResult<Transaction> {
        let result =
            sqlx::query("UPDATE local_transactions SET inspection_note = NULL WHERE id = ?")
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }

        self.get(id).await?.ok_or(StoreError::NotFound(id))
    }
}

#[async_trait]
impl SequenceSource for SqliteLedgerStore {
    async fn next_sequence(&self, device_id: &str) -> StoreResult<i64> {
        let next: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO device_sequences (device_id, last_value) VALUES (?, 1)
            ON CONFLICT (device_id) DO UPDATE SET last_value = last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(device_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(next)
    }
}

/// Internal row type for SQLx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct LocalTransactionRow {
    id: String,
    device_id: String,
    device_sequence: i64,
    organization_id: String,
    branch_id: String,
    payload: String,
    recorded_at: DateTime<Utc>,
    status: String,
    receipt_number: Option<i64>,
    failure_reason: Option<String>,
    attempt_count: i64,
    next_retry_at: Option<DateTime<Utc>>,
    last_pushed_at: Option<DateTime<Utc>>,
    inspection_note: Option<String>,
    updated_at: DateTime<Utc>,
}

impl LocalTransactionRow {
    fn into_domain(self) -> StoreResult<Transaction> {
        let key = self.id.clone();
        let corrupt = |reason: String| StoreError::Corrupt {
            key: key.clone(),
            reason,
        };

        let id = Uuid::parse_str(&self.id).map_err(|e| corrupt(format!("id: {}", e)))?;
        let organization_id = Uuid::parse_str(&self.organization_id)
            .map_err(|e| corrupt(format!("organization_id: {}", e)))?;
        let branch_id =
            Uuid::parse_str(&self.branch_id).map_err(|e| corrupt(format!("branch_id: {}", e)))?;
        let payload: Payload = serde_json::from_str(&self.payload)
            .map_err(|e| corrupt(format!("payload: {}", e)))?;
        let status: TransactionStatus = self
            .status
            .parse()
            .map_err(|e| corrupt(format!("status: {}", e)))?;
        let receipt_number = match self.receipt_number {
            Some(raw) => Some(
                ReceiptNumber::from_db(raw)
                    .ok_or_else(|| corrupt(format!("receipt_number: {}", raw)))?,
            ),
            None => None,
        };
        let attempt_count = u32::try_from(self.attempt_count)
            .map_err(|e| corrupt(format!("attempt_count: {}", e)))?;

        Ok(Transaction {
            id,
            device_id: self.device_id,
            device_sequence: self.device_sequence,
            organization_id,
            branch_id,
            payload,
            recorded_at: self.recorded_at,
            status,
            receipt_number,
            failure_reason: self.failure_reason,
            inspection_note: self.inspection_note,
            sync: SyncBookkeeping {
                attempt_count,
                next_retry_at: self.next_retry_at,
                last_pushed_at: self.last_pushed_at,
            },
            updated_at: self.updated_at,
        })
    }
}
