//! Seams used by the device side: the local queue, the sequence source and
//! the transport to the authority.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{LifecycleError, StatusChange, Transaction, TransactionStatus};
use crate::protocol::{PullRequest, PullResponse, PushRequest, PushResponse};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transaction {0} already exists")]
    DuplicateId(Uuid),

    #[error("transaction {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Errors confined to a single record; the rest of a batch can proceed.
    pub fn is_record_scoped(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_) | StoreError::Lifecycle(_) | StoreError::Corrupt { .. }
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable, append-only queue of transactions recorded on this device.
///
/// Every write is durable by the time the returned future resolves.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Fails with [`StoreError::DuplicateId`] if the id is already stored.
    async fn append(&self, tx: &Transaction) -> StoreResult<()>;

    /// Records still owned by the reconciler (`PENDING_LOCAL` or `SYNCING`),
    /// ordered by `device_sequence`. Never yields judged records.
    fn list_pending(&self) -> BoxStream<'_, StoreResult<Transaction>>;

    /// Validates `change` against the lifecycle and persists the result.
    async fn update_status(
        &self,
        id: Uuid,
        change: &StatusChange,
        now: DateTime<Utc>,
    ) -> StoreResult<Transaction>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<Transaction>>;

    /// All records, optionally filtered by status, ordered by `device_sequence`.
    async fn list(&self, status: Option<TransactionStatus>) -> StoreResult<Vec<Transaction>>;

    /// Marks a record for manual inspection. `key` is the raw stored id so
    /// that records whose id no longer decodes can still be flagged.
    async fn flag_for_inspection(&self, key: &str, note: &str) -> StoreResult<()>;

    /// Removes the inspection note so the record rejoins push and pull.
    async fn clear_inspection(&self, id: Uuid) -> StoreResult<Transaction>;
}

/// Per-device monotonic counter that survives restarts.
#[async_trait]
pub trait SequenceSource: Send + Sync {
    async fn next_sequence(&self, device_id: &str) -> StoreResult<i64>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("authority unavailable: {0}")]
    Unavailable(String),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected response from authority: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait AuthorityTransport: Send + Sync {
    async fn push(&self, request: PushRequest) -> Result<PushResponse, TransportError>;
    async fn pull(&self, request: PullRequest) -> Result<PullResponse, TransportError>;
}
