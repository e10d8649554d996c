//! Seams used by the authority: the receipt-numbered ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{IllegalTransition, ReceiptNumber, TransactionStatus};
use crate::protocol::{AuthorityState, Submission};

/// A judged transaction as persisted by the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(flatten)]
    pub submission: Submission,
    pub status: TransactionStatus,
    pub receipt_number: Option<ReceiptNumber>,
    pub rejection_reason: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn id(&self) -> Uuid {
        self.submission.id
    }

    pub fn state(&self) -> AuthorityState {
        match (self.status, self.receipt_number) {
            (TransactionStatus::Completed, Some(receipt_number)) => {
                AuthorityState::Completed { receipt_number }
            }
            (TransactionStatus::Reversed, Some(receipt_number)) => {
                AuthorityState::Reversed { receipt_number }
            }
            (TransactionStatus::Failed, _) => AuthorityState::Failed {
                reason: self
                    .rejection_reason
                    .clone()
                    .unwrap_or_else(|| "rejected".to_string()),
            },
            _ => AuthorityState::Unknown,
        }
    }
}

/// Result of a ledger write: the stored entry and whether this call created it.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub entry: LedgerEntry,
    pub inserted: bool,
}

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("batch of {size} transactions exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("submission for organization {actual} sent to organization {expected}")]
    OrganizationMismatch { expected: Uuid, actual: Uuid },

    #[error("transaction {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("corrupt ledger entry {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
}

pub type AuthorityResult<T> = Result<T, AuthorityError>;

/// Authority-side ledger. `accept` is the only place receipt numbers are
/// issued: the counter increment and the entry insert commit together.
#[async_trait]
pub trait ReceiptLedger: Send + Sync {
    async fn find(&self, ids: &[Uuid]) -> AuthorityResult<Vec<LedgerEntry>>;

    /// Stores the submission as `COMPLETED` with the next receipt number of
    /// its organization. If the id is already stored, returns the existing
    /// entry untouched with `inserted = false`.
    async fn accept(&self, submission: &Submission) -> AuthorityResult<Recorded>;

    /// Stores the submission as `FAILED` with `reason`. Same idempotency as
    /// [`ReceiptLedger::accept`].
    async fn reject(&self, submission: &Submission, reason: &str) -> AuthorityResult<Recorded>;

    async fn reverse(&self, organization_id: Uuid, id: Uuid) -> AuthorityResult<LedgerEntry>;

    /// Completed entries of an organization ordered by receipt number.
    async fn completed(&self, organization_id: Uuid) -> AuthorityResult<Vec<LedgerEntry>>;

    async fn health_check(&self) -> AuthorityResult<()>;
}
