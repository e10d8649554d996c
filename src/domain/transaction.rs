//! Transaction domain entity.
//! Framework-agnostic representation of a donation or an attendance check-in.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::receipt::ReceiptNumber;
use super::status::{check_transition, Actor, IllegalTransition, TransactionStatus};

/// Kind-specific fields. The sync layer carries these without looking inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Donation(Donation),
    CheckIn(CheckIn),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Donation(_) => "donation",
            Payload::CheckIn(_) => "check_in",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Donation {
    pub amount: BigDecimal,
    pub currency: String,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckIn {
    pub member_id: String,
    pub service_id: String,
}

/// What the UI hands to `submit`; identity and sequencing are stamped later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionDraft {
    pub organization_id: Uuid,
    pub branch_id: Uuid,
    pub payload: Payload,
}

/// Transport bookkeeping. Never sent to the authority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBookkeeping {
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_pushed_at: Option<DateTime<Utc>>,
}

/// Domain entity representing a recorded transaction on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub device_id: String,
    pub device_sequence: i64,
    pub organization_id: Uuid,
    pub branch_id: Uuid,
    pub payload: Payload,
    pub recorded_at: DateTime<Utc>,
    pub status: TransactionStatus,
    pub receipt_number: Option<ReceiptNumber>,
    pub failure_reason: Option<String>,
    pub inspection_note: Option<String>,
    pub sync: SyncBookkeeping,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        id: Uuid,
        device_id: String,
        device_sequence: i64,
        draft: TransactionDraft,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            device_id,
            device_sequence,
            organization_id: draft.organization_id,
            branch_id: draft.branch_id,
            payload: draft.payload,
            recorded_at,
            status: TransactionStatus::PendingLocal,
            receipt_number: None,
            failure_reason: None,
            inspection_note: None,
            sync: SyncBookkeeping::default(),
            updated_at: recorded_at,
        }
    }

    pub fn synced_to_server(&self) -> bool {
        self.status.is_synced()
    }

    /// Eligible for the next push batch.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TransactionStatus::PendingLocal
            && self.sync.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Applies a status change in place, enforcing the lifecycle table and
    /// receipt immutability.
    pub fn apply(&mut self, change: &StatusChange, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        check_transition(self.status, change.to, change.actor)?;

        match change.to {
            TransactionStatus::Completed => {
                let receipt = change
                    .receipt_number
                    .or(self.receipt_number)
                    .ok_or(LifecycleError::MissingReceipt(self.id))?;
                if let Some(existing) = self.receipt_number {
                    if existing != receipt {
                        return Err(LifecycleError::ReceiptConflict {
                            id: self.id,
                            existing,
                            proposed: receipt,
                        });
                    }
                }
                self.receipt_number = Some(receipt);
                self.failure_reason = None;
                self.sync.next_retry_at = None;
            }
            TransactionStatus::Failed => {
                self.failure_reason = Some(
                    change
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "rejected".to_string()),
                );
                self.sync.next_retry_at = None;
            }
            TransactionStatus::PendingLocal if self.status == TransactionStatus::Failed => {
                // Operator revival starts a fresh retry budget.
                self.failure_reason = None;
                self.sync = SyncBookkeeping::default();
            }
            TransactionStatus::PendingLocal => {
                self.sync.next_retry_at = change.next_retry_at;
            }
            TransactionStatus::Syncing | TransactionStatus::Reversed => {}
        }

        if let Some(attempts) = change.attempt_count {
            self.sync.attempt_count = attempts;
        }
        if let Some(pushed_at) = change.pushed_at {
            self.sync.last_pushed_at = Some(pushed_at);
        }

        self.status = change.to;
        self.updated_at = now;
        Ok(())
    }
}

/// Requested status change plus the fields that travel with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub to: TransactionStatus,
    pub actor: Actor,
    pub receipt_number: Option<ReceiptNumber>,
    pub failure_reason: Option<String>,
    pub attempt_count: Option<u32>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub pushed_at: Option<DateTime<Utc>>,
}

impl StatusChange {
    pub fn new(to: TransactionStatus, actor: Actor) -> Self {
        Self {
            to,
            actor,
            receipt_number: None,
            failure_reason: None,
            attempt_count: None,
            next_retry_at: None,
            pushed_at: None,
        }
    }

    pub fn completed(receipt_number: ReceiptNumber) -> Self {
        Self::new(TransactionStatus::Completed, Actor::Authority).with_receipt(receipt_number)
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::new(TransactionStatus::Failed, Actor::Authority).with_reason(reason)
    }

    pub fn with_receipt(mut self, receipt_number: ReceiptNumber) -> Self {
        self.receipt_number = Some(receipt_number);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }

    pub fn with_attempt_count(mut self, attempt_count: u32) -> Self {
        self.attempt_count = Some(attempt_count);
        self
    }

    pub fn with_next_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    pub fn with_pushed_at(mut self, at: DateTime<Utc>) -> Self {
        self.pushed_at = Some(at);
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("transaction {0} cannot complete without a receipt number")]
    MissingReceipt(Uuid),

    #[error("transaction {id} already holds receipt {existing}, refusing {proposed}")]
    ReceiptConflict {
        id: Uuid,
        existing: ReceiptNumber,
        proposed: ReceiptNumber,
    },
}
