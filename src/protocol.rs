//! Wire types exchanged between devices and the authority.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Payload, ReceiptNumber, Transaction};

/// A transaction as the authority sees it: domain fields only, transport
/// bookkeeping stripped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub device_id: String,
    pub device_sequence: i64,
    pub organization_id: Uuid,
    pub branch_id: Uuid,
    pub payload: Payload,
    pub recorded_at: DateTime<Utc>,
}

impl From<&Transaction> for Submission {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id,
            device_id: tx.device_id.clone(),
            device_sequence: tx.device_sequence,
            organization_id: tx.organization_id,
            branch_id: tx.branch_id,
            payload: tx.payload.clone(),
            recorded_at: tx.recorded_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub organization_id: Uuid,
    pub device_id: String,
    pub transactions: Vec<Submission>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushResponse {
    pub outcomes: Vec<Outcome>,
}

/// Per-record verdict of a push, keyed by transaction id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Accepted {
        id: Uuid,
        receipt_number: ReceiptNumber,
    },
    Rejected {
        id: Uuid,
        reason: String,
    },
    /// The id was already processed; carries the receipt issued the first time.
    Duplicate {
        id: Uuid,
        receipt_number: ReceiptNumber,
    },
}

impl Outcome {
    pub fn id(&self) -> Uuid {
        match self {
            Outcome::Accepted { id, .. }
            | Outcome::Rejected { id, .. }
            | Outcome::Duplicate { id, .. } => *id,
        }
    }

    pub fn receipt_number(&self) -> Option<ReceiptNumber> {
        match self {
            Outcome::Accepted { receipt_number, .. } | Outcome::Duplicate { receipt_number, .. } => {
                Some(*receipt_number)
            }
            Outcome::Rejected { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub organization_id: Uuid,
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullResponse {
    pub snapshots: Vec<StatusSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub id: Uuid,
    #[serde(flatten)]
    pub state: AuthorityState,
}

/// What the authority knows about an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AuthorityState {
    Unknown,
    Completed { receipt_number: ReceiptNumber },
    Failed { reason: String },
    Reversed { receipt_number: ReceiptNumber },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_wire_format() {
        let id = Uuid::new_v4();
        let outcome = Outcome::Duplicate {
            id,
            receipt_number: ReceiptNumber::new(123).unwrap(),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            value,
            json!({ "outcome": "duplicate", "id": id, "receipt_number": 123 })
        );
        assert_eq!(outcome.id(), id);
        assert_eq!(outcome.receipt_number().map(|r| r.value()), Some(123));
    }

    #[test]
    fn test_snapshot_flattens_state() {
        let id = Uuid::new_v4();
        let snapshot: StatusSnapshot =
            serde_json::from_value(json!({ "id": id, "state": "failed", "reason": "unknown branch" }))
                .unwrap();
        assert_eq!(
            snapshot.state,
            AuthorityState::Failed {
                reason: "unknown branch".to_string()
            }
        );

        let unknown: StatusSnapshot =
            serde_json::from_value(json!({ "id": id, "state": "unknown" })).unwrap();
        assert_eq!(unknown.state, AuthorityState::Unknown);
    }

    #[test]
    fn test_zero_receipt_is_rejected_on_the_wire() {
        let id = Uuid::new_v4();
        let parsed = serde_json::from_value::<Outcome>(
            json!({ "outcome": "accepted", "id": id, "receipt_number": 0 }),
        );
        assert!(parsed.is_err());
    }
}
