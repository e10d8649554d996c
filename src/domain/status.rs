//! Transaction lifecycle shared by devices and the authority.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    PendingLocal,
    Syncing,
    Completed,
    Failed,
    Reversed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::PendingLocal => "PENDING_LOCAL",
            TransactionStatus::Syncing => "SYNCING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Reversed => "REVERSED",
        }
    }

    /// The authority has seen and judged the record.
    pub fn is_synced(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed | TransactionStatus::Reversed
        )
    }

    /// Still owned by the reconciler.
    pub fn is_pending(&self) -> bool {
        !self.is_synced()
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING_LOCAL" => Ok(TransactionStatus::PendingLocal),
            "SYNCING" => Ok(TransactionStatus::Syncing),
            "COMPLETED" => Ok(TransactionStatus::Completed),
            "FAILED" => Ok(TransactionStatus::Failed),
            "REVERSED" => Ok(TransactionStatus::Reversed),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown transaction status: {0}")]
pub struct UnknownStatus(pub String);

/// Who is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// The device's background sync loop.
    Reconciler,
    /// A verdict returned by the authority (push outcome or pull snapshot).
    Authority,
    /// A human resolving a failed record.
    Operator,
    /// An administrative event such as a donation reversal.
    Administrator,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Actor::Reconciler => "reconciler",
            Actor::Authority => "authority",
            Actor::Operator => "operator",
            Actor::Administrator => "administrator",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("illegal transition {from} -> {to} requested by {actor}")]
pub struct IllegalTransition {
    pub from: TransactionStatus,
    pub to: TransactionStatus,
    pub actor: Actor,
}

/// Checks a requested transition against the lifecycle table.
///
/// Verdicts from the authority are accepted while the record is either
/// `PENDING_LOCAL` or `SYNCING`: a pull can deliver the verdict for a push
/// whose acknowledgment was lost after the record was already released.
pub fn check_transition(
    from: TransactionStatus,
    to: TransactionStatus,
    actor: Actor,
) -> Result<(), IllegalTransition> {
    use Actor::*;
    use TransactionStatus::*;

    let allowed = match (from, to) {
        (PendingLocal, Syncing) => actor == Reconciler,
        (Syncing, PendingLocal) => actor == Reconciler,
        (PendingLocal | Syncing, Completed) => actor == Authority,
        (PendingLocal | Syncing, Failed) => matches!(actor, Authority | Reconciler),
        (Failed, PendingLocal) => actor == Operator,
        (Completed, Reversed) => actor == Administrator,
        _ => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(IllegalTransition { from, to, actor })
    }
}
