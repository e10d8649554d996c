use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::TransactionStatus;
use crate::ports::{AuthorityError, AuthorityResult, LedgerEntry, ReceiptLedger};
use crate::protocol::{
    AuthorityState, Outcome, PullRequest, PullResponse, PushRequest, PushResponse, StatusSnapshot,
    Submission,
};
use crate::validation::{validate_submission, BranchPolicy};

pub const DEFAULT_MAX_BATCH: usize = 50;

/// Authority-side receipt allocation. Every decision about an id is made
/// here; receipt numbers themselves come from the ledger's atomic accept.
pub struct ReceiptAllocator {
    ledger: Arc<dyn ReceiptLedger>,
    branches: BranchPolicy,
    max_batch: usize,
}

impl ReceiptAllocator {
    pub fn new(ledger: Arc<dyn ReceiptLedger>) -> Self {
        Self {
            ledger,
            branches: BranchPolicy::Any,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }

    pub fn with_branches(mut self, branches: BranchPolicy) -> Self {
        self.branches = branches;
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    /// Judges one submission. Resubmitting an id always yields the verdict
    /// recorded the first time.
    pub async fn allocate(&self, submission: &Submission) -> AuthorityResult<Outcome> {
        if let Some(existing) = self.ledger.find(&[submission.id]).await?.into_iter().next() {
            return Ok(self.replay(submission, &existing));
        }

        if let Err(e) = validate_submission(submission, &self.branches) {
            let reason = e.to_string();
            let recorded = self.ledger.reject(submission, &reason).await?;
            if recorded.inserted {
                info!(transaction_id = %submission.id, reason = %reason, "Submission rejected");
            }
            return Ok(self.replay(submission, &recorded.entry));
        }

        let recorded = self.ledger.accept(submission).await?;
        if !recorded.inserted {
            // Lost a race against a concurrent push of the same id.
            return Ok(self.replay(submission, &recorded.entry));
        }

        match recorded.entry.receipt_number {
            Some(receipt_number) => {
                info!(
                    transaction_id = %submission.id,
                    organization_id = %submission.organization_id,
                    receipt_number = %receipt_number,
                    "Receipt allocated"
                );
                Ok(Outcome::Accepted {
                    id: submission.id,
                    receipt_number,
                })
            }
            None => Err(AuthorityError::Corrupt {
                id: submission.id,
                reason: "accepted entry has no receipt number".to_string(),
            }),
        }
    }

    fn replay(&self, submission: &Submission, existing: &LedgerEntry) -> Outcome {
        let id = submission.id;
        if existing.submission.organization_id != submission.organization_id {
            warn!(
                transaction_id = %id,
                organization_id = %submission.organization_id,
                "Transaction id already recorded for another organization"
            );
            return Outcome::Rejected {
                id,
                reason: "transaction id belongs to another organization".to_string(),
            };
        }

        debug!(transaction_id = %id, status = %existing.status, "Replaying recorded verdict");
        match (existing.status, existing.receipt_number) {
            (TransactionStatus::Completed | TransactionStatus::Reversed, Some(receipt_number)) => {
                Outcome::Duplicate { id, receipt_number }
            }
            _ => Outcome::Rejected {
                id,
                reason: existing
                    .rejection_reason
                    .clone()
                    .unwrap_or_else(|| "rejected".to_string()),
            },
        }
    }

    /// Judges a batch in submission order, so receipts follow device sequence
    /// within the batch.
    pub async fn push(&self, request: PushRequest) -> AuthorityResult<PushResponse> {
        if request.transactions.len() > self.max_batch {
            return Err(AuthorityError::BatchTooLarge {
                size: request.transactions.len(),
                limit: self.max_batch,
            });
        }
        if let Some(stray) = request
            .transactions
            .iter()
            .find(|sub| sub.organization_id != request.organization_id)
        {
            return Err(AuthorityError::OrganizationMismatch {
                expected: request.organization_id,
                actual: stray.organization_id,
            });
        }

        debug!(
            device_id = %request.device_id,
            batch_size = request.transactions.len(),
            "Processing push batch"
        );

        let mut outcomes = Vec::with_capacity(request.transactions.len());
        for submission in &request.transactions {
            outcomes.push(self.allocate(submission).await?);
        }
        Ok(PushResponse { outcomes })
    }

    pub async fn pull(&self, request: PullRequest) -> AuthorityResult<PullResponse> {
        if request.ids.len() > self.max_batch {
            return Err(AuthorityError::BatchTooLarge {
                size: request.ids.len(),
                limit: self.max_batch,
            });
        }

        let entries = self.ledger.find(&request.ids).await?;
        let snapshots = request
            .ids
            .iter()
            .map(|id| {
                let state = entries
                    .iter()
                    .find(|entry| {
                        entry.id() == *id
                            && entry.submission.organization_id == request.organization_id
                    })
                    .map(LedgerEntry::state)
                    .unwrap_or(AuthorityState::Unknown);
                StatusSnapshot { id: *id, state }
            })
            .collect();

        Ok(PullResponse { snapshots })
    }

    pub async fn reverse(&self, organization_id: Uuid, id: Uuid) -> AuthorityResult<LedgerEntry> {
        self.ledger.reverse(organization_id, id).await
    }

    /// Completed entries ordered by receipt number.
    pub async fn completed_snapshot(&self, organization_id: Uuid) -> AuthorityResult<Vec<LedgerEntry>> {
        self.ledger.completed(organization_id).await
    }

    pub async fn health_check(&self) -> AuthorityResult<()> {
        self.ledger.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryReceiptLedger;
    use crate::domain::{Donation, Payload, ReceiptNumber};
    use bigdecimal::BigDecimal;
    use chrono::Utc;
    use std::collections::HashSet;

    fn submission(organization_id: Uuid, sequence: i64) -> Submission {
        Submission {
            id: Uuid::new_v4(),
            device_id: "kiosk-1".to_string(),
            device_sequence: sequence,
            organization_id,
            branch_id: Uuid::new_v4(),
            payload: Payload::Donation(Donation {
                amount: BigDecimal::from(5000),
                currency: "NGN".to_string(),
                category: None,
            }),
            recorded_at: Utc::now(),
        }
    }

    fn allocator() -> ReceiptAllocator {
        ReceiptAllocator::new(Arc::new(InMemoryReceiptLedger::new()))
    }

    fn receipt(n: u64) -> ReceiptNumber {
        ReceiptNumber::new(n).unwrap()
    }

    #[tokio::test]
    async fn test_resubmission_returns_original_receipt() {
        let allocator = allocator();
        let sub = submission(Uuid::new_v4(), 1);

        let first = allocator.allocate(&sub).await.unwrap();
        let second = allocator.allocate(&sub).await.unwrap();

        assert_eq!(first, Outcome::Accepted { id: sub.id, receipt_number: receipt(1) });
        assert_eq!(second, Outcome::Duplicate { id: sub.id, receipt_number: receipt(1) });
    }

    #[tokio::test]
    async fn test_rejection_is_remembered() {
        let org = Uuid::new_v4();
        let known_branch = Uuid::new_v4();
        let allocator = ReceiptAllocator::new(Arc::new(InMemoryReceiptLedger::new()))
            .with_branches(BranchPolicy::Only(HashSet::from([known_branch])));
        let sub = submission(org, 1);

        let first = allocator.allocate(&sub).await.unwrap();
        let again = allocator.allocate(&sub).await.unwrap();
        assert!(matches!(first, Outcome::Rejected { ref reason, .. } if reason.contains("unknown branch")));
        assert_eq!(first, again);

        // A rejection consumes no receipt number.
        let mut valid = submission(org, 2);
        valid.branch_id = known_branch;
        let ok = allocator.allocate(&valid).await.unwrap();
        assert_eq!(ok.receipt_number(), Some(receipt(1)));
    }

    #[tokio::test]
    async fn test_id_reused_by_another_organization_is_rejected() {
        let allocator = allocator();
        let sub = submission(Uuid::new_v4(), 1);
        allocator.allocate(&sub).await.unwrap();

        let mut hijack = sub.clone();
        hijack.organization_id = Uuid::new_v4();
        let outcome = allocator.allocate(&hijack).await.unwrap();
        assert!(matches!(outcome, Outcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_push_assigns_receipts_in_batch_order() {
        let allocator = allocator();
        let org = Uuid::new_v4();
        let batch: Vec<Submission> = (1..=3).map(|seq| submission(org, seq)).collect();

        let response = allocator
            .push(PushRequest {
                organization_id: org,
                device_id: "kiosk-1".to_string(),
                transactions: batch.clone(),
            })
            .await
            .unwrap();

        let receipts: Vec<u64> = response
            .outcomes
            .iter()
            .filter_map(|o| o.receipt_number().map(|r| r.value()))
            .collect();
        assert_eq!(receipts, vec![1, 2, 3]);
        assert_eq!(response.outcomes[0].id(), batch[0].id);
    }

    #[tokio::test]
    async fn test_push_rejects_oversized_and_mixed_batches() {
        let allocator = allocator().with_max_batch(1);
        let org = Uuid::new_v4();

        let err = allocator
            .push(PushRequest {
                organization_id: org,
                device_id: "kiosk-1".to_string(),
                transactions: vec![submission(org, 1), submission(org, 2)],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorityError::BatchTooLarge { size: 2, limit: 1 }));

        let err = allocator
            .push(PushRequest {
                organization_id: org,
                device_id: "kiosk-1".to_string(),
                transactions: vec![submission(Uuid::new_v4(), 1)],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorityError::OrganizationMismatch { .. }));
    }

    #[tokio::test]
    async fn test_pull_reports_unknown_and_reversed() {
        let allocator = allocator();
        let org = Uuid::new_v4();
        let sub = submission(org, 1);
        allocator.allocate(&sub).await.unwrap();
        allocator.reverse(org, sub.id).await.unwrap();

        let missing = Uuid::new_v4();
        let response = allocator
            .pull(PullRequest {
                organization_id: org,
                ids: vec![sub.id, missing],
            })
            .await
            .unwrap();

        assert_eq!(
            response.snapshots,
            vec![
                StatusSnapshot {
                    id: sub.id,
                    state: AuthorityState::Reversed { receipt_number: receipt(1) }
                },
                StatusSnapshot { id: missing, state: AuthorityState::Unknown },
            ]
        );

        // Another organization cannot see the entry.
        let foreign = allocator
            .pull(PullRequest {
                organization_id: Uuid::new_v4(),
                ids: vec![sub.id],
            })
            .await
            .unwrap();
        assert_eq!(foreign.snapshots[0].state, AuthorityState::Unknown);
    }
}
