use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{
    Actor, ReceiptNumber, StatusChange, Transaction, TransactionDraft, TransactionStatus,
};
use crate::identity::{new_transaction_id, Clock, SystemClock};
use crate::ports::{LedgerStore, SequenceSource, StoreResult};

const NOTIFICATION_CAPACITY: usize = 256;

/// Pushed to subscribers whenever a local record changes status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub id: Uuid,
    pub status: TransactionStatus,
    pub receipt_number: Option<ReceiptNumber>,
    pub synced_to_server: bool,
    pub at: DateTime<Utc>,
}

impl From<&Transaction> for StatusChanged {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id,
            status: tx.status,
            receipt_number: tx.receipt_number,
            synced_to_server: tx.synced_to_server(),
            at: tx.updated_at,
        }
    }
}

/// Device-side entry point: records transactions durably and fans out status
/// changes to the UI.
pub struct DeviceLedger {
    store: Arc<dyn LedgerStore>,
    sequences: Arc<dyn SequenceSource>,
    clock: Arc<dyn Clock>,
    device_id: String,
    notifier: broadcast::Sender<StatusChanged>,
}

impl DeviceLedger {
    pub fn new<S>(store: Arc<S>, device_id: impl Into<String>) -> Self
    where
        S: LedgerStore + SequenceSource + 'static,
    {
        Self::with_clock(store, device_id, Arc::new(SystemClock))
    }

    pub fn with_clock<S>(store: Arc<S>, device_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self
    where
        S: LedgerStore + SequenceSource + 'static,
    {
        let (notifier, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            store: store.clone(),
            sequences: store,
            clock,
            device_id: device_id.into(),
            notifier,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChanged> {
        self.notifier.subscribe()
    }

    /// Records a transaction. When this returns the record is durable and
    /// `PENDING_LOCAL`; no network access happens here.
    pub async fn submit(&self, draft: TransactionDraft) -> StoreResult<Uuid> {
        let sequence = self.sequences.next_sequence(&self.device_id).await?;
        let tx = Transaction::new(
            new_transaction_id(),
            self.device_id.clone(),
            sequence,
            draft,
            self.clock.now(),
        );
        self.store.append(&tx).await?;

        info!(
            transaction_id = %tx.id,
            device_sequence = sequence,
            kind = tx.payload.kind(),
            "Transaction recorded"
        );
        self.notify(&tx);
        Ok(tx.id)
    }

    /// Persists a status change and notifies subscribers.
    pub async fn apply(&self, id: Uuid, change: &StatusChange) -> StoreResult<Transaction> {
        let tx = self.store.update_status(id, change, self.clock.now()).await?;
        debug!(transaction_id = %id, status = %tx.status, "Status updated");
        self.notify(&tx);
        Ok(tx)
    }

    pub async fn get(&self, id: Uuid) -> StoreResult<Option<Transaction>> {
        self.store.get(id).await
    }

    pub async fn list(&self, status: Option<TransactionStatus>) -> StoreResult<Vec<Transaction>> {
        self.store.list(status).await
    }

    /// Local view of an organization's completed records ordered by receipt
    /// number.
    pub async fn completed_snapshot(&self, organization_id: Uuid) -> StoreResult<Vec<Transaction>> {
        let mut records: Vec<Transaction> = self
            .store
            .list(Some(TransactionStatus::Completed))
            .await?
            .into_iter()
            .filter(|tx| tx.organization_id == organization_id)
            .collect();
        records.sort_by_key(|tx| tx.receipt_number);
        Ok(records)
    }

    /// Operator action: returns a `FAILED` record to the automatic pool with
    /// a fresh attempt budget.
    pub async fn revive(&self, id: Uuid) -> StoreResult<Transaction> {
        let tx = self
            .apply(
                id,
                &StatusChange::new(TransactionStatus::PendingLocal, Actor::Operator),
            )
            .await?;
        info!(transaction_id = %id, "Transaction revived by operator");
        Ok(tx)
    }

    /// Administrative reversal of a completed record.
    pub async fn reverse(&self, id: Uuid) -> StoreResult<Transaction> {
        let tx = self
            .apply(
                id,
                &StatusChange::new(TransactionStatus::Reversed, Actor::Administrator),
            )
            .await?;
        info!(transaction_id = %id, "Transaction reversed");
        Ok(tx)
    }

    pub async fn flag_for_inspection(&self, key: &str, note: &str) -> StoreResult<()> {
        self.store.flag_for_inspection(key, note).await
    }

    /// Operator action: drops the inspection note after the record has been
    /// looked at, so the reconciler picks it up again.
    pub async fn clear_inspection(&self, id: Uuid) -> StoreResult<Transaction> {
        let tx = self.store.clear_inspection(id).await?;
        info!(transaction_id = %id, status = %tx.status, "Inspection flag cleared by operator");
        Ok(tx)
    }

    fn notify(&self, tx: &Transaction) {
        // No subscribers is not an error.
        let _ = self.notifier.send(StatusChanged::from(tx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryLedgerStore;
    use crate::domain::{CheckIn, Payload};
    use crate::ports::StoreError;

    fn draft(organization_id: Uuid) -> TransactionDraft {
        TransactionDraft {
            organization_id,
            branch_id: Uuid::new_v4(),
            payload: Payload::CheckIn(CheckIn {
                member_id: "m-1".to_string(),
                service_id: "sunday-1".to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn test_submit_persists_pending_record_with_sequence() {
        let ledger = DeviceLedger::new(Arc::new(InMemoryLedgerStore::new()), "kiosk-1");
        let org = Uuid::new_v4();

        let first = ledger.submit(draft(org)).await.unwrap();
        let second = ledger.submit(draft(org)).await.unwrap();
        assert_ne!(first, second);

        let stored = ledger.get(second).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::PendingLocal);
        assert_eq!(stored.device_sequence, 2);
        assert_eq!(stored.device_id, "kiosk-1");
        assert!(!stored.synced_to_server());
    }

    #[tokio::test]
    async fn test_subscribers_see_every_status_change() {
        let ledger = DeviceLedger::new(Arc::new(InMemoryLedgerStore::new()), "kiosk-1");
        let mut updates = ledger.subscribe();

        let id = ledger.submit(draft(Uuid::new_v4())).await.unwrap();
        ledger
            .apply(id, &StatusChange::new(TransactionStatus::Syncing, Actor::Reconciler))
            .await
            .unwrap();
        let receipt = ReceiptNumber::new(42).unwrap();
        ledger.apply(id, &StatusChange::completed(receipt)).await.unwrap();

        let statuses: Vec<TransactionStatus> = (0..3)
            .map(|_| updates.try_recv().unwrap().status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                TransactionStatus::PendingLocal,
                TransactionStatus::Syncing,
                TransactionStatus::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_revive_only_applies_to_failed_records() {
        let ledger = DeviceLedger::new(Arc::new(InMemoryLedgerStore::new()), "kiosk-1");
        let id = ledger.submit(draft(Uuid::new_v4())).await.unwrap();

        let err = ledger.revive(id).await.unwrap_err();
        assert!(matches!(err, StoreError::Lifecycle(_)));

        ledger
            .apply(id, &StatusChange::new(TransactionStatus::Failed, Actor::Reconciler))
            .await
            .unwrap();
        let revived = ledger.revive(id).await.unwrap();
        assert_eq!(revived.status, TransactionStatus::PendingLocal);
        assert_eq!(revived.sync.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_clear_inspection_keeps_status() {
        let ledger = DeviceLedger::new(Arc::new(InMemoryLedgerStore::new()), "kiosk-1");
        let id = ledger.submit(draft(Uuid::new_v4())).await.unwrap();
        ledger
            .flag_for_inspection(&id.to_string(), "receipt conflict")
            .await
            .unwrap();

        let cleared = ledger.clear_inspection(id).await.unwrap();
        assert!(cleared.inspection_note.is_none());
        assert_eq!(cleared.status, TransactionStatus::PendingLocal);
    }

    #[tokio::test]
    async fn test_completed_snapshot_orders_by_receipt() {
        let ledger = DeviceLedger::new(Arc::new(InMemoryLedgerStore::new()), "kiosk-1");
        let org = Uuid::new_v4();
        let a = ledger.submit(draft(org)).await.unwrap();
        let b = ledger.submit(draft(org)).await.unwrap();
        ledger
            .apply(b, &StatusChange::completed(ReceiptNumber::new(7).unwrap()))
            .await
            .unwrap();
        ledger
            .apply(a, &StatusChange::completed(ReceiptNumber::new(8).unwrap()))
            .await
            .unwrap();

        let ids: Vec<Uuid> = ledger
            .completed_snapshot(org)
            .await
            .unwrap()
            .iter()
            .map(|tx| tx.id)
            .collect();
        assert_eq!(ids, vec![b, a]);
    }
}
