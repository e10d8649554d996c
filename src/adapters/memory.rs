//! In-memory adapters for the device store and the authority ledger.
//!
//! Used by tests and by single-process setups where the authority runs in the
//! same binary as the device. Nothing here survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{
    check_transition, Actor, ReceiptNumber, StatusChange, Transaction, TransactionStatus,
};
use crate::ports::{
    AuthorityError, AuthorityResult, LedgerEntry, LedgerStore, ReceiptLedger, Recorded,
    SequenceSource, StoreError, StoreResult,
};
use crate::protocol::Submission;

#[derive(Default)]
struct DeviceState {
    records: HashMap<Uuid, Transaction>,
    sequences: HashMap<String, i64>,
}

/// Device store backed by a map. Locks are never held across an await.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    state: RwLock<DeviceState>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, DeviceState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DeviceState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn sorted(&self, filter: impl Fn(&Transaction) -> bool) -> Vec<Transaction> {
        let mut records: Vec<Transaction> = self
            .read()
            .records
            .values()
            .filter(|tx| filter(tx))
            .cloned()
            .collect();
        records.sort_by_key(|tx| (tx.device_id.clone(), tx.device_sequence));
        records
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn append(&self, tx: &Transaction) -> StoreResult<()> {
        let mut state = self.write();
        if state.records.contains_key(&tx.id) {
            return Err(StoreError::DuplicateId(tx.id));
        }
        state.records.insert(tx.id, tx.clone());
        Ok(())
    }

    fn list_pending(&self) -> BoxStream<'_, StoreResult<Transaction>> {
        let pending = self.sorted(|tx| tx.status.is_pending());
        stream::iter(pending.into_iter().map(Ok)).boxed()
    }

    async fn update_status(
        &self,
        id: Uuid,
        change: &StatusChange,
        now: DateTime<Utc>,
    ) -> StoreResult<Transaction> {
        let mut state = self.write();
        let record = state.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let mut updated = record.clone();
        updated.apply(change, now)?;
        *record = updated.clone();
        Ok(updated)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Transaction>> {
        Ok(self.read().records.get(&id).cloned())
    }

    async fn list(&self, status: Option<TransactionStatus>) -> StoreResult<Vec<Transaction>> {
        Ok(self.sorted(|tx| status.map_or(true, |s| tx.status == s)))
    }

    async fn flag_for_inspection(&self, key: &str, note: &str) -> StoreResult<()> {
        let id = Uuid::parse_str(key).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let mut state = self.write();
        let record = state.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.inspection_note = Some(note.to_string());
        Ok(())
    }

    async fn clear_inspection(&self, id: Uuid) -> StoreResult<Transaction> {
        let mut state = self.write();
        let record = state.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.inspection_note = None;
        Ok(record.clone())
    }
}

#[async_trait]
impl SequenceSource for InMemoryLedgerStore {
    async fn next_sequence(&self, device_id: &str) -> StoreResult<i64> {
        let mut state = self.write();
        let counter = state.sequences.entry(device_id.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

#[derive(Default)]
struct LedgerState {
    entries: HashMap<Uuid, LedgerEntry>,
    counters: HashMap<Uuid, u64>,
}

/// Authority ledger held in memory. The whole accept path runs under one
/// lock, which plays the role of the database transaction.
pub struct InMemoryReceiptLedger {
    receipt_start: u64,
    state: Mutex<LedgerState>,
}

impl Default for InMemoryReceiptLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryReceiptLedger {
    pub fn new() -> Self {
        Self::with_receipt_start(1)
    }

    /// First receipt number handed out to each organization.
    pub fn with_receipt_start(receipt_start: u64) -> Self {
        Self {
            receipt_start: receipt_start.max(1),
            state: Mutex::new(LedgerState::default()),
        }
    }

    async fn record(
        &self,
        submission: &Submission,
        status: TransactionStatus,
        reason: Option<&str>,
    ) -> AuthorityResult<Recorded> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.entries.get(&submission.id) {
            return Ok(Recorded {
                entry: existing.clone(),
                inserted: false,
            });
        }

        let receipt_number = if status == TransactionStatus::Completed {
            let start = self.receipt_start;
            let counter = state
                .counters
                .entry(submission.organization_id)
                .and_modify(|value| *value += 1)
                .or_insert(start);
            ReceiptNumber::new(*counter)
        } else {
            None
        };

        let entry = LedgerEntry {
            submission: submission.clone(),
            status,
            receipt_number,
            rejection_reason: reason.map(str::to_string),
            processed_at: Utc::now(),
        };
        state.entries.insert(submission.id, entry.clone());
        Ok(Recorded {
            entry,
            inserted: true,
        })
    }
}

#[async_trait]
impl ReceiptLedger for InMemoryReceiptLedger {
    async fn find(&self, ids: &[Uuid]) -> AuthorityResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.entries.get(id).cloned())
            .collect())
    }

    async fn accept(&self, submission: &Submission) -> AuthorityResult<Recorded> {
        self.record(submission, TransactionStatus::Completed, None)
            .await
    }

    async fn reject(&self, submission: &Submission, reason: &str) -> AuthorityResult<Recorded> {
        self.record(submission, TransactionStatus::Failed, Some(reason))
            .await
    }

    async fn reverse(&self, organization_id: Uuid, id: Uuid) -> AuthorityResult<LedgerEntry> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(&id)
            .filter(|entry| entry.submission.organization_id == organization_id)
            .ok_or(AuthorityError::NotFound(id))?;
        check_transition(entry.status, TransactionStatus::Reversed, Actor::Administrator)?;
        entry.status = TransactionStatus::Reversed;
        Ok(entry.clone())
    }

    async fn completed(&self, organization_id: Uuid) -> AuthorityResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<LedgerEntry> = state
            .entries
            .values()
            .filter(|entry| {
                entry.submission.organization_id == organization_id
                    && entry.status == TransactionStatus::Completed
            })
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.receipt_number);
        Ok(entries)
    }

    async fn health_check(&self) -> AuthorityResult<()> {
        Ok(())
    }
}
