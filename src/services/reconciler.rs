//! Background push/pull reconciliation between a device and the authority.
//!
//! Push sends due `PENDING_LOCAL` records in device-sequence order and applies
//! the per-id outcomes. Pull asks the authority about records whose last push
//! is older than the reconciliation window, which resolves acknowledgements
//! lost in transit, and periodically re-checks recently completed records so
//! that reversals issued on the authority reach the device. Failures are
//! isolated per record.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{Actor, StatusChange, Transaction, TransactionStatus};
use crate::ports::{AuthorityTransport, StoreError, StoreResult, TransportError};
use crate::protocol::{AuthorityState, Outcome, PullRequest, PushRequest, Submission};
use crate::services::ledger::DeviceLedger;
use crate::services::retry::{RetryDecision, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub batch_size: usize,
    /// Bound on a single push or pull round trip.
    pub push_timeout: Duration,
    /// How long a pushed record may stay unresolved before it is pulled.
    pub reconciliation_window: Duration,
    pub poll_interval: Duration,
    /// Minimum time between two reversal reviews of completed records.
    pub reversal_review_interval: Duration,
    /// Completed records older than this are no longer reviewed.
    pub reversal_horizon: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            push_timeout: Duration::from_secs(15),
            reconciliation_window: Duration::from_secs(120),
            poll_interval: Duration::from_secs(30),
            reversal_review_interval: Duration::from_secs(60 * 60),
            reversal_horizon: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub pushed: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub retried: usize,
    pub exhausted: usize,
    pub flagged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    pub queried: usize,
    pub completed: usize,
    pub failed: usize,
    pub reversed: usize,
    pub unknown: usize,
    /// Completed records re-checked for reversal.
    pub reviewed: usize,
    pub flagged: usize,
}

pub struct SyncReconciler {
    ledger: Arc<DeviceLedger>,
    transport: Arc<dyn AuthorityTransport>,
    retry: RetryPolicy,
    settings: SyncSettings,
    wake: Notify,
    last_review: Mutex<Option<DateTime<Utc>>>,
}

impl SyncReconciler {
    pub fn new(ledger: Arc<DeviceLedger>, transport: Arc<dyn AuthorityTransport>) -> Self {
        Self::with_settings(ledger, transport, RetryPolicy::default(), SyncSettings::default())
    }

    pub fn with_settings(
        ledger: Arc<DeviceLedger>,
        transport: Arc<dyn AuthorityTransport>,
        retry: RetryPolicy,
        settings: SyncSettings,
    ) -> Self {
        Self {
            ledger,
            transport,
            retry,
            settings: SyncSettings {
                batch_size: settings.batch_size.max(1),
                ..settings
            },
            wake: Notify::new(),
            last_review: Mutex::new(None),
        }
    }

    pub fn ledger(&self) -> &Arc<DeviceLedger> {
        &self.ledger
    }

    /// Starts a cycle early. Call after an enqueue or when connectivity
    /// returns.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn connectivity_restored(&self) {
        info!("Connectivity restored, scheduling sync");
        self.wake();
    }

    /// Returns records left `SYNCING` by an interrupted run to the pool. The
    /// interrupted push keeps its place in `attempt_count`.
    pub async fn recover_in_flight(&self) -> StoreResult<usize> {
        let in_flight = self.ledger.list(Some(TransactionStatus::Syncing)).await?;
        let mut recovered = 0;
        for tx in in_flight {
            let change = StatusChange::new(TransactionStatus::PendingLocal, Actor::Reconciler);
            if self.settle(&tx.id.to_string(), tx.id, &change).await? {
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(count = recovered, "Recovered in-flight transactions");
        }
        Ok(recovered)
    }

    /// Reads the queue, flagging records that fail to load. The stream is
    /// drained before any write so the store's connection is free again.
    async fn load_pending(&self) -> StoreResult<(Vec<Transaction>, usize)> {
        let results: Vec<StoreResult<Transaction>> =
            self.ledger.store().list_pending().collect().await;

        let mut records = Vec::with_capacity(results.len());
        let mut flagged = 0;
        for result in results {
            match result {
                Ok(tx) if tx.inspection_note.is_some() => {}
                Ok(tx) => records.push(tx),
                Err(StoreError::Corrupt { key, reason }) => {
                    warn!(key = %key, reason = %reason, "Unreadable queue record");
                    self.flag(&key, &reason).await;
                    flagged += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok((records, flagged))
    }

    /// One push cycle over the due records, at most one batch.
    pub async fn push_cycle(&self) -> StoreResult<PushReport> {
        let now = self.ledger.now();
        let (pending, flagged) = self.load_pending().await?;
        let mut report = PushReport {
            flagged,
            ..PushReport::default()
        };

        let due: Vec<Transaction> = pending
            .into_iter()
            .filter(|tx| tx.is_due(now))
            .take(self.settings.batch_size)
            .collect();
        if due.is_empty() {
            return Ok(report);
        }

        for (organization_id, group) in group_by_organization(due) {
            self.push_group(organization_id, group, now, &mut report)
                .await?;
        }

        info!(
            pushed = report.pushed,
            accepted = report.accepted,
            duplicates = report.duplicates,
            rejected = report.rejected,
            retried = report.retried,
            exhausted = report.exhausted,
            flagged = report.flagged,
            "Push cycle finished"
        );
        Ok(report)
    }

    async fn push_group(
        &self,
        organization_id: Uuid,
        group: Vec<Transaction>,
        now: DateTime<Utc>,
        report: &mut PushReport,
    ) -> StoreResult<()> {
        let mut in_flight = Vec::with_capacity(group.len());
        for tx in group {
            let change = StatusChange::new(TransactionStatus::Syncing, Actor::Reconciler)
                .with_attempt_count(tx.sync.attempt_count.saturating_add(1))
                .with_pushed_at(now);
            match self.ledger.apply(tx.id, &change).await {
                Ok(marked) => in_flight.push(marked),
                Err(e) if e.is_record_scoped() => {
                    self.flag(&tx.id.to_string(), &e.to_string()).await;
                    report.flagged += 1;
                }
                Err(e) => return Err(e),
            }
        }
        if in_flight.is_empty() {
            return Ok(());
        }

        let request = PushRequest {
            organization_id,
            device_id: self.ledger.device_id().to_string(),
            transactions: in_flight.iter().map(Submission::from).collect(),
        };
        report.pushed += in_flight.len();
        debug!(
            organization_id = %organization_id,
            batch_size = in_flight.len(),
            "Pushing batch"
        );

        let outcomes = match self.with_timeout(self.transport.push(request)).await {
            Ok(response) => response
                .outcomes
                .into_iter()
                .map(|outcome| (outcome.id(), outcome))
                .collect::<HashMap<Uuid, Outcome>>(),
            Err(e) => {
                warn!(organization_id = %organization_id, error = %e, "Push failed");
                for tx in &in_flight {
                    self.release(tx, &e.to_string(), report).await?;
                }
                return Ok(());
            }
        };

        for tx in &in_flight {
            let change = match outcomes.get(&tx.id) {
                Some(Outcome::Accepted { receipt_number, .. }) => {
                    report.accepted += 1;
                    StatusChange::completed(*receipt_number)
                }
                Some(Outcome::Duplicate { receipt_number, .. }) => {
                    report.duplicates += 1;
                    StatusChange::completed(*receipt_number)
                }
                Some(Outcome::Rejected { reason, .. }) => {
                    report.rejected += 1;
                    StatusChange::rejected(reason.clone())
                }
                None => {
                    self.release(tx, "no outcome returned", report).await?;
                    continue;
                }
            };
            if !self.settle(&tx.id.to_string(), tx.id, &change).await? {
                report.flagged += 1;
            }
        }
        Ok(())
    }

    /// Hands a record whose push did not resolve back to the retry policy.
    async fn release(
        &self,
        tx: &Transaction,
        error: &str,
        report: &mut PushReport,
    ) -> StoreResult<()> {
        let attempts = tx.sync.attempt_count;
        let change = match self.retry.decide(attempts) {
            RetryDecision::RetryAfter(delay) => {
                report.retried += 1;
                let at = self
                    .ledger
                    .now()
                    .checked_add_signed(to_chrono(delay))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                StatusChange::new(TransactionStatus::PendingLocal, Actor::Reconciler)
                    .with_next_retry_at(at)
            }
            RetryDecision::Exhausted => {
                report.exhausted += 1;
                warn!(transaction_id = %tx.id, attempts, "Retry budget exhausted");
                StatusChange::new(TransactionStatus::Failed, Actor::Reconciler).with_reason(
                    format!("gave up after {} attempts: {}", attempts, error),
                )
            }
        };
        if !self.settle(&tx.id.to_string(), tx.id, &change).await? {
            report.flagged += 1;
        }
        Ok(())
    }

    /// Asks the authority about records pushed longer ago than the
    /// reconciliation window.
    pub async fn pull_cycle(&self) -> StoreResult<PullReport> {
        let now = self.ledger.now();
        let cutoff = now
            .checked_sub_signed(to_chrono(self.settings.reconciliation_window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let (pending, flagged) = self.load_pending().await?;
        let mut report = PullReport {
            flagged,
            ..PullReport::default()
        };

        let stale: Vec<Transaction> = pending
            .into_iter()
            .filter(|tx| tx.sync.last_pushed_at.map_or(false, |at| at <= cutoff))
            .collect();

        for (organization_id, group) in group_by_organization(stale) {
            for chunk in group.chunks(self.settings.batch_size) {
                self.pull_chunk(organization_id, chunk, &mut report).await?;
            }
        }

        if self.review_due(now) {
            self.review_completed(now, &mut report).await?;
        }

        if report == PullReport::default() {
            return Ok(report);
        }
        info!(
            queried = report.queried,
            completed = report.completed,
            failed = report.failed,
            reversed = report.reversed,
            unknown = report.unknown,
            reviewed = report.reviewed,
            flagged = report.flagged,
            "Pull cycle finished"
        );
        Ok(report)
    }

    async fn pull_chunk(
        &self,
        organization_id: Uuid,
        chunk: &[Transaction],
        report: &mut PullReport,
    ) -> StoreResult<()> {
        let request = PullRequest {
            organization_id,
            ids: chunk.iter().map(|tx| tx.id).collect(),
        };
        report.queried += chunk.len();

        let response = match self.with_timeout(self.transport.pull(request)).await {
            Ok(response) => response,
            Err(e) => {
                warn!(organization_id = %organization_id, error = %e, "Pull failed");
                return Ok(());
            }
        };

        for snapshot in response.snapshots {
            let Some(tx) = chunk.iter().find(|tx| tx.id == snapshot.id) else {
                debug!(transaction_id = %snapshot.id, "Ignoring snapshot for unrequested id");
                continue;
            };
            let key = tx.id.to_string();

            let applied = match snapshot.state {
                AuthorityState::Completed { receipt_number } => {
                    report.completed += 1;
                    self.settle(&key, tx.id, &StatusChange::completed(receipt_number))
                        .await?
                }
                AuthorityState::Failed { reason } => {
                    report.failed += 1;
                    self.settle(&key, tx.id, &StatusChange::rejected(reason))
                        .await?
                }
                AuthorityState::Reversed { receipt_number } => {
                    report.reversed += 1;
                    let reversal =
                        StatusChange::new(TransactionStatus::Reversed, Actor::Administrator);
                    self.settle(&key, tx.id, &StatusChange::completed(receipt_number))
                        .await?
                        && self.settle(&key, tx.id, &reversal).await?
                }
                AuthorityState::Unknown => {
                    report.unknown += 1;
                    // Never reached the authority: make it due for the next push.
                    if tx.status == TransactionStatus::Syncing {
                        let change =
                            StatusChange::new(TransactionStatus::PendingLocal, Actor::Reconciler);
                        self.settle(&key, tx.id, &change).await?
                    } else {
                        true
                    }
                }
            };
            if !applied {
                report.flagged += 1;
            }
        }
        Ok(())
    }

    /// Claims the reversal review slot for this cycle if the interval has
    /// passed since the last one.
    fn review_due(&self, now: DateTime<Utc>) -> bool {
        let mut last = self
            .last_review
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let interval = to_chrono(self.settings.reversal_review_interval);
        let due = last.map_or(true, |at| {
            at.checked_add_signed(interval)
                .map_or(false, |next| next <= now)
        });
        if due {
            *last = Some(now);
        }
        due
    }

    /// Asks the authority about completed records inside the reversal horizon
    /// and applies any reversal it reports.
    async fn review_completed(
        &self,
        now: DateTime<Utc>,
        report: &mut PullReport,
    ) -> StoreResult<()> {
        let horizon = now
            .checked_sub_signed(to_chrono(self.settings.reversal_horizon))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let completed = match self.ledger.list(Some(TransactionStatus::Completed)).await {
            Ok(completed) => completed,
            Err(e) if e.is_record_scoped() => {
                warn!(error = %e, "Skipping reversal review");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let recent: Vec<Transaction> = completed
            .into_iter()
            .filter(|tx| tx.inspection_note.is_none() && tx.updated_at >= horizon)
            .collect();

        for (organization_id, group) in group_by_organization(recent) {
            for chunk in group.chunks(self.settings.batch_size) {
                self.review_chunk(organization_id, chunk, report).await?;
            }
        }
        Ok(())
    }

    async fn review_chunk(
        &self,
        organization_id: Uuid,
        chunk: &[Transaction],
        report: &mut PullReport,
    ) -> StoreResult<()> {
        let request = PullRequest {
            organization_id,
            ids: chunk.iter().map(|tx| tx.id).collect(),
        };
        report.reviewed += chunk.len();

        let response = match self.with_timeout(self.transport.pull(request)).await {
            Ok(response) => response,
            Err(e) => {
                warn!(organization_id = %organization_id, error = %e, "Reversal review failed");
                return Ok(());
            }
        };

        for snapshot in response.snapshots {
            let Some(tx) = chunk.iter().find(|tx| tx.id == snapshot.id) else {
                continue;
            };
            match snapshot.state {
                AuthorityState::Completed { .. } => {}
                AuthorityState::Reversed { receipt_number } => {
                    if tx.receipt_number != Some(receipt_number) {
                        let note = format!(
                            "authority reversed receipt {} but device holds {:?}",
                            receipt_number, tx.receipt_number
                        );
                        warn!(transaction_id = %tx.id, "{}", note);
                        self.flag(&tx.id.to_string(), &note).await;
                        report.flagged += 1;
                        continue;
                    }
                    let reversal =
                        StatusChange::new(TransactionStatus::Reversed, Actor::Administrator);
                    if self.settle(&tx.id.to_string(), tx.id, &reversal).await? {
                        report.reversed += 1;
                    } else {
                        report.flagged += 1;
                    }
                }
                AuthorityState::Failed { .. } | AuthorityState::Unknown => {
                    warn!(
                        transaction_id = %tx.id,
                        "Authority no longer reports a completed record as completed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Applies a change, flagging the record if only that record is at fault.
    /// Returns whether the change was applied.
    async fn settle(&self, key: &str, id: Uuid, change: &StatusChange) -> StoreResult<bool> {
        match self.ledger.apply(id, change).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_record_scoped() => {
                warn!(transaction_id = %id, error = %e, "Status update refused");
                self.flag(key, &e.to_string()).await;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn flag(&self, key: &str, note: &str) {
        if let Err(e) = self.ledger.flag_for_inspection(key, note).await {
            error!(key = %key, error = %e, "Failed to flag record for inspection");
        }
    }

    async fn with_timeout<T, F>(&self, call: F) -> Result<T, TransportError>
    where
        F: std::future::Future<Output = Result<T, TransportError>>,
    {
        match timeout(self.settings.push_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.settings.push_timeout)),
        }
    }

    /// One push cycle followed by one pull cycle.
    pub async fn run_once(&self) -> StoreResult<(PushReport, PullReport)> {
        let pushed = self.push_cycle().await?;
        let pulled = self.pull_cycle().await?;
        Ok((pushed, pulled))
    }

    /// Runs until `shutdown` flips to `true`. Cycles start on the poll timer
    /// and on [`SyncReconciler::wake`].
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            device_id = %self.ledger.device_id(),
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            "Sync reconciler started"
        );

        if let Err(e) = self.recover_in_flight().await {
            error!("In-flight recovery failed: {}", e);
        }

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.run_once().await {
                error!("Sync cycle error: {}", e);
            }
        }

        info!("Sync reconciler stopped");
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(5200))
}

/// Splits records by organization, keeping device-sequence order inside each
/// group and ordering groups by their first record.
fn group_by_organization(records: Vec<Transaction>) -> Vec<(Uuid, Vec<Transaction>)> {
    let mut groups: Vec<(Uuid, Vec<Transaction>)> = Vec::new();
    for tx in records {
        match groups.iter_mut().find(|(org, _)| *org == tx.organization_id) {
            Some((_, group)) => group.push(tx),
            None => groups.push((tx.organization_id, vec![tx])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CheckIn, Payload, TransactionDraft};

    fn record(organization_id: Uuid, sequence: i64) -> Transaction {
        let draft = TransactionDraft {
            organization_id,
            branch_id: Uuid::new_v4(),
            payload: Payload::CheckIn(CheckIn {
                member_id: "m-3".to_string(),
                service_id: "midweek".to_string(),
            }),
        };
        Transaction::new(Uuid::new_v4(), "kiosk-1".to_string(), sequence, draft, Utc::now())
    }

    #[test]
    fn test_grouping_keeps_sequence_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let records = vec![record(a, 1), record(b, 2), record(a, 3)];

        let groups = group_by_organization(records);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, a);
        let sequences: Vec<i64> = groups[0].1.iter().map(|tx| tx.device_sequence).collect();
        assert_eq!(sequences, vec![1, 3]);
        assert_eq!(groups[1].1[0].device_sequence, 2);
    }

    #[test]
    fn test_default_settings() {
        let settings = SyncSettings::default();
        assert_eq!(settings.batch_size, 50);
        assert_eq!(settings.push_timeout, Duration::from_secs(15));
        assert_eq!(settings.reconciliation_window, Duration::from_secs(120));
        assert_eq!(settings.reversal_review_interval, Duration::from_secs(3600));
    }
}
