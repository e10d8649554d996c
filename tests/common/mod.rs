#![allow(dead_code)]

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::stream::BoxStream;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use parish_ledger::adapters::{InMemoryLedgerStore, InMemoryReceiptLedger, LoopbackTransport};
use parish_ledger::domain::{
    CheckIn, Donation, Payload, StatusChange, Transaction, TransactionDraft, TransactionStatus,
};
use parish_ledger::identity::Clock;
use parish_ledger::ports::{
    AuthorityTransport, LedgerStore, SequenceSource, StoreError, StoreResult, TransportError,
};
use parish_ledger::protocol::{PullRequest, PullResponse, PushRequest, PushResponse};
use parish_ledger::services::{
    DeviceLedger, ReceiptAllocator, RetryPolicy, SyncReconciler, SyncSettings,
};

/// Clock the test moves by hand.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 6, 2, 9, 0, 0).unwrap()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Transport wrapper that can go offline or lose acknowledgements.
pub struct FlakyTransport {
    inner: Arc<dyn AuthorityTransport>,
    /// Pushes refused before reaching the authority.
    offline_pushes: AtomicU32,
    /// Pushes the authority processes but whose response is lost.
    lost_acks: AtomicU32,
    pull_offline: AtomicU32,
    pub push_calls: AtomicU32,
    pub pull_calls: AtomicU32,
}

impl FlakyTransport {
    pub fn new(inner: Arc<dyn AuthorityTransport>) -> Self {
        Self {
            inner,
            offline_pushes: AtomicU32::new(0),
            lost_acks: AtomicU32::new(0),
            pull_offline: AtomicU32::new(0),
            push_calls: AtomicU32::new(0),
            pull_calls: AtomicU32::new(0),
        }
    }

    pub fn go_offline(&self, pushes: u32) {
        self.offline_pushes.store(pushes, Ordering::SeqCst);
    }

    pub fn lose_acks(&self, pushes: u32) {
        self.lost_acks.store(pushes, Ordering::SeqCst);
    }

    pub fn pull_offline(&self, pulls: u32) {
        self.pull_offline.store(pulls, Ordering::SeqCst);
    }

    pub fn pull_calls(&self) -> u32 {
        self.pull_calls.load(Ordering::SeqCst)
    }

    pub fn push_calls(&self) -> u32 {
        self.push_calls.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AuthorityTransport for FlakyTransport {
    async fn push(&self, request: PushRequest) -> Result<PushResponse, TransportError> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.offline_pushes) {
            return Err(TransportError::Unavailable("network unreachable".to_string()));
        }
        let response = self.inner.push(request).await?;
        if Self::take(&self.lost_acks) {
            return Err(TransportError::Unavailable("connection reset".to_string()));
        }
        Ok(response)
    }

    async fn pull(&self, request: PullRequest) -> Result<PullResponse, TransportError> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.pull_offline) {
            return Err(TransportError::Unavailable("network unreachable".to_string()));
        }
        self.inner.pull(request).await
    }
}

/// Transport whose calls never answer within any reasonable timeout.
pub struct StalledTransport {
    pub stall: std::time::Duration,
}

#[async_trait]
impl AuthorityTransport for StalledTransport {
    async fn push(&self, _request: PushRequest) -> Result<PushResponse, TransportError> {
        tokio::time::sleep(self.stall).await;
        Ok(PushResponse::default())
    }

    async fn pull(&self, _request: PullRequest) -> Result<PullResponse, TransportError> {
        tokio::time::sleep(self.stall).await;
        Ok(PullResponse::default())
    }
}

/// In-memory store whose status updates fail for chosen ids.
pub struct FaultyStore {
    inner: InMemoryLedgerStore,
    poisoned: Mutex<HashSet<Uuid>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryLedgerStore::new(),
            poisoned: Mutex::new(HashSet::new()),
        }
    }

    pub fn poison(&self, id: Uuid) {
        self.poisoned.lock().unwrap().insert(id);
    }

    pub fn heal(&self, id: Uuid) {
        self.poisoned.lock().unwrap().remove(&id);
    }
}

#[async_trait]
impl LedgerStore for FaultyStore {
    async fn append(&self, tx: &Transaction) -> StoreResult<()> {
        self.inner.append(tx).await
    }

    fn list_pending(&self) -> BoxStream<'_, StoreResult<Transaction>> {
        self.inner.list_pending()
    }

    async fn update_status(
        &self,
        id: Uuid,
        change: &StatusChange,
        now: DateTime<Utc>,
    ) -> StoreResult<Transaction> {
        if self.poisoned.lock().unwrap().contains(&id) {
            return Err(StoreError::Corrupt {
                key: id.to_string(),
                reason: "payload checksum mismatch".to_string(),
            });
        }
        self.inner.update_status(id, change, now).await
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Transaction>> {
        self.inner.get(id).await
    }

    async fn list(&self, status: Option<TransactionStatus>) -> StoreResult<Vec<Transaction>> {
        self.inner.list(status).await
    }

    async fn flag_for_inspection(&self, key: &str, note: &str) -> StoreResult<()> {
        self.inner.flag_for_inspection(key, note).await
    }

    async fn clear_inspection(&self, id: Uuid) -> StoreResult<Transaction> {
        self.inner.clear_inspection(id).await
    }
}

#[async_trait]
impl SequenceSource for FaultyStore {
    async fn next_sequence(&self, device_id: &str) -> StoreResult<i64> {
        self.inner.next_sequence(device_id).await
    }
}

pub fn test_retry() -> RetryPolicy {
    RetryPolicy::new(std::time::Duration::from_secs(1), 3, 3)
}

pub fn test_settings() -> SyncSettings {
    SyncSettings {
        batch_size: 50,
        push_timeout: std::time::Duration::from_secs(5),
        reconciliation_window: std::time::Duration::from_secs(60),
        poll_interval: std::time::Duration::from_secs(3600),
        reversal_review_interval: std::time::Duration::from_secs(3600),
        reversal_horizon: std::time::Duration::from_secs(30 * 24 * 3600),
    }
}

pub fn loopback(allocator: &Arc<ReceiptAllocator>) -> Arc<FlakyTransport> {
    Arc::new(FlakyTransport::new(Arc::new(LoopbackTransport::new(
        allocator.clone(),
    ))))
}

/// One device wired to an authority through a flaky loopback transport.
pub struct Device {
    pub clock: Arc<ManualClock>,
    pub ledger: Arc<DeviceLedger>,
    pub transport: Arc<FlakyTransport>,
    pub reconciler: Arc<SyncReconciler>,
}

impl Device {
    pub fn new(device_id: &str, allocator: &Arc<ReceiptAllocator>, retry: RetryPolicy) -> Self {
        Self::with_store(device_id, Arc::new(InMemoryLedgerStore::new()), allocator, retry)
    }

    pub fn with_store<S>(
        device_id: &str,
        store: Arc<S>,
        allocator: &Arc<ReceiptAllocator>,
        retry: RetryPolicy,
    ) -> Self
    where
        S: LedgerStore + SequenceSource + 'static,
    {
        let clock = Arc::new(ManualClock::new());
        let ledger = Arc::new(DeviceLedger::with_clock(store, device_id, clock.clone()));
        let transport = loopback(allocator);
        let reconciler = Arc::new(SyncReconciler::with_settings(
            ledger.clone(),
            transport.clone(),
            retry,
            test_settings(),
        ));
        Self {
            clock,
            ledger,
            transport,
            reconciler,
        }
    }

    pub async fn get(&self, id: Uuid) -> Transaction {
        self.ledger.get(id).await.unwrap().expect("transaction stored")
    }
}

pub fn allocator() -> Arc<ReceiptAllocator> {
    Arc::new(ReceiptAllocator::new(Arc::new(InMemoryReceiptLedger::new())))
}

pub fn donation(organization_id: Uuid, amount: i64) -> TransactionDraft {
    TransactionDraft {
        organization_id,
        branch_id: Uuid::new_v4(),
        payload: Payload::Donation(Donation {
            amount: BigDecimal::from(amount),
            currency: "NGN".to_string(),
            category: Some("offering".to_string()),
        }),
    }
}

pub fn check_in(organization_id: Uuid, member: &str) -> TransactionDraft {
    TransactionDraft {
        organization_id,
        branch_id: Uuid::new_v4(),
        payload: Payload::CheckIn(CheckIn {
            member_id: member.to_string(),
            service_id: "sunday-first-service".to_string(),
        }),
    }
}
