//! Postgres implementation of the authority's receipt ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction as SqlxTransaction};
use uuid::Uuid;

use crate::domain::{check_transition, Actor, Payload, ReceiptNumber, TransactionStatus};
use crate::ports::{AuthorityError, AuthorityResult, LedgerEntry, ReceiptLedger, Recorded};
use crate::protocol::Submission;

const LEDGER_COLUMNS: &str = "id, organization_id, branch_id, device_id, device_sequence, payload, \
     recorded_at, status, receipt_number, rejection_reason, processed_at";

/// Postgres-backed receipt ledger.
#[derive(Clone)]
pub struct PostgresReceiptLedger {
    pool: PgPool,
    receipt_start: i64,
}

impl PostgresReceiptLedger {
    pub fn new(pool: PgPool) -> Self {
        Self::with_receipt_start(pool, 1)
    }

    /// `receipt_start` seeds the counter of organizations seen for the first time.
    pub fn with_receipt_start(pool: PgPool, receipt_start: u64) -> Self {
        Self {
            pool,
            receipt_start: i64::try_from(receipt_start.max(1)).unwrap_or(1),
        }
    }

    async fn find_one(
        executor: &mut SqlxTransaction<'_, Postgres>,
        id: Uuid,
    ) -> AuthorityResult<Option<LedgerEntry>> {
        let row = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {} FROM ledger_entries WHERE id = $1 FOR UPDATE",
            LEDGER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut **executor)
        .await?;

        row.map(LedgerRow::into_domain).transpose()
    }

    /// Takes the next value of the organization's counter. The row lock taken
    /// by the upsert serializes concurrent allocations until commit.
    async fn next_receipt(
        &self,
        executor: &mut SqlxTransaction<'_, Postgres>,
        organization_id: Uuid,
    ) -> AuthorityResult<ReceiptNumber> {
        let value: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO receipt_counters (organization_id, last_value) VALUES ($1, $2)
            ON CONFLICT (organization_id)
            DO UPDATE SET last_value = receipt_counters.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(organization_id)
        .bind(self.receipt_start)
        .fetch_one(&mut **executor)
        .await?;

        ReceiptNumber::from_db(value).ok_or(AuthorityError::Corrupt {
            id: organization_id,
            reason: format!("receipt counter at {}", value),
        })
    }

    async fn insert(
        &self,
        submission: &Submission,
        status: TransactionStatus,
        reason: Option<&str>,
    ) -> AuthorityResult<Recorded> {
        let mut tx = self.pool.begin().await?;

        if let Some(existing) = Self::find_one(&mut tx, submission.id).await? {
            tx.rollback().await?;
            return Ok(Recorded {
                entry: existing,
                inserted: false,
            });
        }

        let receipt_number = if status == TransactionStatus::Completed {
            Some(self.next_receipt(&mut tx, submission.organization_id).await?)
        } else {
            None
        };

        let inserted = sqlx::query_as::<_, LedgerRow>(&format!(
            r#"
            INSERT INTO ledger_entries (
                id, organization_id, branch_id, device_id, device_sequence, payload,
                recorded_at, status, receipt_number, rejection_reason
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            RETURNING {}
            "#,
            LEDGER_COLUMNS
        ))
        .bind(submission.id)
        .bind(submission.organization_id)
        .bind(submission.branch_id)
        .bind(&submission.device_id)
        .bind(submission.device_sequence)
        .bind(Json(&submission.payload))
        .bind(submission.recorded_at)
        .bind(status.as_str())
        .bind(receipt_number.map(ReceiptNumber::to_db))
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await?;

        match inserted {
            Some(row) => {
                let entry = row.into_domain()?;
                tx.commit().await?;
                Ok(Recorded {
                    entry,
                    inserted: true,
                })
            }
            None => {
                // A concurrent request stored the id first; dropping our
                // counter increment keeps the sequence gap-free.
                tx.rollback().await?;
                let existing = self
                    .find(&[submission.id])
                    .await?
                    .into_iter()
                    .next()
                    .ok_or(AuthorityError::NotFound(submission.id))?;
                Ok(Recorded {
                    entry: existing,
                    inserted: false,
                })
            }
        }
    }
}

#[async_trait]
impl ReceiptLedger for PostgresReceiptLedger {
    async fn find(&self, ids: &[Uuid]) -> AuthorityResult<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {} FROM ledger_entries WHERE id = ANY($1)",
            LEDGER_COLUMNS
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerRow::into_domain).collect()
    }

    async fn accept(&self, submission: &Submission) -> AuthorityResult<Recorded> {
        self.insert(submission, TransactionStatus::Completed, None)
            .await
    }

    async fn reject(&self, submission: &Submission, reason: &str) -> AuthorityResult<Recorded> {
        self.insert(submission, TransactionStatus::Failed, Some(reason))
            .await
    }

    async fn reverse(&self, organization_id: Uuid, id: Uuid) -> AuthorityResult<LedgerEntry> {
        let mut tx = self.pool.begin().await?;

        let entry = Self::find_one(&mut tx, id)
            .await?
            .filter(|entry| entry.submission.organization_id == organization_id)
            .ok_or(AuthorityError::NotFound(id))?;
        check_transition(entry.status, TransactionStatus::Reversed, Actor::Administrator)?;

        let row = sqlx::query_as::<_, LedgerRow>(&format!(
            "UPDATE ledger_entries SET status = $1, reversed_at = NOW() WHERE id = $2 RETURNING {}",
            LEDGER_COLUMNS
        ))
        .bind(TransactionStatus::Reversed.as_str())
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(transaction_id = %id, "Ledger entry reversed");
        row.into_domain()
    }

    async fn completed(&self, organization_id: Uuid) -> AuthorityResult<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {} FROM ledger_entries WHERE organization_id = $1 AND status = $2 \
             ORDER BY receipt_number ASC",
            LEDGER_COLUMNS
        ))
        .bind(organization_id)
        .bind(TransactionStatus::Completed.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerRow::into_domain).collect()
    }

    async fn health_check(&self) -> AuthorityResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Internal row type for SQLx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    id: Uuid,
    organization_id: Uuid,
    branch_id: Uuid,
    device_id: String,
    device_sequence: i64,
    payload: Json<Payload>,
    recorded_at: DateTime<Utc>,
    status: String,
    receipt_number: Option<i64>,
    rejection_reason: Option<String>,
    processed_at: DateTime<Utc>,
}

impl LedgerRow {
    fn into_domain(self) -> AuthorityResult<LedgerEntry> {
        let id = self.id;
        let status: TransactionStatus = self.status.parse().map_err(|e| AuthorityError::Corrupt {
            id,
            reason: format!("status: {}", e),
        })?;
        let receipt_number = match self.receipt_number {
            Some(raw) => Some(ReceiptNumber::from_db(raw).ok_or(AuthorityError::Corrupt {
                id,
                reason: format!("receipt_number: {}", raw),
            })?),
            None => None,
        };

        Ok(LedgerEntry {
            submission: Submission {
                id,
                device_id: self.device_id,
                device_sequence: self.device_sequence,
                organization_id: self.organization_id,
                branch_id: self.branch_id,
                payload: self.payload.0,
                recorded_at: self.recorded_at,
            },
            status,
            receipt_number,
            rejection_reason: self.rejection_reason,
            processed_at: self.processed_at,
        })
    }
}
