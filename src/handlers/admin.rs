use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;
use uuid::Uuid;

use crate::AppState;
use crate::domain::ReceiptNumber;
use crate::error::AppError;
use crate::ports::LedgerEntry;

/// Row of the receipts report.
#[derive(Debug, Serialize)]
pub struct ReceiptLine {
    pub receipt: String,
    #[serde(flatten)]
    pub entry: LedgerEntry,
}

impl From<LedgerEntry> for ReceiptLine {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            receipt: entry
                .receipt_number
                .map(|r: ReceiptNumber| r.to_string())
                .unwrap_or_default(),
            entry,
        }
    }
}

pub async fn reverse_transaction(
    State(state): State<AppState>,
    Path((organization_id, id)): Path<(Uuid, Uuid)>,
) -> Result<Json<LedgerEntry>, AppError> {
    let entry = state.allocator.reverse(organization_id, id).await?;
    tracing::info!(
        organization_id = %organization_id,
        transaction_id = %id,
        "Transaction reversed by administrator"
    );
    Ok(Json(entry))
}

/// Completed entries of an organization ordered by receipt number.
pub async fn list_receipts(
    State(state): State<AppState>,
    Path(organization_id): Path<Uuid>,
) -> Result<Json<Vec<ReceiptLine>>, AppError> {
    let entries = state.allocator.completed_snapshot(organization_id).await?;
    Ok(Json(entries.into_iter().map(ReceiptLine::from).collect()))
}
