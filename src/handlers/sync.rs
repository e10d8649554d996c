use axum::{Json, extract::State};

use crate::AppState;
use crate::error::AppError;
use crate::protocol::{PullRequest, PullResponse, PushRequest, PushResponse};

/// Judges a batch of device submissions. One outcome per submission, keyed
/// by transaction id.
pub async fn push(
    State(state): State<AppState>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>, AppError> {
    tracing::debug!(
        device_id = %request.device_id,
        organization_id = %request.organization_id,
        batch_size = request.transactions.len(),
        "Push received"
    );
    let response = state.allocator.push(request).await?;
    Ok(Json(response))
}

pub async fn pull(
    State(state): State<AppState>,
    Json(request): Json<PullRequest>,
) -> Result<Json<PullResponse>, AppError> {
    let response = state.allocator.pull(request).await?;
    Ok(Json(response))
}
