pub mod admin;
pub mod sync;

use crate::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub ledger: String,
}

/// Reports whether the receipt ledger is reachable; 503 when it is not.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let ledger_ok = match state.allocator.health_check().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Ledger health check failed: {}", e);
            false
        }
    };

    let health_response = HealthStatus {
        status: if ledger_ok { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        ledger: if ledger_ok { "connected" } else { "disconnected" }.to_string(),
    };

    let status_code = if ledger_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health_response))
}
