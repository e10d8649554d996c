use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::ports::AuthorityError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<AuthorityError> for AppError {
    fn from(e: AuthorityError) -> Self {
        match e {
            AuthorityError::Database(e) => AppError::Database(e),
            AuthorityError::BatchTooLarge { .. } | AuthorityError::OrganizationMismatch { .. } => {
                AppError::BadRequest(e.to_string())
            }
            AuthorityError::NotFound(id) => AppError::NotFound(format!("transaction {}", id)),
            AuthorityError::IllegalTransition(_) => AppError::Conflict(e.to_string()),
            AuthorityError::Migration(_) | AuthorityError::Corrupt { .. } => {
                AppError::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Actor, IllegalTransition, TransactionStatus};
    use uuid::Uuid;

    #[test]
    fn test_not_found_error_status_code() {
        let error = AppError::NotFound("Resource not found".to_string());
        assert_eq!(error.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_database_error_status_code() {
        let error = AppError::Database(sqlx::Error::RowNotFound);
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_batch_too_large_is_bad_request() {
        let error = AppError::from(AuthorityError::BatchTooLarge { size: 60, limit: 50 });
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_illegal_transition_is_conflict() {
        let error = AppError::from(AuthorityError::IllegalTransition(IllegalTransition {
            from: TransactionStatus::Failed,
            to: TransactionStatus::Reversed,
            actor: Actor::Administrator,
        }));
        assert_eq!(error.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_missing_entry_is_not_found() {
        let error = AppError::from(AuthorityError::NotFound(Uuid::new_v4()));
        assert_eq!(error.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_request_error_response() {
        let error = AppError::BadRequest("batch too large".to_string());
        let response = error.into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
