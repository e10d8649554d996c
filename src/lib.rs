pub mod adapters;
pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod middleware;
pub mod ports;
pub mod protocol;
pub mod services;
pub mod validation;

use axum::{Router, routing::{get, post}};
use std::sync::Arc;

use crate::adapters::http_transport::{PULL_PATH, PUSH_PATH};
use crate::services::ReceiptAllocator;

#[derive(Clone)]
pub struct AppState {
    pub allocator: Arc<ReceiptAllocator>,
}

/// Authority HTTP API.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(PUSH_PATH, post(handlers::sync::push))
        .route(PULL_PATH, post(handlers::sync::pull))
        .route(
            "/v1/organizations/:organization_id/transactions/:id/reverse",
            post(handlers::admin::reverse_transaction),
        )
        .route(
            "/v1/organizations/:organization_id/receipts",
            get(handlers::admin::list_receipts),
        )
        .layer(axum::middleware::from_fn(
            middleware::request_logger::request_logger_middleware,
        ))
        .with_state(state)
}
