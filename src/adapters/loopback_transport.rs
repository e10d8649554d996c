use async_trait::async_trait;
use std::sync::Arc;

use crate::ports::{AuthorityError, AuthorityTransport, TransportError};
use crate::protocol::{PullRequest, PullResponse, PushRequest, PushResponse};
use crate::services::ReceiptAllocator;

/// Talks to an allocator in the same process. Used when one binary hosts
/// both the device and the authority, and in tests.
#[derive(Clone)]
pub struct LoopbackTransport {
    allocator: Arc<ReceiptAllocator>,
}

impl LoopbackTransport {
    pub fn new(allocator: Arc<ReceiptAllocator>) -> Self {
        Self { allocator }
    }
}

fn into_transport_error(e: AuthorityError) -> TransportError {
    match e {
        AuthorityError::BatchTooLarge { .. } | AuthorityError::OrganizationMismatch { .. } => {
            TransportError::Protocol(e.to_string())
        }
        other => TransportError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl AuthorityTransport for LoopbackTransport {
    async fn push(&self, request: PushRequest) -> Result<PushResponse, TransportError> {
        self.allocator
            .push(request)
            .await
            .map_err(into_transport_error)
    }

    async fn pull(&self, request: PullRequest) -> Result<PullResponse, TransportError> {
        self.allocator
            .pull(request)
            .await
            .map_err(into_transport_error)
    }
}
