use async_trait::async_trait;
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::ports::{AuthorityTransport, TransportError};
use crate::protocol::{PullRequest, PullResponse, PushRequest, PushResponse};

pub const PUSH_PATH: &str = "/v1/sync/push";
pub const PULL_PATH: &str = "/v1/sync/pull";

/// HTTP client for the authority's sync API
#[derive(Clone)]
pub struct HttpAuthorityTransport {
    client: Client,
    base_url: String,
    circuit_breaker: StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>,
}

impl HttpAuthorityTransport {
    /// Creates a transport with a 30 second request timeout and a breaker that
    /// opens after 3 consecutive failures
    pub fn new(base_url: String) -> Self {
        Self::with_circuit_breaker(base_url, Duration::from_secs(30), 3, 60)
    }

    /// Creates a transport with custom timeout and circuit breaker settings
    pub fn with_circuit_breaker(
        base_url: String,
        request_timeout: Duration,
        failure_threshold: u32,
        reset_timeout_secs: u64,
    ) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();

        let backoff = backoff::equal_jittered(
            Duration::from_secs(reset_timeout_secs),
            Duration::from_secs(reset_timeout_secs.saturating_mul(2)),
        );
        let policy = failure_policy::consecutive_failures(failure_threshold, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        HttpAuthorityTransport {
            client,
            base_url,
            circuit_breaker,
        }
    }

    /// Returns the current state of the circuit breaker
    pub fn circuit_state(&self) -> String {
        if self.circuit_breaker.is_call_permitted() {
            "closed".to_string()
        } else {
            "open".to_string()
        }
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, TransportError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let request = self.client.post(&url).json(body);

        let result = self
            .circuit_breaker
            .call(async move {
                let response = request.send().await?;
                let status = response.status();

                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    return Err(TransportError::Unavailable(format!(
                        "authority returned {}",
                        status
                    )));
                }
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(TransportError::Protocol(format!("{}: {}", status, body)));
                }

                Ok(response.json::<R>().await?)
            })
            .await;

        match result {
            Ok(body) => Ok(body),
            Err(FailsafeError::Rejected) => Err(TransportError::Unavailable(
                "authority circuit breaker is open".to_string(),
            )),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }
}

#[async_trait]
impl AuthorityTransport for HttpAuthorityTransport {
    async fn push(&self, request: PushRequest) -> Result<PushResponse, TransportError> {
        self.post(PUSH_PATH, &request).await
    }

    async fn pull(&self, request: PullRequest) -> Result<PullResponse, TransportError> {
        self.post(PULL_PATH, &request).await
    }
}
