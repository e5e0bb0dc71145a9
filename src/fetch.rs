//! Retrying HTTP fetcher.
//!
//! Wraps a single-request capability with bounded retry. Transport errors,
//! 5xx and 429 responses are retried with a doubling delay; everything else
//! is returned to the caller as-is. The wait between attempts races the
//! caller's cancellation token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Request, Response, StatusCode, Url};
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;

/// Performs exactly one HTTP request.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(&self, request: Request) -> Result<Response, reqwest::Error>;
}

#[async_trait]
impl HttpExecutor for reqwest::Client {
    async fn execute(&self, request: Request) -> Result<Response, reqwest::Error> {
        reqwest::Client::execute(self, request).await
    }
}

/// Retry bounds for the fetcher.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub min_delay: Duration,
    /// Upper bound for the doubling delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based). Never decreases.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        let ceiling = self.max_delay.max(self.min_delay);
        self.min_delay.saturating_mul(factor).min(ceiling)
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// HTTP client with bounded, cancellable retry.
#[derive(Clone)]
pub struct RetryingFetcher {
    executor: Arc<dyn HttpExecutor>,
    policy: RetryPolicy,
}

impl RetryingFetcher {
    pub fn new(executor: Arc<dyn HttpExecutor>, policy: RetryPolicy) -> Self {
        Self { executor, policy }
    }

    /// Fetcher backed by a default `reqwest::Client`.
    pub fn with_client(policy: RetryPolicy) -> Self {
        Self::new(Arc::new(reqwest::Client::new()), policy)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// GET `url` with retry.
    pub async fn get(&self, url: &str, cancel: &CancellationToken) -> Result<Response, FetchError> {
        let url = Url::parse(url).map_err(|e| FetchError::Build(format!("{url}: {e}")))?;
        self.execute(Request::new(Method::GET, url), cancel).await
    }

    /// Build a request from `builder` and send it with retry.
    pub async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<Response, FetchError> {
        let request = builder
            .build()
            .map_err(|e| FetchError::Build(e.to_string()))?;
        self.execute(request, cancel).await
    }

    /// Send `request`, retrying retryable outcomes.
    ///
    /// The request body must be replayable (bytes, not a stream); each
    /// attempt gets a byte-identical copy of the original.
    pub async fn execute(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response, FetchError> {
        if request.try_clone().is_none() {
            return Err(FetchError::BodyNotReplayable);
        }

        let attempts = self.policy.max_retries.saturating_add(1);
        let mut last_failure = String::new();

        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(FetchError::Canceled);
            }

            let Some(attempt_request) = request.try_clone() else {
                return Err(FetchError::BodyNotReplayable);
            };

            match self.executor.execute(attempt_request).await {
                Ok(response) if is_retryable_status(response.status()) => {
                    last_failure = format!("HTTP {}", response.status());
                    tracing::warn!(
                        url = %request.url(),
                        status = %response.status(),
                        attempt = attempt + 1,
                        "Retryable HTTP status"
                    );
                    // Dropping the response releases its connection.
                    drop(response);
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::warn!(
                        url = %request.url(),
                        attempt = attempt + 1,
                        "HTTP transport error: {}",
                        e
                    );
                    last_failure = e.to_string();
                }
            }

            if attempt + 1 < attempts {
                let delay = self.policy.delay_for(attempt);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FetchError::Canceled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(FetchError::RetriesExhausted {
            attempts,
            last: last_failure,
        })
    }
}
