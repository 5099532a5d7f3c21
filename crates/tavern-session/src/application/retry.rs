//! Retry with exponential backoff for generation-service calls.

use async_trait::async_trait;
use serde_json::Value;
use tavern_core::command::ServiceKey;
use tavern_core::error::DomainError;
use tavern_core::service::{GenerationService, ServiceResponse, ServiceSettings};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::settings::RetryPolicy;

const RETRYABLE_MARKERS: &[&str] = &[
    "429",
    "408",
    "timeout",
    "timed out",
    "network",
    "connection",
    "rate limit",
];

fn mentions_server_error(message: &str) -> bool {
    message
        .split(|c: char| !c.is_ascii_digit())
        .any(|digits| digits.len() == 3 && digits.starts_with('5'))
}

/// Whether a failed call is worth repeating: a `ServiceUnavailable` whose
/// message points at a transient cause. Cancellation never is.
#[must_use]
pub fn is_retryable(error: &DomainError) -> bool {
    let DomainError::ServiceUnavailable(message) = error else {
        return false;
    };
    let message = message.to_lowercase();
    RETRYABLE_MARKERS.iter().any(|marker| message.contains(marker))
        || mentions_server_error(&message)
}

/// A generation service that retries transient failures of the service it
/// wraps. Backoff sleeps end early with `DomainError::Aborted` once the
/// call is cancelled.
pub struct RetryingService<'a> {
    inner: &'a dyn GenerationService,
    policy: &'a RetryPolicy,
}

impl<'a> RetryingService<'a> {
    /// Wraps a service.
    #[must_use]
    pub fn new(inner: &'a dyn GenerationService, policy: &'a RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl GenerationService for RetryingService<'_> {
    async fn invoke(
        &self,
        service: ServiceKey,
        input: &str,
        snapshot: &Value,
        settings: &ServiceSettings,
        cancel: &CancellationToken,
    ) -> Result<ServiceResponse, DomainError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let error = match self
                .inner
                .invoke(service, input, snapshot, settings, cancel)
                .await
            {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };
            if attempt >= max_attempts || !is_retryable(&error) || cancel.is_cancelled() {
                return Err(error);
            }
            let delay = self.policy.delay_for(attempt);
            warn!(
                service = %service,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "service call failed; retrying"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return Err(DomainError::Aborted),
            }
            attempt += 1;
        }
    }
}
