//! HTTP(S) delivery of CloudEvents to trigger targets.
//!
//! The client owns the per-send retry loop: transport errors and
//! retryable statuses are retried according to the policy carried in the
//! request context, with the backoff delay computed per attempt. Explicit
//! rejections (non-retryable 4xx) are surfaced as NACK without further
//! attempts.

use std::time::Duration;

use async_trait::async_trait;
use cloudevents::binding::reqwest::{response_to_event, RequestBuilderExt};
use cloudevents::Event;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::shutdown::Shutdown;
use crate::types::BackoffPolicy;

/// Outcome of a delivery request, after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    /// The target accepted the event.
    Ack,
    /// The target received and rejected the event; retrying is pointless.
    Nack,
    /// The event never reached the target (transport failure or retryable
    /// errors exhausted).
    Undelivered,
}

/// Retry behavior attached to a single send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub policy: BackoffPolicy,
    pub delay: Duration,
    /// Retry attempts after the initial one.
    pub retries: u32,
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.policy {
            BackoffPolicy::Constant => self.delay,
            BackoffPolicy::Linear => self.delay.saturating_mul(attempt),
            BackoffPolicy::Exponential => self
                .delay
                .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1))),
        }
    }
}

/// Per-send state: where to deliver and how to retry. Never shared between
/// concurrent sends.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub target: String,
    pub retry: Option<RetryPolicy>,
}

impl DeliveryContext {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            retry: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Sends an event to a target, interpreting the response.
///
/// A trait so the dispatch path can be exercised in-process without a
/// network.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// Deliver `event` to `ctx.target`, retrying per `ctx.retry`. Returns
    /// the optional reply event carried by an accepting response.
    async fn request(&self, ctx: &DeliveryContext, event: Event) -> (Option<Event>, DeliveryResult);
}

/// Real HTTP delivery in CloudEvents binary mode.
pub struct HttpDeliveryClient {
    client: reqwest::Client,
    shutdown: Shutdown,
}

enum Attempt {
    Ack(Option<Event>),
    Nack,
    Retry(String),
}

impl HttpDeliveryClient {
    /// Default per-attempt timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(shutdown: Shutdown) -> Self {
        Self::with_timeout(shutdown, Self::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(shutdown: Shutdown, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client, shutdown }
    }

    async fn attempt(&self, target: &str, event: Event) -> Attempt {
        let request = match self.client.post(target).event(event) {
            Ok(request) => request,
            Err(e) => {
                // The event cannot be encoded; no retry will change that.
                warn!(target = %target, error = %e, "could not encode event for delivery");
                return Attempt::Nack;
            }
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Attempt::Retry(e.to_string()),
        };

        let status = response.status();
        if status.is_success() {
            let reply = if carries_event(&response) {
                response_to_event(response).await.ok()
            } else {
                None
            };
            return Attempt::Ack(reply);
        }

        if is_retryable_status(status) {
            Attempt::Retry(format!("HTTP {}", status))
        } else {
            Attempt::Nack
        }
    }
}

#[async_trait]
impl DeliveryClient for HttpDeliveryClient {
    async fn request(&self, ctx: &DeliveryContext, event: Event) -> (Option<Event>, DeliveryResult) {
        let attempts = 1 + ctx.retry.as_ref().map_or(0, |r| r.retries);

        for attempt in 1..=attempts {
            if attempt > 1 {
                // Only reachable with a retry policy attached.
                let delay = ctx
                    .retry
                    .as_ref()
                    .map_or(Duration::ZERO, |r| r.delay_for(attempt - 1));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.cancelled() => {
                        return (None, DeliveryResult::Undelivered);
                    }
                }
            }

            match self.attempt(&ctx.target, event.clone()).await {
                Attempt::Ack(reply) => return (reply, DeliveryResult::Ack),
                Attempt::Nack => return (None, DeliveryResult::Nack),
                Attempt::Retry(reason) => {
                    debug!(
                        target = %ctx.target,
                        attempt,
                        attempts,
                        reason = %reason,
                        "delivery attempt failed"
                    );
                }
            }
        }

        (None, DeliveryResult::Undelivered)
    }
}

/// Transient failures worth another attempt: server errors, request
/// timeout, rate limiting.
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Whether an accepting response carries a CloudEvent, in binary mode
/// (`ce-id` header) or structured mode (CloudEvents content type).
fn carries_event(response: &reqwest::Response) -> bool {
    if response.headers().contains_key("ce-id") {
        return true;
    }
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/cloudevents"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_backoff() {
        let policy = RetryPolicy {
            policy: BackoffPolicy::Constant,
            delay: Duration::from_secs(2),
            retries: 3,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy {
            policy: BackoffPolicy::Linear,
            delay: Duration::from_secs(2),
            retries: 3,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(6));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            policy: BackoffPolicy::Exponential,
            delay: Duration::from_secs(1),
            retries: 4,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
    }

    #[test]
    fn test_retryable_status_codes() {
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));

        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::CONFLICT));
    }
}
