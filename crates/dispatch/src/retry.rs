//! Exponential-backoff retry for worker dispatch.
//!
//! A dispatch is attempted once, then retried up to
//! [`RetryPolicy::max_retries`] more times while the error is retryable.
//! When every attempt fails the last error is returned and the caller
//! treats the unit as lost.

use std::time::Duration;

use renderhub_core::envelope::DispatchEnvelope;
use renderhub_core::worker_registry::WorkerEndpoint;

use crate::client::{DispatchError, WorkerClient};

/// Tunable parameters for dispatch retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and policy.
///
/// The result is clamped to [`RetryPolicy::max_delay`].
pub fn next_delay(current: Duration, policy: &RetryPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.multiplier) as u64;
    Duration::from_millis(next_ms).min(policy.max_delay)
}

/// Send `envelope` to `endpoint`, retrying with backoff.
pub async fn send_with_retry(
    client: &dyn WorkerClient,
    endpoint: &WorkerEndpoint,
    envelope: &DispatchEnvelope,
    policy: &RetryPolicy,
) -> Result<(), DispatchError> {
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match client.send(endpoint, envelope).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if attempt > policy.max_retries || !err.is_retryable() {
            tracing::error!(
                worker_id = %endpoint.id,
                session_id = %envelope.session_id,
                index = envelope.index,
                attempt,
                error = %err,
                "Dispatch failed, giving up",
            );
            return Err(err);
        }

        tracing::warn!(
            worker_id = %endpoint.id,
            session_id = %envelope.session_id,
            index = envelope.index,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Dispatch attempt failed, retrying",
        );
        tokio::time::sleep(delay).await;
        delay = next_delay(delay, policy);
    }
}
