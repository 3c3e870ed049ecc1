// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retry and backoff layer for outbound ASAP requests.
//!
//! Provides exponential backoff with jitter, `Retry-After` honoring for
//! HTTP 429 responses, and a classification of outcomes into retryable vs.
//! terminal.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::ClientError;

/// Configuration for the retry loop around a single outbound send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first. Must be >= 1.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Maximum delay cap for exponential backoff.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Whether to add `U[0, 0.1 * delay]` jitter to each backoff.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        val.as_millis().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms: u64 = u64::deserialize(de)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Whether an outcome should trigger another attempt, and how long to wait
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The outcome is terminal; stop retrying.
    Terminal,
    /// Retry using the computed exponential backoff.
    RetryBackoff,
    /// Retry after the given number of seconds (from a `Retry-After`
    /// header). Only numeric-seconds values are honored; anything else
    /// (an HTTP-date) falls back to exponential backoff.
    RetryAfter(u64),
}

/// Classify an HTTP status code for retry purposes.
pub fn classify_status(status: u16, retry_after_secs: Option<u64>) -> Classification {
    match status {
        200..=299 => Classification::Terminal,
        429 => match retry_after_secs {
            Some(secs) => Classification::RetryAfter(secs),
            None => Classification::RetryBackoff,
        },
        400..=499 => Classification::Terminal,
        500..=599 => Classification::RetryBackoff,
        _ => Classification::RetryBackoff,
    }
}

/// Compute the exponential backoff delay for a zero-indexed attempt.
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempt);
    let delay_ms = (config.base_delay.as_millis() as u64).saturating_mul(exp);
    let capped_ms = delay_ms.min(config.max_delay.as_millis() as u64);
    if config.jitter && capped_ms > 0 {
        let jitter_ms = rand::thread_rng().gen_range(0..=(capped_ms / 10).max(1));
        Duration::from_millis(capped_ms + jitter_ms)
    } else {
        Duration::from_millis(capped_ms)
    }
}

/// Outcome of a single attempt, as seen by the retry loop.
pub enum AttemptOutcome<T> {
    /// The attempt succeeded with this value.
    Success(T),
    /// The attempt failed; `retry_after_secs` is populated when the
    /// failure carried a numeric `Retry-After` header (HTTP 429 only).
    Failure {
        /// The error produced by this attempt.
        error: ClientError,
        /// HTTP status code, if the failure was an HTTP response.
        status: Option<u16>,
        /// Seconds to wait from a `Retry-After: <seconds>` header.
        retry_after_secs: Option<u64>,
    },
}

/// Run `op` up to `config.max_retries` times, applying the breaker via the
/// caller's `op` closure (the breaker's `can_attempt`/`record_*` calls
/// happen inside `op`, not here — this loop only owns backoff timing).
pub async fn retry_async<T, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T, ClientError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AttemptOutcome<T>>,
{
    let max_attempts = config.max_retries.max(1);
    let mut last_error: Option<ClientError> = None;

    for attempt in 0..max_attempts {
        match op(attempt).await {
            AttemptOutcome::Success(value) => return Ok(value),
            AttemptOutcome::Failure {
                error,
                status,
                retry_after_secs,
            } => {
                let classification = match status {
                    Some(s) => classify_status(s, retry_after_secs),
                    None => Classification::RetryBackoff,
                };

                let is_last = attempt + 1 >= max_attempts;
                if classification == Classification::Terminal || is_last {
                    warn!(
                        target: "asap::client::retry",
                        attempt,
                        error = %error,
                        "giving up"
                    );
                    return Err(error);
                }

                let delay = match classification {
                    Classification::RetryAfter(secs) => Duration::from_secs(secs),
                    _ => compute_delay(config, attempt),
                };
                debug!(
                    target: "asap::client::retry",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying after backoff"
                );
                last_error = Some(error);
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(last_error.unwrap_or_else(|| ClientError::Internal("retry loop exhausted".into())))
}

/// Measure elapsed wall-clock time for a retried operation; used by tests
/// asserting backoff actually occurred.
pub fn elapsed_since(start: Instant) -> Duration {
    start.elapsed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_success_is_terminal() {
        assert_eq!(classify_status(200, None), Classification::Terminal);
    }

    #[test]
    fn classify_4xx_is_terminal_except_429() {
        assert_eq!(classify_status(404, None), Classification::Terminal);
        assert_eq!(classify_status(400, None), Classification::Terminal);
    }

    #[test]
    fn classify_429_without_retry_after_backs_off() {
        assert_eq!(classify_status(429, None), Classification::RetryBackoff);
    }

    #[test]
    fn classify_429_with_retry_after_honors_it() {
        assert_eq!(classify_status(429, Some(5)), Classification::RetryAfter(5));
    }

    #[test]
    fn classify_5xx_retries() {
        assert_eq!(classify_status(503, None), Classification::RetryBackoff);
    }

    #[test]
    fn compute_delay_grows_exponentially_and_is_capped() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
        };
        assert_eq!(compute_delay(&config, 0), Duration::from_millis(100));
        assert_eq!(compute_delay(&config, 1), Duration::from_millis(200));
        assert_eq!(compute_delay(&config, 10), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn retry_async_returns_first_success() {
        let config = RetryConfig::default();
        let result: Result<u32, ClientError> =
            retry_async(&config, |_attempt| async { AttemptOutcome::Success(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retry_async_stops_on_terminal_4xx() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        };
        let mut calls = 0;
        let result: Result<u32, ClientError> = retry_async(&config, |_attempt| {
            calls += 1;
            async {
                AttemptOutcome::Failure {
                    error: ClientError::Remote("not found".into()),
                    status: Some(404),
                    retry_after_secs: None,
                }
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retry_async_exhausts_on_repeated_5xx() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        };
        let mut calls = 0;
        let result: Result<u32, ClientError> = retry_async(&config, |_attempt| {
            calls += 1;
            async {
                AttemptOutcome::Failure {
                    error: ClientError::Remote("unavailable".into()),
                    status: Some(503),
                    retry_after_secs: None,
                }
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }
}
