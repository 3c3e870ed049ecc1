// SPDX-License-Identifier: MIT OR Apache-2.0
//! Signed webhook delivery for ASAP event callbacks: SSRF-safe URL
//! validation, HMAC-SHA256 signing, and a retrying delivery manager with
//! per-URL rate limiting and a dead letter queue.
//!
//! Grounded in the distilled system's `asap.transport.webhook` module.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tokio::net::lookup_host;
use tracing::{debug, info, warn};

/// Header carrying the HMAC-SHA256 signature of the request body.
pub const SIGNATURE_HEADER: &str = "X-ASAP-Signature";

/// Default total timeout for a single webhook delivery attempt.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised validating or delivering a webhook.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The callback URL failed SSRF validation.
    #[error("webhook url '{url}' rejected: {reason}")]
    UrlRejected {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The HTTP request itself failed (network error, non-timeout).
    #[error("webhook delivery failed: {0}")]
    Transport(String),
}

impl From<WebhookError> for asap_error::AsapError {
    fn from(err: WebhookError) -> Self {
        use asap_error::{AsapError, ErrorCode};
        match err {
            WebhookError::UrlRejected { reason, .. } => AsapError::new(ErrorCode::InvalidSchema, reason),
            WebhookError::Transport(msg) => AsapError::new(ErrorCode::ConnectionRefused, msg),
        }
    }
}

/// Validate a webhook callback URL against SSRF rules: only `https` (or
/// `http` when `require_https` is false), a present hostname, no
/// private/loopback/link-local/reserved IP literal, and no hostname that
/// resolves (via DNS) to a blocked range — defeating DNS rebinding.
pub async fn validate_callback_url(url: &str, require_https: bool) -> Result<(), WebhookError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| WebhookError::UrlRejected {
        url: url.to_string(),
        reason: format!("unparseable URL: {e}"),
    })?;

    let allowed_schemes: &[&str] = if require_https { &["https"] } else { &["http", "https"] };
    if !allowed_schemes.contains(&parsed.scheme()) {
        return Err(WebhookError::UrlRejected {
            url: url.to_string(),
            reason: format!("scheme '{}' is not allowed (allowed: {})", parsed.scheme(), allowed_schemes.join(", ")),
        });
    }

    let Some(host) = parsed.host_str() else {
        return Err(WebhookError::UrlRejected {
            url: url.to_string(),
            reason: "URL must include a hostname".to_string(),
        });
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_ip_blocked(&ip) {
            return Err(WebhookError::UrlRejected {
                url: url.to_string(),
                reason: format!("host '{host}' is a blocked address range (private/loopback/link-local/reserved)"),
            });
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(443);
    let resolved: Vec<IpAddr> = lookup_host((host, port))
        .await
        .map_err(|e| WebhookError::UrlRejected {
            url: url.to_string(),
            reason: format!("DNS resolution failed for '{host}': {e}"),
        })?
        .map(|addr| addr.ip())
        .collect();

    for ip in &resolved {
        if is_ip_blocked(ip) {
            return Err(WebhookError::UrlRejected {
                url: url.to_string(),
                reason: format!("host '{host}' resolved to blocked address '{ip}'"),
            });
        }
    }

    debug!(url, ?resolved, "webhook.url_validated");
    Ok(())
}

fn is_ip_blocked(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_broadcast() || v4.is_documentation(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Canonicalize a JSON payload for signing: keys sorted, no insignificant
/// whitespace, matching the distilled system's `json.dumps(..., sort_keys=True,
/// separators=(",", ":"))`.
pub fn canonical_json(payload: &Value) -> Vec<u8> {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted: Vec<(String, Value)> = map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                sorted.sort_by(|a, b| a.0.cmp(&b.0));
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_vec(&sort(payload)).expect("Value always serializes")
}

/// HMAC-SHA256 of `body` with `secret`, formatted as `sha256=<hex>`.
pub fn compute_signature(body: &[u8], secret: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check that `signature` matches `compute_signature(body, secret)`.
pub fn verify_signature(body: &[u8], secret: &[u8], signature: &str) -> bool {
    let expected = compute_signature(body, secret);
    let (a, b) = (expected.as_bytes(), signature.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Outcome of a single webhook delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResult {
    /// The callback URL.
    pub url: String,
    /// HTTP status code, or 0 on transport failure/timeout.
    pub status_code: u16,
    /// Whether the status code was in `200..300`.
    pub success: bool,
    /// Wall-clock elapsed time for the attempt.
    pub elapsed_ms: f64,
    /// Error message, set only on failure.
    pub error: Option<String>,
}

/// Delivers signed webhook POSTs to SSRF-validated callback URLs.
pub struct WebhookDelivery {
    http: reqwest::Client,
    secret: Option<Vec<u8>>,
    require_https: bool,
}

impl WebhookDelivery {
    /// Build a delivery client. `secret`, if set, signs every request.
    /// `require_https` enforces HTTPS-only callback URLs.
    pub fn new(secret: Option<Vec<u8>>, require_https: bool, timeout: Duration) -> Result<Self, WebhookError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WebhookError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            secret,
            require_https,
        })
    }

    /// Validate `url` per [`validate_callback_url`].
    pub async fn validate_url(&self, url: &str) -> Result<(), WebhookError> {
        validate_callback_url(url, self.require_https).await
    }

    /// POST `payload` to `url`, signing it if a secret is configured.
    pub async fn deliver(
        &self,
        url: &str,
        payload: &Value,
        extra_headers: &HashMap<String, String>,
    ) -> Result<WebhookResult, WebhookError> {
        self.validate_url(url).await?;

        let body = canonical_json(payload);
        let mut request = self.http.post(url).header("Content-Type", "application/json");
        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, compute_signature(&body, secret));
        }
        for (key, value) in extra_headers {
            request = request.header(key, value);
        }

        let start = std::time::Instant::now();
        let result = request.body(body).send().await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(response) => {
                let status_code = response.status().as_u16();
                let success = response.status().is_success();
                info!(url, status_code, success, elapsed_ms, "webhook.delivered");
                Ok(WebhookResult {
                    url: url.to_string(),
                    status_code,
                    success,
                    elapsed_ms,
                    error: None,
                })
            }
            Err(e) if e.is_timeout() => {
                warn!(url, elapsed_ms, "webhook.timeout");
                Ok(WebhookResult {
                    url: url.to_string(),
                    status_code: 0,
                    success: false,
                    elapsed_ms,
                    error: Some(format!("timeout: {e}")),
                })
            }
            Err(e) => {
                warn!(url, error = %e, elapsed_ms, "webhook.delivery_failed");
                Ok(WebhookResult {
                    url: url.to_string(),
                    status_code: 0,
                    success: false,
                    elapsed_ms,
                    error: Some(e.to_string()),
                })
            }
        }
    }
}

/// Retry behaviour: max attempts, exponential backoff bounds, and the
/// per-URL delivery rate.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the first, before dead-lettering.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
    /// Maximum delay cap for exponential backoff.
    pub max_delay: Duration,
    /// Per-URL delivery rate (token bucket), tokens per second.
    pub rate_per_second: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            rate_per_second: 10.0,
        }
    }
}

impl RetryPolicy {
    /// `min(base_delay * 2^attempt, max_delay)`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        scaled.min(self.max_delay)
    }
}

/// A webhook delivery that exhausted all retries.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    /// The callback URL.
    pub url: String,
    /// The payload that could not be delivered.
    pub payload: Value,
    /// The final delivery attempt's result.
    pub last_result: WebhookResult,
    /// Total attempts made, including the first.
    pub attempts: u32,
    /// When the entry was dead-lettered.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

struct UrlTokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: std::time::Instant,
    inserted_at: std::time::Instant,
}

impl UrlTokenBucket {
    fn new(rate: f64) -> Self {
        let now = std::time::Instant::now();
        Self {
            rate,
            capacity: rate,
            tokens: rate,
            last_refill: now,
            inserted_at: now,
        }
    }

    fn refill(&mut self) {
        let now = std::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    fn consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn seconds_until_available(&mut self) -> f64 {
        self.refill();
        if self.tokens >= 1.0 {
            0.0
        } else {
            (1.0 - self.tokens) / self.rate
        }
    }
}

/// Callback invoked when an entry is permanently dead-lettered. Panics and
/// errors from the callback are caught and logged, never propagated.
pub type DeadLetterCallback =
    Box<dyn Fn(DeadLetterEntry) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wraps [`WebhookDelivery`] with retry, exponential backoff, per-URL rate
/// limiting (a token bucket per callback URL, evicting the oldest-inserted
/// bucket past a 10,000-URL cap), and a dead letter queue.
pub struct WebhookRetryManager {
    delivery: WebhookDelivery,
    policy: RetryPolicy,
    on_dead_letter: Option<DeadLetterCallback>,
    dead_letters: tokio::sync::Mutex<Vec<DeadLetterEntry>>,
    buckets: tokio::sync::Mutex<HashMap<String, UrlTokenBucket>>,
    max_buckets: usize,
}

const NON_RETRYABLE_STATUS: std::ops::Range<u16> = 400..500;

impl WebhookRetryManager {
    /// Wrap `delivery` with `policy`, optionally invoking `on_dead_letter`
    /// when an entry exhausts all retries.
    pub fn new(delivery: WebhookDelivery, policy: RetryPolicy, on_dead_letter: Option<DeadLetterCallback>) -> Self {
        Self {
            delivery,
            policy,
            on_dead_letter,
            dead_letters: tokio::sync::Mutex::new(Vec::new()),
            buckets: tokio::sync::Mutex::new(HashMap::new()),
            max_buckets: 10_000,
        }
    }

    /// Snapshot of all dead-lettered deliveries.
    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters.lock().await.clone()
    }

    /// Deliver `payload` to `url`, retrying on 5xx/timeout/network errors
    /// with exponential backoff; a 4xx response is never retried.
    pub async fn deliver_with_retry(
        &self,
        url: &str,
        payload: &Value,
        extra_headers: &HashMap<String, String>,
    ) -> Result<WebhookResult, WebhookError> {
        let mut last_result: Option<WebhookResult> = None;

        for attempt in 0..=self.policy.max_retries {
            self.wait_for_rate_limit(url).await;

            let result = self.delivery.deliver(url, payload, extra_headers).await?;
            if result.success {
                return Ok(result);
            }

            if NON_RETRYABLE_STATUS.contains(&result.status_code) {
                info!(url, status_code = result.status_code, attempt = attempt + 1, "webhook.retry.non_retryable");
                return Ok(result);
            }

            last_result = Some(result.clone());
            if attempt == self.policy.max_retries {
                break;
            }

            let delay = self.policy.backoff_delay(attempt);
            info!(
                url,
                attempt = attempt + 1,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                status_code = result.status_code,
                "webhook.retry.backoff"
            );
            tokio::time::sleep(delay).await;
        }

        let last_result = last_result.expect("at least one attempt was made");
        self.send_to_dead_letter(url, payload, last_result.clone()).await;
        Ok(last_result)
    }

    async fn wait_for_rate_limit(&self, url: &str) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                if !buckets.contains_key(url) && buckets.len() >= self.max_buckets {
                    if let Some(oldest) = buckets.iter().min_by_key(|(_, b)| b.inserted_at).map(|(k, _)| k.clone()) {
                        buckets.remove(&oldest);
                        debug!(evicted_url = oldest, capacity = self.max_buckets, "webhook.bucket_evicted");
                    }
                }
                let bucket = buckets
                    .entry(url.to_string())
                    .or_insert_with(|| UrlTokenBucket::new(self.policy.rate_per_second));
                if bucket.consume() {
                    None
                } else {
                    Some(bucket.seconds_until_available())
                }
            };
            match wait {
                None => return,
                Some(seconds) => {
                    debug!(url, wait_seconds = seconds, "webhook.rate_limit.waiting");
                    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                }
            }
        }
    }

    async fn send_to_dead_letter(&self, url: &str, payload: &Value, last_result: WebhookResult) {
        let entry = DeadLetterEntry {
            url: url.to_string(),
            payload: payload.clone(),
            last_result: last_result.clone(),
            attempts: self.policy.max_retries + 1,
            created_at: chrono::Utc::now(),
        };
        self.dead_letters.lock().await.push(entry.clone());
        warn!(
            url,
            attempts = entry.attempts,
            last_status_code = last_result.status_code,
            last_error = ?last_result.error,
            "webhook.dead_letter"
        );
        if let Some(callback) = &self.on_dead_letter {
            let fut = std::panic::AssertUnwindSafe(callback(entry));
            if futures::FutureExt::catch_unwind(fut).await.is_err() {
                warn!(url, "webhook.dead_letter.callback_error");
            }
        }
    }
}
