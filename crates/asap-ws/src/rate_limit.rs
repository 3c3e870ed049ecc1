// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-remote-URL token bucket rate limiting for outbound sends.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A single token bucket, refilled continuously at `rate` tokens/second up
/// to `capacity`.
pub(crate) struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    inserted_at: Instant,
}

impl TokenBucket {
    pub(crate) fn new(rate: f64) -> Self {
        let now = Instant::now();
        Self {
            rate,
            capacity: rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: now,
                inserted_at: now,
            }),
        }
    }

    fn try_consume(&self) -> Option<Duration> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            None
        } else {
            Some(Duration::from_secs_f64((1.0 - state.tokens) / self.rate))
        }
    }

    fn inserted_at(&self) -> Instant {
        self.state.lock().unwrap().inserted_at
    }

    /// Block until a token is available.
    pub(crate) async fn acquire(&self) {
        while let Some(wait) = self.try_consume() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Configuration for [`RateLimitRegistry`].
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    /// Tokens per second granted to each tracked URL.
    pub rate_per_second: f64,
    /// Maximum distinct URLs tracked; oldest-inserted is evicted past this.
    pub capacity: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate_per_second: 50.0,
            capacity: 10_000,
        }
    }
}

/// A registry of per-URL token buckets, bounded to `capacity` with
/// oldest-inserted eviction, matching the client-side manifest/breaker
/// caches' eviction policy.
pub struct RateLimitRegistry {
    config: RateLimiterConfig,
    buckets: Mutex<BTreeMap<String, std::sync::Arc<TokenBucket>>>,
}

impl RateLimitRegistry {
    /// Build a registry with the given configuration.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Block until a token is available for `url`, creating its bucket on
    /// first use.
    pub async fn acquire(&self, url: &str) {
        let bucket = {
            let mut buckets = self.buckets.lock().unwrap();
            if let Some(existing) = buckets.get(url) {
                std::sync::Arc::clone(existing)
            } else {
                if buckets.len() >= self.config.capacity {
                    if let Some(oldest) = buckets.iter().min_by_key(|(_, b)| b.inserted_at()).map(|(k, _)| k.clone()) {
                        buckets.remove(&oldest);
                    }
                }
                let bucket = std::sync::Arc::new(TokenBucket::new(self.config.rate_per_second));
                buckets.insert(url.to_string(), std::sync::Arc::clone(&bucket));
                bucket
            }
        };
        bucket.acquire().await;
    }

    /// Number of URLs currently tracked.
    pub fn len(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }

    /// Whether no URLs are tracked yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
