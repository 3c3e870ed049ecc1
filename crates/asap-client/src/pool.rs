// SPDX-License-Identifier: MIT OR Apache-2.0
//! Manifest caching and per-peer circuit breaker registry for the ASAP
//! client.
//!
//! The `reqwest::Client` handed to [`crate::AsapClient`] already maintains
//! its own keep-alive connection pool; what this module owns is the state
//! that sits *above* the transport: one [`asap_breaker::CircuitBreaker`]
//! per base URL, and a TTL'd manifest cache.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use asap_breaker::CircuitBreaker;
use asap_core::Manifest;
use serde::{Deserialize, Serialize};

/// Configuration for the manifest cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long a cached manifest remains valid.
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    /// Maximum distinct base URLs tracked; oldest entry is evicted past
    /// this, both for the manifest cache and the breaker registry.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            capacity: 100,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        val.as_secs().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let secs: u64 = u64::deserialize(de)?;
        Ok(Duration::from_secs(secs))
    }
}

struct CacheEntry {
    manifest: Manifest,
    expires_at: Instant,
    inserted_at: Instant,
}

/// Caches fetched manifests by URL and holds one [`CircuitBreaker`] per
/// base URL, both bounded to `capacity` with oldest-inserted eviction.
pub struct PeerRegistry {
    config: CacheConfig,
    manifests: Mutex<BTreeMap<String, CacheEntry>>,
    breakers: Mutex<BTreeMap<String, std::sync::Arc<CircuitBreaker>>>,
    breaker_threshold: u32,
    breaker_timeout: Duration,
}

impl PeerRegistry {
    /// Build a registry with the given cache configuration and breaker
    /// parameters (threshold, timeout) applied to every peer it tracks.
    pub fn new(config: CacheConfig, breaker_threshold: u32, breaker_timeout: Duration) -> Self {
        Self {
            config,
            manifests: Mutex::new(BTreeMap::new()),
            breakers: Mutex::new(BTreeMap::new()),
            breaker_threshold,
            breaker_timeout,
        }
    }

    /// Look up a non-expired cached manifest for `url`.
    pub fn get_manifest(&self, url: &str) -> Option<Manifest> {
        let mut cache = self.manifests.lock().unwrap();
        match cache.get(url) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.manifest.clone()),
            Some(_) => {
                cache.remove(url);
                None
            }
            None => None,
        }
    }

    /// Insert or refresh the cached manifest for `url`, evicting the
    /// oldest entry first if this insert would exceed `capacity`.
    pub fn put_manifest(&self, url: impl Into<String>, manifest: Manifest) {
        let mut cache = self.manifests.lock().unwrap();
        let url = url.into();
        if !cache.contains_key(&url) && cache.len() >= self.config.capacity {
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest);
            }
        }
        let now = Instant::now();
        cache.insert(
            url,
            CacheEntry {
                manifest,
                expires_at: now + self.config.ttl,
                inserted_at: now,
            },
        );
    }

    /// Number of manifests currently cached.
    pub fn manifest_cache_len(&self) -> usize {
        self.manifests.lock().unwrap().len()
    }

    /// Get or lazily create the circuit breaker tracking `base_url`.
    pub fn breaker_for(&self, base_url: &str) -> std::sync::Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        if let Some(existing) = breakers.get(base_url) {
            return std::sync::Arc::clone(existing);
        }
        if breakers.len() >= self.config.capacity {
            if let Some(oldest) = breakers.keys().next().cloned() {
                breakers.remove(&oldest);
            }
        }
        let breaker = std::sync::Arc::new(CircuitBreaker::new(
            self.breaker_threshold,
            self.breaker_timeout,
        ));
        breakers.insert(base_url.to_string(), std::sync::Arc::clone(&breaker));
        breaker
    }
}
