// SPDX-License-Identifier: MIT OR Apache-2.0
//! Middleware stack for the ASAP dispatch server's HTTP API.

use axum::{
    extract::Request,
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RequestId middleware
// ---------------------------------------------------------------------------

/// A unique request identifier, available as an Axum extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

/// Axum middleware that generates a [`RequestId`] for each request and sets
/// the `X-Request-Id` response header.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    req.extensions_mut().insert(id);
    let mut resp = next.run(req).await;
    resp.headers_mut().insert(
        "x-request-id",
        HeaderValue::from_str(&id.0.to_string()).unwrap(),
    );
    resp
}

// ---------------------------------------------------------------------------
// RequestLogger
// ---------------------------------------------------------------------------

/// Axum middleware that logs method, path, status code, and duration for each
/// request using [`tracing`] structured fields.
pub struct RequestLogger;

impl RequestLogger {
    /// Axum-compatible handler function.
    pub async fn layer(req: Request, next: Next) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let start = Instant::now();

        let resp = next.run(req).await;

        let duration = start.elapsed();
        let status = resp.status().as_u16();

        info!(
            http.method = %method,
            http.path = %path,
            http.status = status,
            http.duration_ms = duration.as_millis() as u64,
            "request completed"
        );

        resp
    }
}

// ---------------------------------------------------------------------------
// KeyedRateLimiter
// ---------------------------------------------------------------------------

/// Per-client-key sliding-window rate limiting for `POST /asap`, keyed by
/// the caller's client key (sender URN, or an API-key header when present).
/// Bounded to `max_clients` distinct keys, evicting the oldest-inserted
/// entry on overflow — the same eviction policy used by the HTTP client's
/// peer registry and the webhook retry manager's token buckets.
pub struct KeyedRateLimiter {
    max_requests: u32,
    window: Duration,
    max_clients: usize,
    clients: Mutex<std::collections::BTreeMap<String, ClientWindow>>,
}

struct ClientWindow {
    timestamps: VecDeque<Instant>,
    inserted_at: Instant,
}

impl KeyedRateLimiter {
    /// Create a limiter that allows `max_requests` within `window` per
    /// distinct client key, tracking at most `max_clients` keys at once.
    pub fn new(max_requests: u32, window: Duration, max_clients: usize) -> Self {
        Self {
            max_requests,
            window,
            max_clients,
            clients: Mutex::new(std::collections::BTreeMap::new()),
        }
    }

    /// Check and record one request for `key`. Returns `Err(429)` if the
    /// client has exceeded its window.
    pub async fn check(&self, key: &str) -> Result<(), StatusCode> {
        let now = Instant::now();
        let mut clients = self.clients.lock().await;

        if !clients.contains_key(key) && clients.len() >= self.max_clients {
            if let Some(oldest) = clients
                .iter()
                .min_by_key(|(_, w)| w.inserted_at)
                .map(|(k, _)| k.clone())
            {
                clients.remove(&oldest);
            }
        }

        let window = clients.entry(key.to_string()).or_insert_with(|| ClientWindow {
            timestamps: VecDeque::new(),
            inserted_at: now,
        });

        while let Some(&front) = window.timestamps.front() {
            if now.duration_since(front) > self.window {
                window.timestamps.pop_front();
            } else {
                break;
            }
        }

        if window.timestamps.len() as u32 >= self.max_requests {
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }

        window.timestamps.push_back(now);
        Ok(())
    }
}
