// SPDX-License-Identifier: MIT OR Apache-2.0
//! A per-peer circuit breaker used by the ASAP client to stop hammering a
//! peer that is failing consistently.
//!
//! Three states: `Closed` (normal operation), `Open` (requests are
//! short-circuited), `HalfOpen` (a single probe request is allowed through
//! to decide whether to close again).

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Mutex;
use std::time::{Duration, Instant};

use asap_error::{AsapError, ErrorCode};

/// The circuit breaker's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow through normally.
    Closed,
    /// Requests are rejected without attempting the call.
    Open,
    /// A single probe request is allowed to test recovery.
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_permit_issued: bool,
}

/// Tracks consecutive failures to a single peer and decides whether to
/// allow, probe, or reject the next request.
///
/// Cheap to construct; one instance is kept per base URL by the client's
/// connection registry.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Build a breaker that opens after `threshold` consecutive failures
    /// and waits `timeout` before allowing a half-open probe.
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            threshold,
            timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_permit_issued: false,
            }),
        }
    }

    /// The breaker's current state, resolving an elapsed `Open` timeout to
    /// `HalfOpen` as a side effect.
    pub fn get_state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    /// Number of consecutive failures recorded since the last success.
    pub fn get_consecutive_failures(&self) -> u32 {
        self.inner.lock().unwrap().consecutive_failures
    }

    /// Whether a caller may attempt a request right now.
    ///
    /// In `HalfOpen`, only the first caller after the state transition gets
    /// `true`; concurrent callers are rejected until that probe resolves via
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn can_attempt(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.maybe_transition_to_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_permit_issued {
                    false
                } else {
                    inner.half_open_permit_issued = true;
                    true
                }
            }
        }
    }

    /// Record a successful call: resets the failure count and closes the
    /// circuit.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.half_open_permit_issued = false;
    }

    /// Record a failed call: increments the failure count and opens the
    /// circuit once `threshold` is reached.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.threshold {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.half_open_permit_issued = false;
        }
    }

    fn maybe_transition_to_half_open(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_permit_issued = false;
                }
            }
        }
    }
}

/// Raised when [`CircuitBreaker::can_attempt`] would return `false` and the
/// caller tries anyway.
#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit open for {base_url} ({consecutive_failures} consecutive failures)")]
pub struct CircuitOpenError {
    /// Base URL of the peer whose circuit is open.
    pub base_url: String,
    /// Number of consecutive failures that tripped the breaker.
    pub consecutive_failures: u32,
}

impl From<CircuitOpenError> for AsapError {
    fn from(err: CircuitOpenError) -> Self {
        AsapError::new(ErrorCode::CircuitOpen, err.to_string())
            .with_context("base_url", serde_json::json!(err.base_url))
            .with_context(
                "consecutive_failures",
                serde_json::json!(err.consecutive_failures),
            )
    }
}
