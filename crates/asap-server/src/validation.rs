// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request validation for the ASAP dispatch server.
//!
//! Layers two checks on top of [`asap_core::validate_envelope`]'s
//! structural invariants: a clock-skew window on `timestamp`, and
//! replay-protection on the `nonce` extension field.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use asap_core::Envelope;
use asap_error::{AsapError, ErrorCode};
use chrono::{DateTime, Utc};

/// Maximum number of nonces tracked before the oldest-inserted are evicted.
const MAX_TRACKED_NONCES: usize = 100_000;

/// Validates incoming envelopes: structural shape, clock skew, and replay
/// protection. One instance is shared across all connections handled by a
/// server process.
pub struct EnvelopeValidator {
    clock_skew: Duration,
    seen_nonces: Mutex<SeenNonces>,
}

struct SeenNonces {
    order: std::collections::VecDeque<String>,
    set: BTreeSet<String>,
}

impl Default for SeenNonces {
    fn default() -> Self {
        Self {
            order: std::collections::VecDeque::new(),
            set: BTreeSet::new(),
        }
    }
}

impl EnvelopeValidator {
    /// Build a validator with the given acceptable clock-skew window
    /// (applied symmetrically: `|now - envelope.timestamp| <= clock_skew`).
    pub fn new(clock_skew: Duration) -> Self {
        Self {
            clock_skew,
            seen_nonces: Mutex::new(SeenNonces::default()),
        }
    }

    /// Validate `envelope` against structural invariants, the clock-skew
    /// window, and nonce replay protection, at the given `now`.
    pub fn validate(&self, envelope: &Envelope, now: DateTime<Utc>) -> Result<(), AsapError> {
        asap_core::validate_envelope(envelope).map_err(Into::into)?;
        self.check_clock_skew(envelope, now)?;
        self.check_nonce(envelope)?;
        Ok(())
    }

    fn check_clock_skew(&self, envelope: &Envelope, now: DateTime<Utc>) -> Result<(), AsapError> {
        let skew = chrono::Duration::from_std(self.clock_skew).unwrap_or(chrono::Duration::zero());
        let delta = (now - envelope.timestamp).abs();
        if delta > skew {
            return Err(AsapError::new(
                ErrorCode::TimestampOutOfWindow,
                format!(
                    "envelope timestamp {} is outside the {:?} clock-skew window",
                    envelope.timestamp, self.clock_skew
                ),
            ));
        }
        Ok(())
    }

    fn check_nonce(&self, envelope: &Envelope) -> Result<(), AsapError> {
        let Some(nonce) = envelope.extensions.get("nonce").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        let mut guard = self.seen_nonces.lock().unwrap();
        if guard.set.contains(nonce) {
            return Err(AsapError::new(
                ErrorCode::NonceInvalid,
                format!("nonce '{nonce}' has already been used"),
            ));
        }
        if guard.order.len() >= MAX_TRACKED_NONCES {
            if let Some(oldest) = guard.order.pop_front() {
                guard.set.remove(&oldest);
            }
        }
        guard.order.push_back(nonce.to_string());
        guard.set.insert(nonce.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agent(name: &str) -> String {
        format!("urn:asap:agent:{name}")
    }

    fn envelope_at(ts: DateTime<Utc>) -> Envelope {
        let mut env = Envelope::new(agent("a"), agent("b"), "task.request", json!({}));
        env.timestamp = ts;
        env
    }

    #[test]
    fn accepts_envelope_within_skew_window() {
        let validator = EnvelopeValidator::new(Duration::from_secs(30));
        let now = Utc::now();
        let env = envelope_at(now - chrono::Duration::seconds(10));
        assert!(validator.validate(&env, now).is_ok());
    }

    #[test]
    fn rejects_envelope_outside_skew_window() {
        let validator = EnvelopeValidator::new(Duration::from_secs(30));
        let now = Utc::now();
        let env = envelope_at(now - chrono::Duration::seconds(90));
        let err = validator.validate(&env, now).unwrap_err();
        assert_eq!(err.code, ErrorCode::TimestampOutOfWindow);
    }

    #[test]
    fn rejects_duplicate_nonce() {
        let validator = EnvelopeValidator::new(Duration::from_secs(30));
        let now = Utc::now();
        let mut env = envelope_at(now);
        env.extensions.insert("nonce".into(), json!("n1"));
        assert!(validator.validate(&env, now).is_ok());
        let err = validator.validate(&env, now).unwrap_err();
        assert_eq!(err.code, ErrorCode::NonceInvalid);
    }

    #[test]
    fn distinct_nonces_are_both_accepted() {
        let validator = EnvelopeValidator::new(Duration::from_secs(30));
        let now = Utc::now();
        let mut a = envelope_at(now);
        a.extensions.insert("nonce".into(), json!("n1"));
        let mut b = envelope_at(now);
        b.extensions.insert("nonce".into(), json!("n2"));
        assert!(validator.validate(&a, now).is_ok());
        assert!(validator.validate(&b, now).is_ok());
    }

    #[test]
    fn envelope_without_nonce_is_not_tracked() {
        let validator = EnvelopeValidator::new(Duration::from_secs(30));
        let now = Utc::now();
        let env = envelope_at(now);
        assert!(validator.validate(&env, now).is_ok());
        assert!(validator.validate(&env, now).is_ok());
    }

    #[test]
    fn rejects_malformed_envelope() {
        let validator = EnvelopeValidator::new(Duration::from_secs(30));
        let now = Utc::now();
        let env = Envelope::new("not-a-urn", agent("b"), "task.request", json!({}));
        assert!(validator.validate(&env, now).is_err());
    }
}
