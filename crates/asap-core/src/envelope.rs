//! The Envelope data model: ASAP's on-wire message unit.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::{is_valid_urn, ulid};

/// Payload types that are responses and therefore require `correlation_id`.
const RESPONSE_PAYLOAD_TYPES: &[&str] = &["task.response", "mcp.tool_result", "mcp.resource_data"];

/// The atomic on-wire message: identity, routing, correlation and payload.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Envelope {
    /// ULID; auto-generated if absent at construction time.
    pub id: String,
    /// Protocol version this envelope was produced under.
    pub asap_version: String,
    /// UTC creation time; auto-generated if absent at construction time.
    pub timestamp: DateTime<Utc>,
    /// Sending agent's URN.
    pub sender: String,
    /// Receiving agent's URN.
    pub recipient: String,
    /// Tag discriminating the shape of `payload`.
    pub payload_type: String,
    /// Structured payload; shape determined by `payload_type`.
    pub payload: Value,
    /// Id of the envelope this one responds to. Required for response
    /// payload types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// 32-hex distributed tracing id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Open map for forward-compatible fields (span-id, nonce, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, Value>,
}

impl Envelope {
    /// Build a new envelope, auto-generating `id` and `timestamp`.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        payload_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: ulid::generate_id(),
            asap_version: crate::ASAP_VERSION.to_string(),
            timestamp: Utc::now(),
            sender: sender.into(),
            recipient: recipient.into(),
            payload_type: payload_type.into(),
            payload,
            correlation_id: None,
            trace_id: None,
            extensions: BTreeMap::new(),
        }
    }

    /// Build a response envelope correlated to `request`.
    pub fn respond_to(
        request: &Envelope,
        payload_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        let mut env = Self::new(
            request.recipient.clone(),
            request.sender.clone(),
            payload_type,
            payload,
        );
        env.correlation_id = Some(request.id.clone());
        env
    }

    /// True if this envelope's `payload_type` is one of the response
    /// variants that require `correlation_id`.
    pub fn is_response(&self) -> bool {
        RESPONSE_PAYLOAD_TYPES.contains(&self.payload_type.as_str())
    }
}

/// Validate envelope-level invariants (distinct from JSON-schema shape,
/// which `serde` already enforces on deserialization).
pub fn validate_envelope(envelope: &Envelope) -> Result<(), crate::CoreError> {
    if !ulid::is_valid_ulid(&envelope.id) {
        return Err(crate::CoreError::Validation(asap_error::AsapError::new(
            asap_error::ErrorCode::InvalidSchema,
            format!("envelope id '{}' is not a valid ULID", envelope.id),
        )));
    }

    if !is_valid_urn(&envelope.sender) {
        return Err(crate::CoreError::Validation(asap_error::AsapError::new(
            asap_error::ErrorCode::InvalidSchema,
            format!("sender '{}' is not a valid agent URN", envelope.sender),
        )));
    }

    if !is_valid_urn(&envelope.recipient) {
        return Err(crate::CoreError::Validation(asap_error::AsapError::new(
            asap_error::ErrorCode::InvalidSchema,
            format!("recipient '{}' is not a valid agent URN", envelope.recipient),
        )));
    }

    if envelope.is_response() && envelope.correlation_id.is_none() {
        return Err(crate::CoreError::Validation(asap_error::AsapError::new(
            asap_error::ErrorCode::MissingCorrelationId,
            format!(
                "payload_type '{}' requires correlation_id",
                envelope.payload_type
            ),
        )));
    }

    if let Some(trace_id) = &envelope.trace_id {
        let valid = trace_id.len() == 32 && trace_id.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            return Err(crate::CoreError::Validation(asap_error::AsapError::new(
                asap_error::ErrorCode::InvalidSchema,
                format!("trace_id '{trace_id}' must be 32 hex characters"),
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agent(name: &str) -> String {
        format!("urn:asap:agent:{name}")
    }

    #[test]
    fn new_envelope_has_generated_id_and_timestamp() {
        let env = Envelope::new(agent("a"), agent("b"), "task.request", json!({}));
        assert!(ulid::is_valid_ulid(&env.id));
        assert!(env.correlation_id.is_none());
    }

    #[test]
    fn respond_to_swaps_sender_recipient_and_sets_correlation() {
        let req = Envelope::new(agent("a"), agent("b"), "task.request", json!({}));
        let resp = Envelope::respond_to(&req, "task.response", json!({"status": "completed"}));
        assert_eq!(resp.sender, req.recipient);
        assert_eq!(resp.recipient, req.sender);
        assert_eq!(resp.correlation_id, Some(req.id));
    }

    #[test]
    fn round_trip_serialization_is_lossless() {
        let env = Envelope::new(agent("a"), agent("b"), "task.request", json!({"x": 1}));
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, env.id);
        assert_eq!(back.payload, env.payload);
    }

    #[test]
    fn validate_rejects_missing_correlation_on_response() {
        let mut env = Envelope::new(agent("a"), agent("b"), "task.response", json!({}));
        env.correlation_id = None;
        let err = validate_envelope(&env).unwrap_err();
        assert!(matches!(err, crate::CoreError::Validation(e) if e.code == asap_error::ErrorCode::MissingCorrelationId));
    }

    #[test]
    fn validate_accepts_response_with_correlation() {
        let req = Envelope::new(agent("a"), agent("b"), "task.request", json!({}));
        let resp = Envelope::respond_to(&req, "task.response", json!({}));
        assert!(validate_envelope(&resp).is_ok());
    }

    #[test]
    fn validate_rejects_bad_urn() {
        let env = Envelope::new("not-a-urn", agent("b"), "task.request", json!({}));
        assert!(validate_envelope(&env).is_err());
    }

    #[test]
    fn validate_rejects_bad_trace_id() {
        let mut env = Envelope::new(agent("a"), agent("b"), "task.request", json!({}));
        env.trace_id = Some("too-short".into());
        assert!(validate_envelope(&env).is_err());
    }

    #[test]
    fn validate_accepts_well_formed_trace_id() {
        let mut env = Envelope::new(agent("a"), agent("b"), "task.request", json!({}));
        env.trace_id = Some("a".repeat(32));
        assert!(validate_envelope(&env).is_ok());
    }
}
