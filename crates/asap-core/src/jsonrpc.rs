//! JSON-RPC 2.0 framing for envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Envelope;

/// A JSON-RPC request id: either a string or a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String-typed id.
    Str(String),
    /// Number-typed id.
    Num(i64),
}

/// `{ envelope: Envelope }`, the params/result shape used on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeParams {
    /// The wrapped envelope.
    pub envelope: Envelope,
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Method name; ASAP only uses `"asap.send"`.
    pub method: String,
    /// Request parameters.
    pub params: EnvelopeParams,
    /// Correlates request and response.
    pub id: RequestId,
}

impl JsonRpcRequest {
    /// Wrap an envelope as an `asap.send` request with a fresh id.
    pub fn wrap(envelope: Envelope) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: "asap.send".to_string(),
            id: RequestId::Str(crate::ulid::generate_id()),
            params: EnvelopeParams { envelope },
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Standard or ASAP-custom numeric code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Structured error detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Standard JSON-RPC 2.0 code: malformed JSON.
pub const PARSE_ERROR: i64 = -32700;
/// Standard JSON-RPC 2.0 code: request shape is invalid.
pub const INVALID_REQUEST: i64 = -32600;
/// Standard JSON-RPC 2.0 code: params failed validation.
pub const INVALID_PARAMS: i64 = -32602;
/// Standard JSON-RPC 2.0 code: unexpected server-side failure.
pub const INTERNAL_ERROR: i64 = -32603;

/// A JSON-RPC 2.0 response: either success or error, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<EnvelopeParams>,
    /// Present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    /// Echoes the request id; `null` for parse errors with no recoverable
    /// id.
    pub id: Option<RequestId>,
}

impl JsonRpcResponse {
    /// Build a success response wrapping `envelope`.
    pub fn success(id: Option<RequestId>, envelope: Envelope) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(EnvelopeParams { envelope }),
            error: None,
            id,
        }
    }

    /// Build an error response.
    pub fn failure(id: Option<RequestId>, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
            id,
        }
    }

    /// Build an error response from an [`asap_error::AsapError`], mapping
    /// its category to the appropriate top-level JSON-RPC code and using
    /// `data()` as the error's structured detail.
    pub fn from_asap_error(id: Option<RequestId>, err: &asap_error::AsapError) -> Self {
        Self::failure(
            id,
            err.category().default_json_rpc_code(),
            err.message.clone(),
            Some(err.data()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_envelope() -> Envelope {
        Envelope::new(
            "urn:asap:agent:a",
            "urn:asap:agent:b",
            "task.request",
            json!({}),
        )
    }

    #[test]
    fn wrap_produces_asap_send_method() {
        let req = JsonRpcRequest::wrap(sample_envelope());
        assert_eq!(req.method, "asap.send");
        assert_eq!(req.jsonrpc, "2.0");
    }

    #[test]
    fn success_response_round_trips() {
        let resp = JsonRpcResponse::success(Some(RequestId::Str("r1".into())), sample_envelope());
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"result\""));
        assert!(!json.contains("\"error\""));
        let back: JsonRpcResponse = serde_json::from_str(&json).unwrap();
        assert!(back.result.is_some());
    }

    #[test]
    fn failure_response_omits_result() {
        let resp = JsonRpcResponse::failure(None, PARSE_ERROR, "bad json", None);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"error\""));
        assert!(!json.contains("\"result\""));
    }

    #[test]
    fn from_asap_error_maps_envelope_category_to_invalid_params() {
        let err = asap_error::AsapError::new(asap_error::ErrorCode::InvalidSchema, "bad shape");
        let resp = JsonRpcResponse::from_asap_error(None, &err);
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);
    }

    #[test]
    fn request_id_accepts_string_or_number() {
        let s: RequestId = serde_json::from_str("\"abc\"").unwrap();
        let n: RequestId = serde_json::from_str("42").unwrap();
        assert_eq!(s, RequestId::Str("abc".into()));
        assert_eq!(n, RequestId::Num(42));
    }
}
