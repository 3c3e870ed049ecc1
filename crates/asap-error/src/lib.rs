//! Unified error taxonomy with stable error codes for the ASAP protocol.
//!
//! Every ASAP error carries an [`ErrorCode`] (a machine-readable, stable
//! `asap:<area>/<kind>` tag), a human-readable message, an optional cause
//! chain, and arbitrary key-value context. Use the builder returned by
//! [`AsapError::new`] to construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection, dispatch and delivery failures.
    Transport,
    /// Envelope shape/invariant failures.
    Envelope,
    /// Authentication and delegation failures.
    Auth,
    /// Storage-layer failures.
    Storage,
    /// Arbitrary failure surfaced by a remote peer.
    Remote,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transport => "transport",
            Self::Envelope => "envelope",
            Self::Auth => "auth",
            Self::Storage => "storage",
            Self::Remote => "remote",
        };
        f.write_str(s)
    }
}

impl ErrorCategory {
    /// The JSON-RPC 2.0 top-level error code most applicable to errors in
    /// this category when no more specific mapping is available at the call
    /// site. Envelope failures map to "invalid params", everything else not
    /// covered by a handler boundary defaults to "internal error".
    pub fn default_json_rpc_code(&self) -> i64 {
        match self {
            Self::Envelope => -32602,
            _ => -32603,
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serializes to its `asap:<area>/<kind>` wire form, the shape
/// carried in JSON-RPC `error.data.code` (see the protocol's error handling
/// design).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    // -- Transport --
    /// No handler registered for the envelope's `payload_type`.
    #[serde(rename = "asap:transport/handler_not_found")]
    HandlerNotFound,
    /// TCP/TLS connection to the peer was refused.
    #[serde(rename = "asap:transport/connection_refused")]
    ConnectionRefused,
    /// Read from the peer timed out.
    #[serde(rename = "asap:transport/read_timeout")]
    ReadTimeout,
    /// Circuit breaker denied the attempt.
    #[serde(rename = "asap:transport/circuit_open")]
    CircuitOpen,
    /// Webhook URL failed SSRF validation.
    #[serde(rename = "asap:transport/webhook_url_rejected")]
    WebhookUrlRejected,

    // -- Envelope --
    /// Envelope failed schema validation.
    #[serde(rename = "asap:envelope/invalid_schema")]
    InvalidSchema,
    /// Response-shaped envelope is missing `correlation_id`.
    #[serde(rename = "asap:envelope/missing_correlation_id")]
    MissingCorrelationId,
    /// `sender` does not match the expected identity for this channel.
    #[serde(rename = "asap:envelope/sender_mismatch")]
    SenderMismatch,
    /// Replay-protection nonce was invalid or already seen.
    #[serde(rename = "asap:envelope/nonce_invalid")]
    NonceInvalid,
    /// `timestamp` fell outside the acceptable clock-skew window.
    #[serde(rename = "asap:envelope/timestamp_out_of_window")]
    TimestampOutOfWindow,

    // -- Auth --
    /// Request required a bearer token and none was present.
    #[serde(rename = "asap:auth/missing_bearer")]
    MissingBearer,
    /// Delegation JWT failed signature or structural verification.
    #[serde(rename = "asap:auth/invalid_jwt")]
    InvalidJwt,
    /// Delegation JWT's `exp` has passed.
    #[serde(rename = "asap:auth/expired_token")]
    ExpiredToken,
    /// Delegation JWT's `jti` is in the revocation set.
    #[serde(rename = "asap:auth/revoked_token")]
    RevokedToken,
    /// Requested scope exceeds the token's granted scope.
    #[serde(rename = "asap:auth/scope_denied")]
    ScopeDenied,
    /// Manifest advertised an auth scheme this peer does not support.
    #[serde(rename = "asap:auth/unsupported_auth_scheme")]
    UnsupportedAuthScheme,

    // -- Storage --
    /// Requested key/version does not exist.
    #[serde(rename = "asap:storage/not_found")]
    NotFound,
    /// Write conflicted with an existing version.
    #[serde(rename = "asap:storage/version_conflict")]
    VersionConflict,
    /// Underlying I/O (filesystem, database) failure.
    #[serde(rename = "asap:storage/io_error")]
    IoError,

    // -- Remote --
    /// Arbitrary failure surfaced by a peer; the peer's own code and message
    /// are carried in the error's `context` map under `remote_code` /
    /// `remote_message`.
    #[serde(rename = "asap:remote/error")]
    RemoteError,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::HandlerNotFound
            | Self::ConnectionRefused
            | Self::ReadTimeout
            | Self::CircuitOpen
            | Self::WebhookUrlRejected => ErrorCategory::Transport,

            Self::InvalidSchema
            | Self::MissingCorrelationId
            | Self::SenderMismatch
            | Self::NonceInvalid
            | Self::TimestampOutOfWindow => ErrorCategory::Envelope,

            Self::MissingBearer
            | Self::InvalidJwt
            | Self::ExpiredToken
            | Self::RevokedToken
            | Self::ScopeDenied
            | Self::UnsupportedAuthScheme => ErrorCategory::Auth,

            Self::NotFound | Self::VersionConflict | Self::IoError => ErrorCategory::Storage,

            Self::RemoteError => ErrorCategory::Remote,
        }
    }

    /// Stable `&'static str` wire representation, e.g.
    /// `"asap:transport/handler_not_found"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HandlerNotFound => "asap:transport/handler_not_found",
            Self::ConnectionRefused => "asap:transport/connection_refused",
            Self::ReadTimeout => "asap:transport/read_timeout",
            Self::CircuitOpen => "asap:transport/circuit_open",
            Self::WebhookUrlRejected => "asap:transport/webhook_url_rejected",
            Self::InvalidSchema => "asap:envelope/invalid_schema",
            Self::MissingCorrelationId => "asap:envelope/missing_correlation_id",
            Self::SenderMismatch => "asap:envelope/sender_mismatch",
            Self::NonceInvalid => "asap:envelope/nonce_invalid",
            Self::TimestampOutOfWindow => "asap:envelope/timestamp_out_of_window",
            Self::MissingBearer => "asap:auth/missing_bearer",
            Self::InvalidJwt => "asap:auth/invalid_jwt",
            Self::ExpiredToken => "asap:auth/expired_token",
            Self::RevokedToken => "asap:auth/revoked_token",
            Self::ScopeDenied => "asap:auth/scope_denied",
            Self::UnsupportedAuthScheme => "asap:auth/unsupported_auth_scheme",
            Self::NotFound => "asap:storage/not_found",
            Self::VersionConflict => "asap:storage/version_conflict",
            Self::IoError => "asap:storage/io_error",
            Self::RemoteError => "asap:remote/error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AsapError
// ---------------------------------------------------------------------------

/// Unified ASAP error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use asap_error::{AsapError, ErrorCode};
///
/// let err = AsapError::new(ErrorCode::ReadTimeout, "timed out after 30s")
///     .with_context("base_url", "https://peer.example")
///     .with_context("timeout_ms", 30_000);
/// ```
pub struct AsapError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl AsapError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialization
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Build a `RemoteError` wrapping a peer's own `(code, message)` pair.
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        let remote_code = code.into();
        let remote_message = message.into();
        Self::new(ErrorCode::RemoteError, format!("remote error: {remote_message}"))
            .with_context("remote_code", &remote_code)
            .with_context("remote_message", &remote_message)
    }

    /// Render the `error.data` object for the JSON-RPC error response: the
    /// stable code plus the diagnostic context.
    pub fn data(&self) -> serde_json::Value {
        let mut map = self.context.clone();
        map.insert("code".to_string(), serde_json::json!(self.code.as_str()));
        map.insert("message".to_string(), serde_json::json!(self.message));
        serde_json::Value::Object(map.into_iter().collect())
    }

    /// Render `error.data` with context stripped — used when surfacing an
    /// opaque handler panic/exception as JSON-RPC `-32603`.
    pub fn sanitized_data(&self) -> serde_json::Value {
        serde_json::json!({ "code": self.code.as_str() })
    }
}

impl fmt::Debug for AsapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("AsapError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for AsapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for AsapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serializable snapshot of an [`AsapError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AsapErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&AsapError> for AsapErrorDto {
    fn from(err: &AsapError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<AsapErrorDto> for AsapError {
    fn from(dto: AsapErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
