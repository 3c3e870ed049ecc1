// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP control-plane API types: the handler registry, the authorization
//! boundary, and shared server state.
//!
//! This module defines the request/response envelopes, resource
//! representations, and error types used by the dispatch server's REST
//! API.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use asap_core::{Envelope, Manifest};
use asap_error::{AsapError, ErrorCode};
use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{error, info};

// ---------------------------------------------------------------------------
// ApiError
// ---------------------------------------------------------------------------

/// HTTP-facing error returned by framing-level failures (never by handler
/// logic, which is always surfaced inside a 200 JSON-RPC body per the
/// protocol's error-handling design).
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status code.
    pub status: StatusCode,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    /// Build an error with the given status and message.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// 404 — resource not found.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// 400 — the request was malformed or invalid.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// 401 — missing or invalid bearer token.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    /// 403 — authenticated, but not authorized for this action.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    /// 500 — unexpected internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<AsapError> for ApiError {
    fn from(err: AsapError) -> Self {
        let status = match err.category() {
            asap_error::ErrorCategory::Storage if err.code == ErrorCode::NotFound => StatusCode::NOT_FOUND,
            asap_error::ErrorCategory::Auth => StatusCode::FORBIDDEN,
            asap_error::ErrorCategory::Envelope => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.message)
    }
}

// ---------------------------------------------------------------------------
// Authorization boundary (delegation <-> OAuth2)
// ---------------------------------------------------------------------------

/// The identity and granted scopes established by a verified bearer token.
#[derive(Debug, Clone)]
pub struct AuthenticatedPrincipal {
    /// The caller's agent URN.
    pub urn: String,
    /// Scopes the bearer token grants.
    pub scopes: Vec<String>,
}

/// Why a bearer token failed to authenticate.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No `Authorization: Bearer ...` header was present.
    #[error("missing bearer token")]
    MissingBearer,
    /// The token failed verification (expired, malformed, unknown issuer).
    #[error("invalid bearer token: {0}")]
    Invalid(String),
}

impl From<AuthError> for AsapError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingBearer => AsapError::new(ErrorCode::MissingBearer, "missing bearer token"),
            AuthError::Invalid(msg) => AsapError::new(ErrorCode::InvalidJwt, msg),
        }
    }
}

/// Validates OAuth2 bearer tokens. The server never implements token
/// validation itself — it is supplied by the embedding application (a
/// JWKS-backed implementation in production, a fake in tests). This is the
/// delegated-to-a-JWKS-fetcher-callback boundary.
#[async_trait]
pub trait BearerValidator: Send + Sync {
    /// Validate `token`, returning the principal it authenticates as.
    async fn validate(&self, token: &str) -> Result<AuthenticatedPrincipal, AuthError>;
}

/// A [`BearerValidator`] that accepts a fixed set of tokens, mapping each to
/// a principal. Useful for tests and local development; production
/// deployments supply a JWKS-backed implementation instead.
#[derive(Default)]
pub struct StaticBearerValidator {
    tokens: BTreeMap<String, AuthenticatedPrincipal>,
}

impl StaticBearerValidator {
    /// Build an empty validator; no token will authenticate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` as authenticating `principal`.
    pub fn with_token(mut self, token: impl Into<String>, principal: AuthenticatedPrincipal) -> Self {
        self.tokens.insert(token.into(), principal);
        self
    }
}

#[async_trait]
impl BearerValidator for StaticBearerValidator {
    async fn validate(&self, token: &str) -> Result<AuthenticatedPrincipal, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::Invalid("unrecognized token".into()))
    }
}

// ---------------------------------------------------------------------------
// Handler registry
// ---------------------------------------------------------------------------

/// Outcome of invoking a handler: a response envelope, or a failure that
/// the dispatcher turns into a JSON-RPC error.
pub type HandlerResult = Result<Envelope, AsapError>;

/// A boxed future returned by an async handler.
type BoxFuture<'a> = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>>;

/// A registered handler: either synchronous (invoked on a blocking-task
/// pool by [`HandlerRegistry::dispatch_async`]) or asynchronous.
pub enum Handler {
    /// Plain synchronous function; run off the main event scheduler.
    Sync(Arc<dyn Fn(Envelope, Arc<Manifest>) -> HandlerResult + Send + Sync>),
    /// Asynchronous function returning a future.
    Async(Arc<dyn Fn(Envelope, Arc<Manifest>) -> BoxFuture<'static> + Send + Sync>),
}

impl Clone for Handler {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(f) => Self::Sync(Arc::clone(f)),
            Self::Async(f) => Self::Async(Arc::clone(f)),
        }
    }
}

/// Maps `payload_type` to [`Handler`]s. A single reentrant-by-design mutex
/// guards the map; lookup happens under lock, execution happens outside it,
/// so concurrent dispatches never block each other or re-enter the lock.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Arc<Mutex<BTreeMap<String, Handler>>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// Build an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Register `handler` for `payload_type`, overwriting any existing
    /// registration.
    pub fn register(&self, payload_type: impl Into<String>, handler: Handler) {
        let payload_type = payload_type.into();
        self.handlers.lock().unwrap().insert(payload_type.clone(), handler);
        info!(payload_type = %payload_type, "asap.handler.registered");
    }

    /// Return a snapshot of registered payload types. Never a live view.
    pub fn list_handlers(&self) -> Vec<String> {
        self.handlers.lock().unwrap().keys().cloned().collect()
    }

    fn lookup(&self, payload_type: &str) -> Option<Handler> {
        self.handlers.lock().unwrap().get(payload_type).cloned()
    }

    /// Dispatch `envelope` to its registered handler. Only synchronous
    /// handlers are supported; registering an async handler and calling
    /// this method returns a `handler_not_found`-shaped error instead of
    /// silently dropping the future.
    pub fn dispatch(&self, envelope: Envelope, manifest: Arc<Manifest>) -> HandlerResult {
        let payload_type = envelope.payload_type.clone();
        let envelope_id = envelope.id.clone();
        info!(payload_type = %payload_type, envelope_id = %envelope_id, "asap.handler.dispatch");
        let start = std::time::Instant::now();

        let Some(handler) = self.lookup(&payload_type) else {
            info!(payload_type = %payload_type, "asap.handler.not_found");
            return Err(AsapError::new(
                ErrorCode::HandlerNotFound,
                format!("no handler registered for payload_type '{payload_type}'"),
            ));
        };

        let result = match handler {
            Handler::Sync(f) => f(envelope, manifest),
            Handler::Async(_) => Err(AsapError::new(
                ErrorCode::HandlerNotFound,
                format!("handler for '{payload_type}' is async; use dispatch_async"),
            )),
        };

        match &result {
            Ok(_) => info!(
                payload_type = %payload_type,
                envelope_id = %envelope_id,
                duration_ms = start.elapsed().as_millis() as u64,
                "asap.handler.completed"
            ),
            Err(err) => error!(
                payload_type = %payload_type,
                envelope_id = %envelope_id,
                error = %err,
                "asap.handler.error"
            ),
        }
        result
    }

    /// Dispatch `envelope`, supporting both handler kinds. Synchronous
    /// handlers run on a `tokio::task::spawn_blocking` pool so a slow
    /// handler never blocks the event loop serving other connections.
    pub async fn dispatch_async(&self, envelope: Envelope, manifest: Arc<Manifest>) -> HandlerResult {
        let payload_type = envelope.payload_type.clone();
        let envelope_id = envelope.id.clone();
        info!(payload_type = %payload_type, envelope_id = %envelope_id, "asap.handler.dispatch");
        let start = std::time::Instant::now();

        let Some(handler) = self.lookup(&payload_type) else {
            info!(payload_type = %payload_type, "asap.handler.not_found");
            return Err(AsapError::new(
                ErrorCode::HandlerNotFound,
                format!("no handler registered for payload_type '{payload_type}'"),
            ));
        };

        let result = match handler {
            Handler::Sync(f) => {
                tokio::task::spawn_blocking(move || f(envelope, manifest))
                    .await
                    .unwrap_or_else(|join_err| {
                        Err(AsapError::new(ErrorCode::HandlerNotFound, join_err.to_string()))
                    })
            }
            Handler::Async(f) => f(envelope, manifest).await,
        };

        match &result {
            Ok(_) => info!(
                payload_type = %payload_type,
                envelope_id = %envelope_id,
                duration_ms = start.elapsed().as_millis() as u64,
                "asap.handler.completed"
            ),
            Err(err) => error!(
                payload_type = %payload_type,
                envelope_id = %envelope_id,
                error = %err,
                "asap.handler.error"
            ),
        }
        result
    }
}

/// Build the built-in `echo` handler for `task.request`: mirrors the
/// request's `input` field back as
/// `TaskResponse { status: completed, result: {echoed: input} }`. Useful as
/// a smoke-test handler and in integration tests.
pub fn echo_handler() -> Handler {
    Handler::Sync(Arc::new(|envelope: Envelope, _manifest: Arc<Manifest>| {
        let input = envelope.payload.get("input").cloned().unwrap_or(serde_json::Value::Null);
        let response_payload = json!({
            "status": "completed",
            "result": { "echoed": input },
        });
        Ok(Envelope::respond_to(&envelope, "task.response", response_payload))
    }))
}
