// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! HTTP dispatch server for the ASAP agent-to-agent protocol: JSON-RPC
//! envelope delivery, manifest publication, Prometheus metrics, and the
//! delegation issuance/revocation API.

/// HTTP control-plane API types: handler registry, auth boundary, errors.
pub mod api;
/// Middleware stack: request id, structured logging, per-client rate limiting.
pub mod middleware;
/// Request validation: envelope invariants, clock skew, nonce replay.
pub mod validation;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use asap_core::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use asap_core::{jsonrpc, Envelope, Manifest};
use asap_delegation::{DelegationClaims, DelegationSigner, DelegationStorage, Ed25519Keys};
use asap_error::{AsapError, ErrorCode};
use asap_storage::{MeteringStore, SnapshotStore};
use asap_telemetry::{Counter, Histogram, Registry as MetricsRegistry};
use axum::body::Bytes;
use axum::extract::{Path as AxPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};

pub use api::{
    echo_handler, ApiError, AuthError, AuthenticatedPrincipal, BearerValidator, Handler,
    HandlerRegistry, StaticBearerValidator,
};
pub use validation::EnvelopeValidator;

/// Resolves an Ed25519 keypair for a delegator URN, backing both token
/// issuance (the private half) and verification (the public half, via
/// [`asap_delegation::token::PublicKeyResolver`]).
pub trait DelegationKeyStore: asap_delegation::token::PublicKeyResolver {
    /// Build a [`DelegationSigner`] for `delegator_urn`, if this store holds
    /// a keypair for it.
    fn signer_for(&self, delegator_urn: &str) -> Option<DelegationSigner>;
}

/// An in-memory [`DelegationKeyStore`] holding one Ed25519 keypair per
/// delegator URN. Suitable for single-process deployments and tests; a
/// production deployment may back this with a KMS-backed store instead.
#[derive(Default)]
pub struct InMemoryKeyStore {
    keys: BTreeMap<String, Arc<Ed25519Keys>>,
}

impl InMemoryKeyStore {
    /// Build an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate and register a fresh keypair for `delegator_urn`.
    pub fn generate_for(&mut self, delegator_urn: impl Into<String>) -> Result<(), asap_delegation::DelegationError> {
        let keys = Ed25519Keys::generate()?;
        self.keys.insert(delegator_urn.into(), Arc::new(keys));
        Ok(())
    }
}

impl asap_delegation::token::PublicKeyResolver for InMemoryKeyStore {
    fn public_key_for(&self, delegator_urn: &str) -> Option<Vec<u8>> {
        self.keys.get(delegator_urn).map(|k| k.public_key_der().to_vec())
    }
}

impl DelegationKeyStore for InMemoryKeyStore {
    fn signer_for(&self, delegator_urn: &str) -> Option<DelegationSigner> {
        self.keys
            .get(delegator_urn)
            .map(|keys| DelegationSigner::new(delegator_urn, keys))
    }
}

/// Delegation-related state, present only when a key-store is configured
/// (see §4.4: the delegation endpoints are only mounted in that case).
pub struct DelegationState {
    /// Issued-token and revocation storage.
    pub storage: Arc<dyn DelegationStorage>,
    /// Resolves signing/verification keys per delegator.
    pub keys: Arc<dyn DelegationKeyStore>,
    /// Validates the OAuth2 bearer presented by callers.
    pub bearer: Arc<dyn BearerValidator>,
}

/// Observability counters/histograms the server itself emits, registered
/// once at startup against the shared [`MetricsRegistry`].
struct ServerMetrics {
    requests_total: Counter,
    request_duration_ms: Histogram,
}

impl ServerMetrics {
    fn register(registry: &MetricsRegistry) -> Self {
        let labels = BTreeMap::new();
        Self {
            requests_total: registry.counter(
                "asap_requests_total",
                "Total number of POST /asap requests handled.",
                labels.clone(),
            ),
            request_duration_ms: registry.histogram(
                "asap_request_duration_ms",
                "Duration of POST /asap request handling, in milliseconds.",
                labels,
                asap_telemetry::DEFAULT_BUCKETS,
            ),
        }
    }
}

/// Shared, cloneable state for every route in [`build_app`].
pub struct AppState {
    /// This server's self-description.
    pub manifest: Arc<Manifest>,
    /// Maps `payload_type` to handlers.
    pub registry: HandlerRegistry,
    /// Prometheus metrics registry backing `GET /asap/metrics`.
    pub metrics: Arc<MetricsRegistry>,
    /// Envelope structural/clock-skew/nonce validation.
    pub validator: Arc<EnvelopeValidator>,
    /// Per-client-key rate limiter for `POST /asap`.
    pub rate_limiter: Arc<middleware::KeyedRateLimiter>,
    /// Task-state snapshot store, available to handlers via `AppState`.
    pub snapshots: Arc<dyn SnapshotStore>,
    /// Usage metering store, available to handlers via `AppState`.
    pub metering: Arc<dyn MeteringStore>,
    /// Delegation issuance/revocation, present only when configured.
    pub delegation: Option<DelegationState>,
    metrics_internal: ServerMetrics,
}

impl AppState {
    /// Build server state. `delegation` is `None` unless the embedding
    /// application supplies both a key store and a bearer validator.
    pub fn new(
        manifest: Manifest,
        snapshots: Arc<dyn SnapshotStore>,
        metering: Arc<dyn MeteringStore>,
        delegation: Option<DelegationState>,
    ) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let metrics_internal = ServerMetrics::register(&metrics);
        let registry = HandlerRegistry::new();
        registry.register("task.request", echo_handler());
        Self {
            manifest: Arc::new(manifest),
            registry,
            metrics,
            validator: Arc::new(EnvelopeValidator::new(Duration::from_secs(300))),
            rate_limiter: Arc::new(middleware::KeyedRateLimiter::new(100, Duration::from_secs(60), 10_000)),
            snapshots,
            metering,
            delegation,
            metrics_internal,
        }
    }
}

/// Build the Axum router. Delegation routes are only mounted when
/// `state.delegation` is `Some`. Every route carries a generated
/// `X-Request-Id` and a structured per-request completion log.
pub fn build_app(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/asap", post(asap_endpoint))
        .route("/.well-known/asap/manifest.json", get(manifest_endpoint))
        .route("/asap/metrics", get(metrics_endpoint));

    if state.delegation.is_some() {
        router = router
            .route("/asap/delegations", post(issue_delegation))
            .route("/asap/delegations", get(list_delegations))
            .route("/asap/delegations/{id}", get(get_delegation))
            .route("/asap/delegations/{id}", delete(revoke_delegation));
    }

    router
        .layer(axum::middleware::from_fn(middleware::RequestLogger::layer))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// POST /asap
// ---------------------------------------------------------------------------

async fn asap_endpoint(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let start = std::time::Instant::now();
    let response = handle_asap_request(&state, &body).await;
    state.metrics_internal.requests_total.inc();
    state
        .metrics_internal
        .request_duration_ms
        .observe(start.elapsed().as_millis() as f64);
    (StatusCode::OK, Json(response)).into_response()
}

async fn handle_asap_request(state: &AppState, body: &[u8]) -> JsonRpcResponse {
    let request: JsonRpcRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            return JsonRpcResponse::failure(None, jsonrpc::PARSE_ERROR, format!("parse error: {e}"), None);
        }
    };

    let envelope = request.params.envelope;
    let id = Some(request.id.clone());

    if let Err(err) = state.validator.validate(&envelope, Utc::now()) {
        return JsonRpcResponse::from_asap_error(id, &err);
    }

    if state.rate_limiter.check(&envelope.sender).await.is_err() {
        return JsonRpcResponse::failure(
            id,
            jsonrpc::INVALID_REQUEST,
            "rate limit exceeded",
            Some(serde_json::json!({"code": "asap:transport/rate_limited"})),
        );
    }

    match state
        .registry
        .dispatch_async(envelope, Arc::clone(&state.manifest))
        .await
    {
        Ok(response_envelope) => JsonRpcResponse::success(id, response_envelope),
        Err(err) => JsonRpcResponse::from_asap_error(id, &err),
    }
}

// ---------------------------------------------------------------------------
// Manifest and metrics
// ---------------------------------------------------------------------------

async fn manifest_endpoint(State(state): State<Arc<AppState>>) -> Json<Manifest> {
    Json(state.manifest.as_ref().clone())
}

async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render_text(),
    )
}

// ---------------------------------------------------------------------------
// Delegation endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IssueDelegationRequest {
    delegate_urn: String,
    #[serde(default)]
    scope: Vec<String>,
    #[serde(default = "default_ttl_seconds")]
    ttl_seconds: i64,
}

fn default_ttl_seconds() -> i64 {
    3600
}

#[derive(Debug, Serialize)]
struct IssueDelegationResponse {
    jti: String,
    token: String,
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AuthError::MissingBearer)
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<(AuthenticatedPrincipal, Arc<DelegationState>), ApiError> {
    let delegation = state
        .delegation
        .as_ref()
        .ok_or_else(|| ApiError::not_found("delegation endpoints are not configured"))?;
    let token = bearer_token(headers).map_err(|e| ApiError::unauthorized(e.to_string()))?;
    let principal = delegation
        .bearer
        .validate(token)
        .await
        .map_err(|e| ApiError::unauthorized(e.to_string()))?;
    // SAFETY-free clone: DelegationState fields are themselves Arc-backed,
    // so cloning the handful of trait objects here is cheap.
    Ok((
        principal,
        Arc::new(DelegationState {
            storage: Arc::clone(&delegation.storage),
            keys: Arc::clone(&delegation.keys),
            bearer: Arc::clone(&delegation.bearer),
        }),
    ))
}

async fn issue_delegation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<IssueDelegationRequest>,
) -> Result<Json<IssueDelegationResponse>, ApiError> {
    let (principal, delegation) = authenticate(&state, &headers).await?;

    let signer = delegation
        .keys
        .signer_for(&principal.urn)
        .ok_or_else(|| ApiError::internal(format!("no signing key configured for {}", principal.urn)))?;

    let (jti, token) = signer
        .issue(&req.delegate_urn, req.scope, chrono::Duration::seconds(req.ttl_seconds), Utc::now())
        .map_err(|e| ApiError::internal(e.to_string()))?;

    delegation
        .storage
        .register_issued(&jti, &principal.urn, Some(&req.delegate_urn))
        .await
        .map_err(ApiError::from)?;

    Ok(Json(IssueDelegationResponse { jti, token }))
}

#[derive(Debug, Deserialize)]
struct ListDelegationsQuery {
    delegator_urn: String,
}

async fn list_delegations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<ListDelegationsQuery>,
) -> Result<Json<Vec<asap_delegation::IssuedSummary>>, ApiError> {
    let (_principal, delegation) = authenticate(&state, &headers).await?;
    let summaries = delegation
        .storage
        .list_issued_summaries(&q.delegator_urn)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(summaries))
}

async fn get_delegation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath(id): AxPath<String>,
) -> Result<Json<asap_delegation::TokenDetail>, ApiError> {
    let (_principal, delegation) = authenticate(&state, &headers).await?;
    let detail = delegation
        .storage
        .get_token_detail(&id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("delegation '{id}' not found")))?;
    Ok(Json(detail))
}

async fn revoke_delegation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath(id): AxPath<String>,
) -> Result<StatusCode, ApiError> {
    let (principal, delegation) = authenticate(&state, &headers).await?;

    let delegator = delegation
        .storage
        .get_delegator(&id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("delegation '{id}' not found")))?;

    if delegator != principal.urn {
        return Err(ApiError::forbidden("only the original delegator may revoke this token"));
    }

    delegation
        .storage
        .revoke_cascade(&id, Some("revoked via DELETE /asap/delegations"))
        .await
        .map_err(ApiError::from)?;

    Ok(StatusCode::NO_CONTENT)
}

/// Verify an incoming delegation-bearing claim: signature, expiry, and
/// revocation (§4.6). Scope checks are left to [`DelegationClaims::grants`]
/// at the call site, since the requested scope depends on the operation
/// being authorized.
pub async fn verify_delegation(
    storage: &dyn DelegationStorage,
    resolver: &dyn asap_delegation::token::PublicKeyResolver,
    token: &str,
) -> Result<DelegationClaims, AsapError> {
    let verifier = asap_delegation::DelegationVerifier::new(resolver);
    let claims = verifier.verify(token, Utc::now()).map_err(asap_error::AsapError::from)?;

    if storage.is_revoked(&claims.jti).await? {
        return Err(AsapError::new(ErrorCode::RevokedToken, format!("token '{}' is revoked", claims.jti)));
    }

    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use asap_delegation::InMemoryDelegationStorage;
    use asap_storage::{InMemoryMeteringStore, InMemorySnapshotStore};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    fn agent(name: &str) -> String {
        format!("urn:asap:agent:{name}")
    }

    fn sample_manifest() -> Manifest {
        Manifest {
            urn: agent("server"),
            name: "test server".into(),
            version: "0.1.0".into(),
            description: String::new(),
            capability: asap_core::Capability {
                asap_version: asap_core::ASAP_VERSION.into(),
                skills: vec![],
                state_persistence: false,
                streaming: false,
                mcp_tools: vec![],
            },
            endpoint: asap_core::Endpoint {
                asap: "https://server.example/asap".into(),
                events: None,
            },
            auth: None,
            signature: None,
        }
    }

    fn basic_state() -> Arc<AppState> {
        Arc::new(AppState::new(
            sample_manifest(),
            Arc::new(InMemorySnapshotStore::new()),
            Arc::new(InMemoryMeteringStore::new()),
            None,
        ))
    }

    #[tokio::test]
    async fn health_manifest_roundtrip() {
        let app = build_app(basic_state());
        let resp = app
            .oneshot(Request::builder().uri("/.well-known/asap/manifest.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn every_response_carries_a_request_id_header() {
        let app = build_app(basic_state());
        let resp = app
            .oneshot(Request::builder().uri("/.well-known/asap/manifest.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(resp.headers().get("x-request-id").is_some());
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        let app = build_app(basic_state());
        let resp = app
            .oneshot(Request::builder().uri("/asap/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn echo_round_trip_over_http() {
        let app = build_app(basic_state());
        let envelope = Envelope::new(agent("client"), agent("server"), "task.request", json!({"input": {"m": "hi"}}));
        let rpc = JsonRpcRequest::wrap(envelope.clone());
        let body = serde_json::to_vec(&rpc).unwrap();

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/asap")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let decoded: JsonRpcResponse = serde_json::from_slice(&bytes).unwrap();
        let result = decoded.result.expect("expected success");
        assert_eq!(result.envelope.payload["result"]["echoed"], json!({"m": "hi"}));
    }

    #[tokio::test]
    async fn malformed_json_returns_parse_error_with_http_200() {
        let app = build_app(basic_state());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/asap")
                    .header("content-type", "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let decoded: JsonRpcResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.error.unwrap().code, jsonrpc::PARSE_ERROR);
    }

    #[tokio::test]
    async fn unknown_payload_type_returns_handler_not_found() {
        let app = build_app(basic_state());
        let envelope = Envelope::new(agent("client"), agent("server"), "mystery.thing", json!({}));
        let rpc = JsonRpcRequest::wrap(envelope);
        let body = serde_json::to_vec(&rpc).unwrap();

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/asap")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let decoded: JsonRpcResponse = serde_json::from_slice(&bytes).unwrap();
        let err = decoded.error.unwrap();
        assert_eq!(err.data.unwrap()["code"], json!("asap:transport/handler_not_found"));
    }

    fn delegation_state() -> DelegationState {
        let mut store = InMemoryKeyStore::new();
        store.generate_for(agent("billing")).unwrap();
        let keys: Arc<dyn DelegationKeyStore> = Arc::new(store);
        let bearer: Arc<dyn BearerValidator> = Arc::new(StaticBearerValidator::new().with_token(
            "delegator-token",
            AuthenticatedPrincipal {
                urn: agent("billing"),
                scopes: vec!["admin".into()],
            },
        ));
        DelegationState {
            storage: Arc::new(InMemoryDelegationStorage::new()),
            keys,
            bearer,
        }
    }

    #[tokio::test]
    async fn issue_then_revoke_delegation_over_http() {
        let state = Arc::new(AppState::new(
            sample_manifest(),
            Arc::new(InMemorySnapshotStore::new()),
            Arc::new(InMemoryMeteringStore::new()),
            Some(delegation_state()),
        ));
        let app = build_app(state);

        let issue_body = serde_json::to_vec(&json!({
            "delegate_urn": agent("reporting"),
            "scope": ["read"],
        }))
        .unwrap();

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/asap/delegations")
                    .header("content-type", "application/json")
                    .header("authorization", "Bearer delegator-token")
                    .body(Body::from(issue_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let issued: IssueDelegationResponse = serde_json::from_slice(&bytes).unwrap();

        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/asap/delegations/{}", issued.jti))
                    .header("authorization", "Bearer delegator-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn revoke_without_auth_is_rejected() {
        let state = Arc::new(AppState::new(
            sample_manifest(),
            Arc::new(InMemorySnapshotStore::new()),
            Arc::new(InMemoryMeteringStore::new()),
            Some(delegation_state()),
        ));
        let app = build_app(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/asap/delegations/whatever")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn delegation_routes_absent_without_configuration() {
        let app = build_app(basic_state());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/asap/delegations/whatever")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
