// SPDX-License-Identifier: MIT OR Apache-2.0
//! BDD-style tests covering dispatch, circuit-breaker recovery, and
//! cascading delegation revocation across crate boundaries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use asap_breaker::{CircuitBreaker, CircuitState};
use asap_core::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use asap_core::{Capability, Endpoint, Envelope, Manifest};
use asap_delegation::{DelegationStorage, InMemoryDelegationStorage};
use asap_server::AppState;
use asap_storage::{InMemoryMeteringStore, InMemorySnapshotStore};
use axum::body::{to_bytes, Body};
use axum::http::Request;
use cucumber::{given, then, when, World as _};
use serde_json::json;
use tower::ServiceExt;

/// Wraps a [`axum::Router`] so the world can derive `Debug`.
struct Router(Option<axum::Router>);

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Router")
    }
}

impl Default for Router {
    fn default() -> Self {
        Self(None)
    }
}

#[derive(Debug, Default, cucumber::World)]
struct AsapWorld {
    app: Router,
    request_id: Option<String>,
    response: Option<JsonRpcResponse>,
    breaker: Option<CircuitBreaker>,
    permits: Vec<bool>,
    storage: Option<Arc<InMemoryDelegationStorage>>,
    edges: HashMap<(String, String), String>,
}

fn test_manifest() -> Manifest {
    Manifest {
        urn: "urn:asap:agent:server".into(),
        name: "bdd test server".into(),
        version: "0.1.0".into(),
        description: String::new(),
        capability: Capability {
            asap_version: asap_core::ASAP_VERSION.into(),
            skills: vec![],
            state_persistence: false,
            streaming: false,
            mcp_tools: vec![],
        },
        endpoint: Endpoint {
            asap: "https://server.example/asap".into(),
            events: None,
        },
        auth: None,
        signature: None,
    }
}

fn edge_id(from: &str, to: &str) -> String {
    format!("{from}->{to}")
}

// ---------------------------------------------------------------------------
// Echo dispatch
// ---------------------------------------------------------------------------

#[given("a dispatch server with the echo handler registered")]
async fn dispatch_server(w: &mut AsapWorld) {
    let state = Arc::new(AppState::new(
        test_manifest(),
        Arc::new(InMemorySnapshotStore::new()),
        Arc::new(InMemoryMeteringStore::new()),
        None,
    ));
    w.app = Router(Some(asap_server::build_app(state)));
}

#[when(expr = "a {string} envelope with input {string} is sent")]
async fn send_envelope(w: &mut AsapWorld, payload_type: String, input: String) {
    let envelope = Envelope::new(
        "urn:asap:agent:client",
        "urn:asap:agent:server",
        payload_type,
        json!({"conversation_id": "c1", "skill_id": "echo", "input": input}),
    );
    w.request_id = Some(envelope.id.clone());

    let rpc = JsonRpcRequest::wrap(envelope);
    let body = serde_json::to_vec(&rpc).expect("serialize request");
    let app = w.app.0.clone().expect("dispatch server not built");

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/asap")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .expect("build request"),
        )
        .await
        .expect("request failed");
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("read body");
    w.response = Some(serde_json::from_slice(&bytes).expect("decode response"));
}

#[then(expr = "the response payload type is {string}")]
async fn response_payload_type(w: &mut AsapWorld, expected: String) {
    let result = w.response.as_ref().and_then(|r| r.result.as_ref()).expect("no result envelope");
    assert_eq!(result.envelope.payload_type, expected);
}

#[then(expr = "the response status is {string}")]
async fn response_status(w: &mut AsapWorld, expected: String) {
    let result = w.response.as_ref().and_then(|r| r.result.as_ref()).expect("no result envelope");
    assert_eq!(result.envelope.payload["status"], json!(expected));
}

#[then(expr = "the echoed input is {string}")]
async fn echoed_input(w: &mut AsapWorld, expected: String) {
    let result = w.response.as_ref().and_then(|r| r.result.as_ref()).expect("no result envelope");
    assert_eq!(result.envelope.payload["result"]["echoed"], json!(expected));
}

#[then("the response correlation id matches the request")]
async fn correlation_matches(w: &mut AsapWorld) {
    let result = w.response.as_ref().and_then(|r| r.result.as_ref()).expect("no result envelope");
    assert_eq!(result.envelope.correlation_id, w.request_id);
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[given(expr = "a circuit breaker with threshold {int} and timeout {int} milliseconds")]
async fn breaker_with_threshold(w: &mut AsapWorld, threshold: u32, timeout_ms: u64) {
    w.breaker = Some(CircuitBreaker::new(threshold, Duration::from_millis(timeout_ms)));
}

#[when(expr = "{int} failures are recorded")]
async fn record_failures(w: &mut AsapWorld, count: u32) {
    let breaker = w.breaker.as_ref().expect("breaker not built");
    for _ in 0..count {
        breaker.record_failure();
    }
}

#[when("a success is recorded")]
async fn record_success(w: &mut AsapWorld) {
    w.breaker.as_ref().expect("breaker not built").record_success();
}

#[when(expr = "{int} milliseconds pass")]
async fn sleep_ms(_w: &mut AsapWorld, ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[then(expr = "the breaker state is {string}")]
async fn breaker_state_is(w: &mut AsapWorld, expected: String) {
    let state = w.breaker.as_ref().expect("breaker not built").get_state();
    let expected_state = match expected.as_str() {
        "closed" => CircuitState::Closed,
        "open" => CircuitState::Open,
        "half_open" => CircuitState::HalfOpen,
        other => panic!("unknown circuit state in test: {other}"),
    };
    assert_eq!(state, expected_state);
}

#[then("a new attempt is rejected")]
async fn attempt_rejected(w: &mut AsapWorld) {
    assert!(!w.breaker.as_ref().expect("breaker not built").can_attempt());
}

#[then("exactly one concurrent attempt is permitted")]
async fn exactly_one_permitted(w: &mut AsapWorld) {
    let breaker = w.breaker.as_ref().expect("breaker not built");
    w.permits = vec![breaker.can_attempt(), breaker.can_attempt()];
    assert_eq!(w.permits, vec![true, false]);
}

#[then(expr = "the consecutive failure count is {int}")]
async fn consecutive_failures_is(w: &mut AsapWorld, expected: u32) {
    assert_eq!(w.breaker.as_ref().expect("breaker not built").get_consecutive_failures(), expected);
}

// ---------------------------------------------------------------------------
// Cascading delegation revocation
// ---------------------------------------------------------------------------

#[given(expr = "a delegation chain {string} -> {string} -> {string} -> {string}")]
async fn delegation_chain(w: &mut AsapWorld, p: String, a: String, b: String, c: String) {
    let storage = Arc::new(InMemoryDelegationStorage::new());
    let mut edges = HashMap::new();
    for (from, to) in [(&p, &a), (&a, &b), (&b, &c)] {
        let id = edge_id(from, to);
        storage
            .register_issued(&id, from, Some(to.as_str()))
            .await
            .expect("register issued token");
        edges.insert((from.clone(), to.clone()), id);
    }
    w.storage = Some(storage);
    w.edges = edges;
}

#[given(expr = "a delegation cycle {string} <-> {string}")]
async fn delegation_cycle(w: &mut AsapWorld, x: String, y: String) {
    let storage = Arc::new(InMemoryDelegationStorage::new());
    let mut edges = HashMap::new();
    for (from, to) in [(&x, &y), (&y, &x)] {
        let id = edge_id(from, to);
        storage
            .register_issued(&id, from, Some(to.as_str()))
            .await
            .expect("register issued token");
        edges.insert((from.clone(), to.clone()), id);
    }
    w.storage = Some(storage);
    w.edges = edges;
}

#[when(expr = "the token from {string} to {string} is revoked")]
async fn revoke_token(w: &mut AsapWorld, from: String, to: String) {
    let storage = w.storage.as_ref().expect("delegation storage not built");
    let id = w.edges.get(&(from, to)).expect("unknown edge").clone();
    storage.revoke_cascade(&id, Some("bdd test")).await.expect("revoke_cascade");
}

#[then(expr = "the token from {string} to {string} is revoked")]
async fn token_is_revoked(w: &mut AsapWorld, from: String, to: String) {
    let storage = w.storage.as_ref().expect("delegation storage not built");
    let id = w.edges.get(&(from, to)).expect("unknown edge").clone();
    assert!(storage.is_revoked(&id).await.expect("is_revoked"));
}

#[tokio::main]
async fn main() {
    AsapWorld::run("tests/features").await;
}
