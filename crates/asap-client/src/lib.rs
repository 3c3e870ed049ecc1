// SPDX-License-Identifier: MIT OR Apache-2.0
//! asap-client
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! HTTP client for the ASAP agent-to-agent protocol: JSON-RPC framing,
//! retry with exponential backoff, per-peer circuit breaking, and a TTL'd
//! manifest cache.

pub mod pool;
pub mod retry;

use std::time::Duration;

use asap_core::{Envelope, JsonRpcRequest, JsonRpcResponse, Manifest};
use pool::{CacheConfig, PeerRegistry};
use retry::{AttemptOutcome, RetryConfig};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by [`AsapClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request URL did not satisfy the client's HTTPS policy.
    #[error("refusing non-HTTPS request to {0} (require_https=true)")]
    InsecureUrl(String),
    /// The peer's circuit breaker is open.
    #[error(transparent)]
    CircuitOpen(#[from] asap_breaker::CircuitOpenError),
    /// The underlying HTTP transport failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// The peer returned a JSON-RPC error.
    #[error("remote error: {0}")]
    Remote(String),
    /// The response body could not be parsed as JSON-RPC.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// An unexpected internal failure.
    #[error("internal client error: {0}")]
    Internal(String),
}

impl From<ClientError> for asap_error::AsapError {
    fn from(err: ClientError) -> Self {
        use asap_error::{AsapError, ErrorCode};
        match err {
            ClientError::InsecureUrl(url) => {
                AsapError::new(ErrorCode::WebhookUrlRejected, format!("insecure url: {url}"))
            }
            ClientError::CircuitOpen(e) => e.into(),
            ClientError::Transport(msg) => AsapError::new(ErrorCode::ConnectionRefused, msg),
            ClientError::Remote(msg) => AsapError::remote("asap:remote/error", msg),
            ClientError::Malformed(msg) => AsapError::new(ErrorCode::InvalidSchema, msg),
            ClientError::Internal(msg) => AsapError::new(ErrorCode::ReadTimeout, msg),
        }
    }
}

/// Configuration for [`AsapClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Retry behavior.
    pub retry: RetryConfig,
    /// Manifest cache and breaker registry sizing.
    pub cache: CacheConfig,
    /// Consecutive failures before a peer's circuit opens.
    pub circuit_breaker_threshold: u32,
    /// How long a peer's circuit stays open before a half-open probe.
    pub circuit_breaker_timeout: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Reject plain `http://` URLs unless explicitly disabled (test/dev
    /// escape hatch).
    pub require_https: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            require_https: true,
        }
    }
}

/// HTTP client for sending ASAP envelopes to a peer's `/asap` endpoint.
///
/// Wraps a shared `reqwest::Client` (which owns the actual TCP connection
/// pool and keep-alive) with JSON-RPC framing, retry/backoff, circuit
/// breaking and manifest caching layered on top.
pub struct AsapClient {
    http: reqwest::Client,
    config: ClientConfig,
    registry: PeerRegistry,
}

impl AsapClient {
    /// Build a client with the given configuration.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.cache.capacity)
            .build()
            .map_err(|e| ClientError::Internal(e.to_string()))?;
        let registry = PeerRegistry::new(
            config.cache.clone(),
            config.circuit_breaker_threshold,
            config.circuit_breaker_timeout,
        );
        Ok(Self {
            http,
            config,
            registry,
        })
    }

    fn check_https(&self, url: &str) -> Result<(), ClientError> {
        if self.config.require_https && !url.starts_with("https://") {
            return Err(ClientError::InsecureUrl(url.to_string()));
        }
        Ok(())
    }

    fn base_url_of<'a>(&self, url: &'a str) -> &'a str {
        url.split("/asap").next().unwrap_or(url)
    }

    /// Send a single envelope and return the peer's response envelope.
    pub async fn send(&self, url: &str, envelope: Envelope) -> Result<Envelope, ClientError> {
        self.check_https(url)?;
        let base_url = self.base_url_of(url).to_string();
        let breaker = self.registry.breaker_for(&base_url);

        let result = retry::retry_async(&self.config.retry, |attempt| {
            let envelope = envelope.clone();
            let breaker = std::sync::Arc::clone(&breaker);
            let base_url = base_url.clone();
            async move {
                if !breaker.can_attempt() {
                    return AttemptOutcome::Failure {
                        error: ClientError::CircuitOpen(asap_breaker::CircuitOpenError {
                            base_url: base_url.clone(),
                            consecutive_failures: breaker.get_consecutive_failures(),
                        }),
                        status: None,
                        retry_after_secs: None,
                    };
                }

                let request = JsonRpcRequest::wrap(envelope);
                debug!(target: "asap::client", attempt, url, "sending envelope");
                let response = self.http.post(url).json(&request).send().await;

                match response {
                    Ok(resp) => {
                        let status = resp.status().as_u16();
                        let retry_after_secs = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok());

                        if (200..300).contains(&status) {
                            match resp.json::<JsonRpcResponse>().await {
                                Ok(rpc) => {
                                    if let Some(error) = rpc.error {
                                        breaker.record_failure();
                                        return AttemptOutcome::Failure {
                                            error: ClientError::Remote(error.message),
                                            status: Some(status),
                                            retry_after_secs,
                                        };
                                    }
                                    match rpc.result {
                                        Some(params) => {
                                            breaker.record_success();
                                            AttemptOutcome::Success(params.envelope)
                                        }
                                        None => AttemptOutcome::Failure {
                                            error: ClientError::Malformed(
                                                "response had neither result nor error".into(),
                                            ),
                                            status: Some(status),
                                            retry_after_secs,
                                        },
                                    }
                                }
                                Err(e) => AttemptOutcome::Failure {
                                    error: ClientError::Malformed(e.to_string()),
                                    status: Some(status),
                                    retry_after_secs,
                                },
                            }
                        } else {
                            // 429 means the peer is healthy but asking us to
                            // slow down, not a breaker-relevant failure.
                            if status != 429 {
                                breaker.record_failure();
                            }
                            AttemptOutcome::Failure {
                                error: ClientError::Transport(format!("HTTP {status}")),
                                status: Some(status),
                                retry_after_secs,
                            }
                        }
                    }
                    Err(e) => {
                        breaker.record_failure();
                        AttemptOutcome::Failure {
                            error: ClientError::Transport(e.to_string()),
                            status: None,
                            retry_after_secs: None,
                        }
                    }
                }
            }
        })
        .await;

        if let Err(ref e) = result {
            warn!(target: "asap::client", url, error = %e, "send failed");
        }
        result
    }

    /// Send multiple envelopes concurrently to the same URL, preserving
    /// input order in the output.
    pub async fn send_batch(
        &self,
        url: &str,
        envelopes: Vec<Envelope>,
    ) -> Vec<Result<Envelope, ClientError>> {
        let futures = envelopes.into_iter().map(|e| self.send(url, e));
        futures::future::join_all(futures).await
    }

    /// Fetch a peer's manifest, serving from cache when a fresh entry
    /// exists.
    pub async fn get_manifest(&self, url: &str) -> Result<Manifest, ClientError> {
        self.check_https(url)?;
        if let Some(manifest) = self.registry.get_manifest(url) {
            return Ok(manifest);
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ClientError::Transport(format!("HTTP {}", response.status())));
        }
        let manifest: Manifest = response
            .json()
            .await
            .map_err(|e| ClientError::Malformed(e.to_string()))?;
        asap_core::validate_manifest(&manifest).map_err(|e| ClientError::Malformed(e.to_string()))?;

        self.registry.put_manifest(url, manifest.clone());
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_envelope() -> Envelope {
        Envelope::new(
            "urn:asap:agent:client",
            "urn:asap:agent:server",
            "task.request",
            json!({"skill_id": "echo"}),
        )
    }

    fn response_body(request_envelope: &Envelope) -> serde_json::Value {
        let response = Envelope::respond_to(
            request_envelope,
            "task.response",
            json!({"echoed": true}),
        );
        json!({
            "jsonrpc": "2.0",
            "result": {"envelope": response},
            "id": "req-1",
        })
    }

    fn test_config() -> ClientConfig {
        ClientConfig {
            require_https: false,
            retry: RetryConfig {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: false,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn send_returns_response_envelope_on_success() {
        let server = MockServer::start().await;
        let envelope = sample_envelope();
        Mock::given(method("POST"))
            .and(path("/asap"))
            .respond_with(ResponseTemplate::new(200).set_body_json(response_body(&envelope)))
            .mount(&server)
            .await;

        let client = AsapClient::new(test_config()).unwrap();
        let url = format!("{}/asap", server.uri());
        let response = client.send(&url, envelope).await.unwrap();
        assert_eq!(response.payload_type, "task.response");
    }

    #[tokio::test]
    async fn send_retries_on_503_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/asap"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = AsapClient::new(test_config()).unwrap();
        let url = format!("{}/asap", server.uri());
        let result = client.send(&url, sample_envelope()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn send_does_not_retry_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/asap"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = AsapClient::new(test_config()).unwrap();
        let url = format!("{}/asap", server.uri());
        let result = client.send(&url, sample_envelope()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn rejects_insecure_url_by_default() {
        let client = AsapClient::new(ClientConfig::default()).unwrap();
        let result = client.send("http://insecure.example/asap", sample_envelope()).await;
        assert!(matches!(result, Err(ClientError::InsecureUrl(_))));
    }

    #[tokio::test]
    async fn circuit_opens_after_repeated_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/asap"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut config = test_config();
        config.circuit_breaker_threshold = 2;
        config.retry.max_retries = 1;
        let client = AsapClient::new(config).unwrap();
        let url = format!("{}/asap", server.uri());

        for _ in 0..2 {
            let _ = client.send(&url, sample_envelope()).await;
        }
        let result = client.send(&url, sample_envelope()).await;
        assert!(matches!(result, Err(ClientError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn repeated_429s_never_open_the_circuit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/asap"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let mut config = test_config();
        config.circuit_breaker_threshold = 2;
        config.retry.max_retries = 1;
        let client = AsapClient::new(config).unwrap();
        let url = format!("{}/asap", server.uri());

        for _ in 0..5 {
            let result = client.send(&url, sample_envelope()).await;
            assert!(!matches!(result, Err(ClientError::CircuitOpen(_))));
        }
    }

    #[tokio::test]
    async fn get_manifest_caches_across_calls() {
        let server = MockServer::start().await;
        let manifest = json!({
            "urn": "urn:asap:agent:server",
            "name": "server",
            "version": "0.1.0",
            "description": "test server",
            "capability": {
                "asap_version": "0.1.0",
                "skills": [],
                "state_persistence": false,
                "streaming": false,
                "mcp_tools": []
            },
            "endpoint": {"asap": "https://server.example/asap"}
        });
        Mock::given(method("GET"))
            .and(path("/.well-known/asap/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(manifest))
            .expect(1)
            .mount(&server)
            .await;

        let client = AsapClient::new(test_config()).unwrap();
        let url = format!("{}/.well-known/asap/manifest.json", server.uri());
        let first = client.get_manifest(&url).await.unwrap();
        let second = client.get_manifest(&url).await.unwrap();
        assert_eq!(first.urn, second.urn);
    }

    #[tokio::test]
    async fn send_batch_preserves_order() {
        let server = MockServer::start().await;
        let e1 = sample_envelope();
        let e2 = sample_envelope();
        Mock::given(method("POST"))
            .and(path("/asap"))
            .respond_with(move |req: &wiremock::Request| {
                let body: JsonRpcRequest = req.body_json().unwrap();
                ResponseTemplate::new(200).set_body_json(response_body(&body.params.envelope))
            })
            .mount(&server)
            .await;

        let client = AsapClient::new(test_config()).unwrap();
        let url = format!("{}/asap", server.uri());
        let results = client.send_batch(&url, vec![e1.clone(), e2.clone()]).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
    }
}
