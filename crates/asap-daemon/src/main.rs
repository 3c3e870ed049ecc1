#![deny(unsafe_code)]
//! The runnable ASAP agent process: starts the HTTP dispatch server and,
//! alongside it, the outbound pieces a peer-to-peer agent needs — an
//! `asap-client` for one-shot manifest/envelope calls to configured peers,
//! `asap-ws` transports held open to any configured WebSocket peers, and a
//! webhook delivery manager used to announce this agent's own startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use asap_client::{AsapClient, ClientConfig};
use asap_core::{Capability, Endpoint, Manifest};
use asap_server::{build_app, AppState, DelegationState, InMemoryKeyStore, StaticBearerValidator};
use asap_storage::{
    InMemoryMeteringStore, InMemorySnapshotStore, SharedConnection, SqliteMeteringStore, SqliteSnapshotStore,
    StorageBackend,
};
use asap_webhook::{RetryPolicy, WebhookDelivery, WebhookRetryManager};
use asap_ws::{TransportConfig, WsTransport};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "asap-daemon", version, about = "ASAP agent-to-agent runnable process")]
struct Args {
    /// Bind address for the HTTP dispatch server.
    #[arg(long, default_value = "127.0.0.1:8088")]
    bind: String,

    /// This agent's own URN, published in its manifest.
    #[arg(long, default_value = "urn:asap:agent:daemon")]
    urn: String,

    /// Human-readable name published in the manifest.
    #[arg(long, default_value = "asap-daemon")]
    name: String,

    /// Public `/asap` endpoint URL published in the manifest.
    #[arg(long)]
    endpoint: Option<String>,

    /// Register a single dev-mode bearer token that authenticates as this
    /// agent's own URN and mounts the delegation endpoints. Not suitable
    /// for production; real deployments embed `asap-server` as a library
    /// with a JWKS-backed `BearerValidator` instead.
    #[arg(long)]
    dev_auth_token: Option<String>,

    /// Peer `/asap` base URL to fetch a manifest from at startup, proving
    /// the outbound client is wired to a live process. Repeatable.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Peer WebSocket URL to hold an `asap-ws` transport open against for
    /// the lifetime of the process. Repeatable.
    #[arg(long = "ws-peer")]
    ws_peers: Vec<String>,

    /// Webhook callback URL notified with a `daemon.started` event once the
    /// HTTP server is listening.
    #[arg(long)]
    webhook_url: Option<String>,

    /// HMAC-SHA256 secret signing outbound webhook deliveries.
    #[arg(long, env = "ASAP_WEBHOOK_SECRET")]
    webhook_secret: Option<String>,

    /// Allow plain `http://` peer, webhook and WebSocket URLs (dev only).
    #[arg(long)]
    allow_insecure: bool,

    /// Enable verbose request/response debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("asap=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("asap=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let backend = StorageBackend::from_env_str(std::env::var("ASAP_STORAGE_BACKEND").ok().as_deref());
    let (snapshots, metering, delegation_storage): (
        Arc<dyn asap_storage::SnapshotStore>,
        Arc<dyn asap_storage::MeteringStore>,
        Arc<dyn asap_delegation::DelegationStorage>,
    ) = match backend {
        StorageBackend::Memory => (
            Arc::new(InMemorySnapshotStore::new()),
            Arc::new(InMemoryMeteringStore::new()),
            Arc::new(asap_delegation::InMemoryDelegationStorage::new()),
        ),
        StorageBackend::Sqlite => {
            let path = std::env::var("ASAP_STORAGE_PATH").unwrap_or_else(|_| "asap.db".to_string());
            let conn = SharedConnection::open(&path)
                .with_context(|| format!("open sqlite storage at {path}"))?;
            (
                Arc::new(SqliteSnapshotStore::new(conn.clone())),
                Arc::new(SqliteMeteringStore::new(conn.clone())),
                Arc::new(asap_delegation::SqliteDelegationStorage::new(conn)),
            )
        }
    };

    let endpoint_url = args
        .endpoint
        .clone()
        .unwrap_or_else(|| format!("http://{}/asap", args.bind));

    let manifest = Manifest {
        urn: args.urn.clone(),
        name: args.name.clone(),
        version: asap_core::ASAP_VERSION.to_string(),
        description: String::new(),
        capability: Capability {
            asap_version: asap_core::ASAP_VERSION.to_string(),
            skills: vec![],
            state_persistence: true,
            streaming: !args.ws_peers.is_empty(),
            mcp_tools: vec![],
        },
        endpoint: Endpoint {
            asap: endpoint_url,
            events: None,
        },
        auth: None,
        signature: None,
    };

    let delegation = match args.dev_auth_token {
        Some(token) => {
            let mut keys = InMemoryKeyStore::new();
            keys.generate_for(args.urn.clone())?;
            let bearer = StaticBearerValidator::new().with_token(
                token,
                asap_server::AuthenticatedPrincipal {
                    urn: args.urn.clone(),
                    scopes: vec!["delegate".to_string()],
                },
            );
            Some(DelegationState {
                storage: delegation_storage,
                keys: Arc::new(keys),
                bearer: Arc::new(bearer),
            })
        }
        None => None,
    };

    let state = Arc::new(AppState::new(manifest, snapshots, metering, delegation));
    let app = build_app(state);

    let client = AsapClient::new(ClientConfig {
        require_https: !args.allow_insecure,
        ..ClientConfig::default()
    })
    .context("build outbound asap-client")?;
    fetch_peer_manifests(&client, &args.peers).await;
    connect_ws_peers(&args.ws_peers, args.allow_insecure).await;

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, urn = %args.urn, storage = ?backend, "asap-daemon listening");

    if let Some(url) = args.webhook_url.clone() {
        announce_startup(url, args.webhook_secret.clone(), args.allow_insecure, args.urn.clone()).await;
    }

    axum::serve(listener, app).await.context("serve")
}

/// Fetch and log each configured peer's manifest, proving the outbound
/// client can reach a live agent. Failures are logged, not fatal — a peer
/// being unreachable at startup shouldn't stop this agent from serving.
async fn fetch_peer_manifests(client: &AsapClient, peers: &[String]) {
    for peer in peers {
        match client.get_manifest(peer).await {
            Ok(manifest) => info!(peer, urn = %manifest.urn, "daemon.peer.manifest"),
            Err(e) => warn!(peer, error = %e, "daemon.peer.manifest.failed"),
        }
    }
}

/// Open an `asap-ws` transport to each configured peer and hold it open for
/// the life of the process by detaching its task. Each peer gets its own
/// circuit breaker, matching the per-peer isolation `asap-client` gives its
/// HTTP peers.
async fn connect_ws_peers(ws_peers: &[String], allow_insecure: bool) {
    for url in ws_peers {
        if !allow_insecure && !url.starts_with("wss://") {
            warn!(url, "daemon.ws_peer.insecure_rejected");
            continue;
        }
        let breaker = Arc::new(asap_breaker::CircuitBreaker::new(5, Duration::from_secs(60)));
        match WsTransport::connect(url.clone(), TransportConfig::default(), breaker).await {
            Ok(_transport) => {
                // The run/recv/ack-check tasks were spawned with their own
                // channel and map handles and keep running detached from
                // this `Arc`'s lifetime; dropping it here does not stop
                // them, only `close()` would.
                info!(url, "daemon.ws_peer.connected");
            }
            Err(e) => warn!(url, error = %e, "daemon.ws_peer.connect_failed"),
        }
    }
}

/// Deliver a single `daemon.started` webhook event, retrying per
/// [`RetryPolicy::default`]. Best-effort: logged, never fatal.
async fn announce_startup(url: String, secret: Option<String>, allow_insecure: bool, urn: String) {
    let delivery = match WebhookDelivery::new(
        secret.map(String::into_bytes),
        !allow_insecure,
        asap_webhook::DEFAULT_TIMEOUT,
    ) {
        Ok(delivery) => delivery,
        Err(e) => {
            warn!(error = %e, "daemon.webhook.setup_failed");
            return;
        }
    };
    let manager = WebhookRetryManager::new(delivery, RetryPolicy::default(), None);
    let payload = serde_json::json!({ "event": "daemon.started", "urn": urn });
    tokio::spawn(async move {
        match manager.deliver_with_retry(&url, &payload, &Default::default()).await {
            Ok(result) if result.success => info!(url = %url, "daemon.webhook.delivered"),
            Ok(result) => warn!(url = %url, status = result.status_code, "daemon.webhook.undelivered"),
            Err(e) => warn!(url = %url, error = %e, "daemon.webhook.error"),
        }
    });
}
