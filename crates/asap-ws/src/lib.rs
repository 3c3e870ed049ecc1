// SPDX-License-Identifier: MIT OR Apache-2.0
//! Auto-reconnecting WebSocket transport for ASAP envelopes, with
//! at-least-once delivery (ACK tracking), per-remote rate limiting, and
//! request/response correlation.
//!
//! Connection lifecycle, receive routing, and ACK-timeout polling each run
//! as their own `tokio::task`, coordinated through channels — no task ever
//! locks another's state directly.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod rate_limit;

pub use rate_limit::{RateLimitRegistry, RateLimiterConfig};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use asap_core::Envelope;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Errors raised by the transport.
#[derive(Debug, Error)]
pub enum WsError {
    /// The underlying WebSocket connection failed.
    #[error("websocket connection failed: {0}")]
    Connection(String),
    /// `send_and_receive` did not get a matching response in time.
    #[error("timed out waiting for response")]
    Timeout,
    /// The transport was closed before a response arrived.
    #[error("transport closed")]
    Closed,
    /// A frame could not be decoded as an envelope.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl From<WsError> for asap_error::AsapError {
    fn from(err: WsError) -> Self {
        use asap_error::{AsapError, ErrorCode};
        match err {
            WsError::Connection(msg) => AsapError::new(ErrorCode::ConnectionRefused, msg),
            WsError::Timeout => AsapError::new(ErrorCode::ReadTimeout, "timed out waiting for response"),
            WsError::Closed => AsapError::new(ErrorCode::ConnectionRefused, "transport closed"),
            WsError::Malformed(msg) => AsapError::new(ErrorCode::InvalidSchema, msg),
        }
    }
}

/// An inbound control frame acknowledging receipt of an envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AckFrame {
    #[serde(rename = "type")]
    kind: String,
    envelope_id: String,
}

fn ack_frame(envelope_id: &str) -> Message {
    let frame = AckFrame {
        kind: "ack".to_string(),
        envelope_id: envelope_id.to_string(),
    };
    Message::Text(serde_json::to_string(&frame).expect("AckFrame always serializes").into())
}

/// Reconnection backoff and ACK/request-response tuning.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Initial reconnect backoff.
    pub initial_backoff: Duration,
    /// Maximum reconnect backoff.
    pub max_backoff: Duration,
    /// Reconnect attempts before giving up and ending the run loop.
    pub max_reconnect_attempts: u32,
    /// How often the ack-check loop polls for timed-out pending acks.
    pub ack_check_interval: Duration,
    /// How long to wait for an ack before resending.
    pub ack_timeout: Duration,
    /// Resend attempts before dropping a pending ack and recording a
    /// breaker failure.
    pub max_ack_retries: u32,
    /// Default timeout for `send_and_receive`.
    pub receive_timeout: Duration,
    /// Outbound rate limit, envelopes per second, per remote URL.
    pub rate_per_second: f64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            ack_check_interval: Duration::from_millis(500),
            ack_timeout: Duration::from_secs(5),
            max_ack_retries: 3,
            receive_timeout: Duration::from_secs(30),
            rate_per_second: 50.0,
        }
    }
}

struct PendingAck {
    envelope: Envelope,
    sent_at: Instant,
    retries: u32,
}

enum Waiter {
    /// Resolved by a matching `correlation_id`.
    Response(oneshot::Sender<Envelope>),
}

type WsWrite = futures::stream::SplitSink<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, Message>;
type WsRead = futures::stream::SplitStream<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>>;

async fn connect_split(url: &str) -> Result<(WsWrite, WsRead), WsError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url).await.map_err(|e| WsError::Connection(e.to_string()))?;
    Ok(ws_stream.split())
}

/// Route frames off `read` until the socket closes, signalling
/// `disconnect_tx` exactly once on exit.
fn spawn_recv_loop(
    mut read: WsRead,
    url: String,
    outbound: mpsc::UnboundedSender<Message>,
    pending_acks: Arc<Mutex<BTreeMap<String, PendingAck>>>,
    pending_requests: Arc<Mutex<BTreeMap<String, Waiter>>>,
    disconnect_tx: mpsc::UnboundedSender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = read.next().await {
            let Ok(message) = frame else { break };
            let Message::Text(text) = message else { continue };

            if let Ok(ack) = serde_json::from_str::<AckFrame>(&text) {
                if ack.kind == "ack" {
                    pending_acks.lock().unwrap().remove(&ack.envelope_id);
                    continue;
                }
            }

            let Ok(envelope) = serde_json::from_str::<Envelope>(&text) else {
                warn!(url, "ws.recv.malformed_frame");
                continue;
            };

            let _ = outbound.send(ack_frame(&envelope.id));

            if let Some(correlation_id) = &envelope.correlation_id {
                pending_acks.lock().unwrap().remove(correlation_id);
                if let Some(Waiter::Response(sender)) = pending_requests.lock().unwrap().remove(correlation_id) {
                    let _ = sender.send(envelope);
                    continue;
                }
            }
            debug!(url, envelope_id = envelope.id, "ws.recv.unsolicited");
        }
        let _ = disconnect_tx.send(());
    })
}

/// Classify a dropped `Waiter::Response` sender. A deliberate `close()` sets
/// `closing` before dropping pending senders, so a waiter observes a timeout
/// rather than a connection error.
fn waiter_dropped_error(closing: &std::sync::atomic::AtomicBool) -> WsError {
    if closing.load(std::sync::atomic::Ordering::SeqCst) {
        WsError::Timeout
    } else {
        WsError::Closed
    }
}

/// A single remote connection: owns the run/recv/ack-check tasks and the
/// shared pending-ack and pending-request maps.
pub struct WsTransport {
    url: String,
    outbound_tx: mpsc::UnboundedSender<Message>,
    pending_acks: Arc<Mutex<BTreeMap<String, PendingAck>>>,
    pending_requests: Arc<Mutex<BTreeMap<String, Waiter>>>,
    breaker: Arc<asap_breaker::CircuitBreaker>,
    rate_limiter: Arc<rate_limit::TokenBucket>,
    tasks: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
    current_recv: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
    closing: Arc<std::sync::atomic::AtomicBool>,
}

impl WsTransport {
    /// Connect to `url` and start the run/recv/ack-check tasks.
    pub async fn connect(
        url: impl Into<String>,
        config: TransportConfig,
        breaker: Arc<asap_breaker::CircuitBreaker>,
    ) -> Result<Arc<Self>, WsError> {
        let url = url.into();
        let (write, read) = connect_split(&url).await?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel::<()>();
        let pending_acks = Arc::new(Mutex::new(BTreeMap::new()));
        let pending_requests: Arc<Mutex<BTreeMap<String, Waiter>>> = Arc::new(Mutex::new(BTreeMap::new()));
        let rate_limiter = Arc::new(rate_limit::TokenBucket::new(config.rate_per_second));
        let current_recv = Arc::new(Mutex::new(None));
        let closing = Arc::new(std::sync::atomic::AtomicBool::new(false));

        *current_recv.lock().unwrap() = Some(spawn_recv_loop(
            read,
            url.clone(),
            outbound_tx.clone(),
            Arc::clone(&pending_acks),
            Arc::clone(&pending_requests),
            disconnect_tx.clone(),
        ));

        let transport = Arc::new(Self {
            url: url.clone(),
            outbound_tx: outbound_tx.clone(),
            pending_acks: Arc::clone(&pending_acks),
            pending_requests: Arc::clone(&pending_requests),
            breaker: Arc::clone(&breaker),
            rate_limiter,
            tasks: AsyncMutex::new(Vec::new()),
            current_recv: Arc::clone(&current_recv),
            closing: Arc::clone(&closing),
        });

        // Run loop: owns connection lifecycle. Forwards outbound frames to
        // the current write half; on write failure or a disconnect signal
        // from the recv loop, reconnects with exponential backoff up to
        // `max_reconnect_attempts`, resetting the attempt counter on
        // success. Exits (ending the transport) once attempts are
        // exhausted.
        let run_pending_acks = Arc::clone(&pending_acks);
        let run_pending_requests = Arc::clone(&pending_requests);
        let run_current_recv = Arc::clone(&current_recv);
        let run_outbound = outbound_tx.clone();
        let run_url = url.clone();
        let run_config = config.clone();
        let run_loop = tokio::spawn(async move {
            let mut write = write;
            let mut attempt: u32 = 0;
            loop {
                tokio::select! {
                    maybe_msg = outbound_rx.recv() => {
                        match maybe_msg {
                            Some(message) => {
                                if write.send(message).await.is_ok() {
                                    continue;
                                }
                            }
                            None => return,
                        }
                    }
                    _ = disconnect_rx.recv() => {}
                }

                loop {
                    if attempt >= run_config.max_reconnect_attempts {
                        warn!(url = run_url, attempt, "ws.reconnect.exhausted");
                        return;
                    }
                    let delay = run_config
                        .initial_backoff
                        .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
                        .min(run_config.max_backoff);
                    attempt += 1;
                    warn!(url = run_url, attempt, delay_ms = delay.as_millis() as u64, "ws.reconnecting");
                    tokio::time::sleep(delay).await;

                    match connect_split(&run_url).await {
                        Ok((new_write, new_read)) => {
                            write = new_write;
                            *run_current_recv.lock().unwrap() = Some(spawn_recv_loop(
                                new_read,
                                run_url.clone(),
                                run_outbound.clone(),
                                Arc::clone(&run_pending_acks),
                                Arc::clone(&run_pending_requests),
                                disconnect_tx.clone(),
                            ));
                            info!(url = run_url, "ws.reconnected");
                            attempt = 0;
                            break;
                        }
                        Err(e) => {
                            warn!(url = run_url, error = %e, "ws.reconnect.failed");
                        }
                    }
                }
            }
        });

        // Ack-check loop: periodically resends or gives up on pending acks.
        let ack_pending = Arc::clone(&pending_acks);
        let ack_outbound = outbound_tx.clone();
        let ack_breaker = Arc::clone(&breaker);
        let ack_config = config.clone();
        let ack_loop = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ack_config.ack_check_interval);
            loop {
                ticker.tick().await;
                let mut expired = Vec::new();
                let mut to_resend = Vec::new();
                {
                    let mut pending = ack_pending.lock().unwrap();
                    for (id, entry) in pending.iter_mut() {
                        if entry.sent_at.elapsed() < ack_config.ack_timeout {
                            continue;
                        }
                        if entry.retries < ack_config.max_ack_retries {
                            entry.retries += 1;
                            entry.sent_at = Instant::now();
                            to_resend.push((id.clone(), entry.envelope.clone()));
                        } else {
                            expired.push(id.clone());
                        }
                    }
                    for id in &expired {
                        pending.remove(id);
                    }
                }
                for id in expired {
                    warn!(envelope_id = id, "ws.ack.exhausted");
                    ack_breaker.record_failure();
                }
                for (_, envelope) in to_resend {
                    if let Ok(text) = serde_json::to_string(&envelope) {
                        let _ = ack_outbound.send(Message::Text(text.into()));
                    }
                }
            }
        });

        transport.tasks.lock().await.extend([run_loop, ack_loop]);
        info!(url, "ws.connected");
        Ok(transport)
    }

    /// Send `envelope`, recording it as pending-ack so the ack-check loop
    /// resends it until acknowledged or retries are exhausted.
    pub async fn send_with_ack(&self, envelope: Envelope) -> Result<(), WsError> {
        self.rate_limiter.acquire().await;
        let text = serde_json::to_string(&envelope).map_err(|e| WsError::Malformed(e.to_string()))?;
        self.pending_acks.lock().unwrap().insert(
            envelope.id.clone(),
            PendingAck {
                envelope,
                sent_at: Instant::now(),
                retries: 0,
            },
        );
        self.outbound_tx.send(Message::Text(text.into())).map_err(|_| WsError::Closed)
    }

    /// Send `envelope` and await a response correlated to its id, bounded
    /// by `config.receive_timeout`.
    pub async fn send_and_receive(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope, WsError> {
        self.rate_limiter.acquire().await;
        let (tx, rx) = oneshot::channel();
        self.pending_requests.lock().unwrap().insert(envelope.id.clone(), Waiter::Response(tx));

        let text = serde_json::to_string(&envelope).map_err(|e| WsError::Malformed(e.to_string()))?;
        if self.outbound_tx.send(Message::Text(text.into())).is_err() {
            self.pending_requests.lock().unwrap().remove(&envelope.id);
            return Err(WsError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(waiter_dropped_error(&self.closing)),
            Err(_) => {
                self.pending_requests.lock().unwrap().remove(&envelope.id);
                Err(WsError::Timeout)
            }
        }
    }

    /// Remote URL this transport is connected to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of envelopes awaiting acknowledgement.
    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.lock().unwrap().len()
    }

    /// Tear down all spawned tasks and resolve every outstanding
    /// `send_and_receive` future to [`WsError::Timeout`], per the transport
    /// contract: a deliberate close is not a protocol failure, so waiters
    /// see a timeout rather than a connection error.
    pub async fn close(&self) {
        self.closing.store(true, std::sync::atomic::Ordering::SeqCst);
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        if let Some(handle) = self.current_recv.lock().unwrap().take() {
            handle.abort();
        }
        self.pending_acks.lock().unwrap().clear();
        let mut requests = self.pending_requests.lock().unwrap();
        requests.clear();
        info!(url = self.url, "ws.closed");
    }
}
