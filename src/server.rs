//! WebSocket transport around the [`Registry`].
//!
//! Each connection gets a writer task fed by an unbounded channel. Inbound
//! frames are applied to the registry under its lock, and the resulting frames
//! are queued only after the lock is released.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};

use crate::{
    liveness::{backoff_delay, probe, ProbeOutcome},
    protocol::{decode_peer_message, BrokerMessage, ErrorCode, PeerMessage, ProtocolError},
    registry::{ConnId, Outbound, Outbox, Registry, RegistrySnapshot},
};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const BIND_ATTEMPTS: u32 = 5;

pub struct Broker {
    registry: Mutex<Registry>,
    next_conn: AtomicU64,
}

impl Broker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::new()),
            next_conn: AtomicU64::new(1),
        })
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", get(broker_ws))
            .with_state(self)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.lock().snapshot()
    }

    /// Fail orphaned and expired requests. Returns how many frames went out.
    pub fn sweep(&self, now: Instant) -> usize {
        let out = self.registry.lock().sweep(now);
        let sent = out.len();
        deliver(out);
        sent
    }

    fn handle_frame(&self, conn: ConnId, outbox: &Outbox, text: &str) {
        let message = match decode_peer_message(text) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(
                    target = "ask_broker::server",
                    conn = conn,
                    error = %error,
                    "rejecting malformed frame"
                );
                let _ = outbox.send(BrokerMessage::Error(error));
                return;
            }
        };
        tracing::debug!(
            target = "ask_broker::server",
            conn = conn,
            message = message.name(),
            "frame received"
        );

        let request_id = match &message {
            PeerMessage::Request(request) => Some(request.request_id.clone()),
            PeerMessage::Response(response) => Some(response.request_id.clone()),
            _ => None,
        };

        let result = {
            let mut registry = self.registry.lock();
            match message {
                PeerMessage::Register {
                    kind,
                    workspace_id,
                    session_id,
                } => Ok(registry.register(conn, outbox.clone(), kind, &workspace_id, session_id)),
                PeerMessage::WorkspaceSyncResponse {
                    session_id,
                    candidate_session_id,
                    accepted,
                    final_workspace,
                } => registry.handle_sync_response(
                    conn,
                    &session_id,
                    &candidate_session_id,
                    accepted,
                    final_workspace.as_deref(),
                ),
                PeerMessage::Request(request) => {
                    registry.submit_request(conn, request, Instant::now())
                }
                PeerMessage::Response(response) => registry.submit_response(conn, response),
                PeerMessage::Heartbeat {} => {
                    let _ = outbox.send(BrokerMessage::Heartbeat {});
                    Ok(Vec::new())
                }
                PeerMessage::ManualDisconnection { reason } => {
                    tracing::info!(
                        target = "ask_broker::server",
                        conn = conn,
                        reason = reason.as_deref().unwrap_or("unspecified"),
                        "peer announced manual disconnection"
                    );
                    Ok(Vec::new())
                }
            }
        };

        match result {
            Ok(out) => deliver(out),
            Err(error) => {
                tracing::warn!(
                    target = "ask_broker::server",
                    conn = conn,
                    code = ?error.code(),
                    error = %error,
                    "routing error"
                );
                let _ = outbox.send(BrokerMessage::Error(
                    error.to_protocol(request_id.as_deref()),
                ));
            }
        }
    }

    fn disconnect(&self, conn: ConnId) {
        let out = self.registry.lock().disconnect(conn);
        deliver(out);
    }
}

fn deliver(out: Vec<Outbound>) {
    for outbound in out {
        outbound.deliver();
    }
}

async fn broker_ws(
    ws: WebSocketUpgrade,
    State(broker): State<Arc<Broker>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(broker, socket))
}

async fn handle_socket(broker: Arc<Broker>, socket: WebSocket) {
    let conn = broker.next_conn.fetch_add(1, Ordering::SeqCst);
    tracing::debug!(target = "ask_broker::server", conn = conn, "connection opened");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<BrokerMessage>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(error) => {
                    tracing::error!(
                        target = "ask_broker::server",
                        conn = conn,
                        error = %error,
                        "failed to encode frame"
                    );
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => broker.handle_frame(conn, &tx, text.as_str()),
            Ok(Message::Binary(_)) => {
                let _ = tx.send(BrokerMessage::Error(ProtocolError::new(
                    ErrorCode::InvalidMessage,
                    "binary frames are not supported",
                )));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(
                    target = "ask_broker::server",
                    conn = conn,
                    error = %error,
                    "socket error"
                );
                break;
            }
        }
    }

    broker.disconnect(conn);
    drop(tx);
    writer.abort();
    tracing::debug!(target = "ask_broker::server", conn = conn, "connection closed");
}

pub fn spawn_sweeper(broker: Arc<Broker>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let failed = broker.sweep(Instant::now());
            let status = broker.snapshot();
            tracing::debug!(
                target = "ask_broker::server",
                peers = status.peers,
                pairings = status.pairings.len(),
                unmatched_requesters = status.unmatched_requesters,
                unmatched_responders = status.unmatched_responders,
                pending = status.pending_requests,
                "broker status"
            );
            if failed > 0 {
                tracing::info!(
                    target = "ask_broker::server",
                    failed = failed,
                    "orphan sweep failed pending requests"
                );
            }
        }
    })
}

/// Serve the broker on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    broker: Arc<Broker>,
    sweep_interval: Duration,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("listener has no local address")?;
    tracing::info!(target = "ask_broker::server", addr = %addr, "broker listening");
    let sweeper = spawn_sweeper(broker.clone(), sweep_interval);
    let result = axum::serve(listener, broker.router())
        .with_graceful_shutdown(shutdown)
        .await;
    sweeper.abort();
    result.context("broker server failed")
}

pub enum BindOutcome {
    Bound(TcpListener),
    /// Another instance of the broker already owns the port.
    AlreadyRunning,
}

/// Bind the broker port. A taken port is fine when its occupant is our own
/// broker; otherwise binding is retried with backoff and finally reported.
pub async fn bind_or_detect(port: u16, probe_timeout: Duration) -> Result<BindOutcome> {
    let mut last_error = None;
    for attempt in 0..BIND_ATTEMPTS {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok(BindOutcome::Bound(listener)),
            Err(error) => {
                match probe(port, probe_timeout).await {
                    ProbeOutcome::Broker => {
                        tracing::info!(
                            target = "ask_broker::server",
                            port = port,
                            "broker already running on port"
                        );
                        return Ok(BindOutcome::AlreadyRunning);
                    }
                    ProbeOutcome::Foreign { detail } => tracing::warn!(
                        target = "ask_broker::server",
                        port = port,
                        attempt = attempt + 1,
                        detail = %detail,
                        "port occupied by another program"
                    ),
                    ProbeOutcome::Unreachable { .. } => tracing::debug!(
                        target = "ask_broker::server",
                        port = port,
                        "port released during probe, retrying bind"
                    ),
                }
                last_error = Some(error);
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        }
    }
    Err(anyhow::anyhow!(
        "failed to bind 127.0.0.1:{port} after {BIND_ATTEMPTS} attempts: {}",
        last_error.map(|e| e.to_string()).unwrap_or_default()
    ))
}
