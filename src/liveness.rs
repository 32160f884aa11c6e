//! Identify whatever is listening on the broker port.
//!
//! A successful TCP connect proves nothing; the occupant must answer a
//! heartbeat with one of the broker's own envelopes before we treat it as ours.

use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::tungstenite::Message;

use crate::{
    error::ConnectionError,
    protocol::{is_broker_envelope, PeerMessage},
};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1_500);
pub const DEFAULT_SPAWN_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Our broker answered the probe.
    Broker,
    /// Something accepted the connection but did not speak the protocol.
    Foreign { detail: String },
    /// Nothing is listening.
    Unreachable { detail: String },
}

pub fn broker_url(port: u16) -> String {
    format!("ws://127.0.0.1:{port}/")
}

pub async fn probe(port: u16, probe_timeout: Duration) -> ProbeOutcome {
    let started = Instant::now();
    let stream = match timeout(probe_timeout, TcpStream::connect(("127.0.0.1", port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            return ProbeOutcome::Unreachable {
                detail: error.to_string(),
            }
        }
        Err(_) => {
            return ProbeOutcome::Unreachable {
                detail: "tcp connect timed out".to_string(),
            }
        }
    };

    let remaining = probe_timeout.saturating_sub(started.elapsed());
    let outcome = match timeout(remaining, identify(stream, port)).await {
        Ok(outcome) => outcome,
        Err(_) => ProbeOutcome::Foreign {
            detail: format!("no broker envelope within {} ms", probe_timeout.as_millis()),
        },
    };
    tracing::debug!(
        target = "ask_broker::liveness",
        port = port,
        outcome = ?outcome,
        "probed broker port"
    );
    outcome
}

async fn identify(stream: TcpStream, port: u16) -> ProbeOutcome {
    let (ws, _) = match tokio_tungstenite::client_async(broker_url(port), stream).await {
        Ok(pair) => pair,
        Err(error) => {
            return ProbeOutcome::Foreign {
                detail: format!("websocket handshake failed: {error}"),
            }
        }
    };
    let (mut write, mut read) = ws.split();

    let heartbeat = match serde_json::to_string(&PeerMessage::Heartbeat {}) {
        Ok(text) => text,
        Err(error) => {
            return ProbeOutcome::Foreign {
                detail: error.to_string(),
            }
        }
    };
    if let Err(error) = write.send(Message::Text(heartbeat)).await {
        return ProbeOutcome::Foreign {
            detail: format!("probe send failed: {error}"),
        };
    }

    let outcome = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let recognized = serde_json::from_str::<Value>(&text)
                    .map(|value| is_broker_envelope(&value))
                    .unwrap_or(false);
                break if recognized {
                    ProbeOutcome::Broker
                } else {
                    ProbeOutcome::Foreign {
                        detail: "first frame is not a broker envelope".to_string(),
                    }
                };
            }
            Some(Ok(Message::Close(_))) | None => {
                break ProbeOutcome::Foreign {
                    detail: "closed without answering".to_string(),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(error)) => {
                break ProbeOutcome::Foreign {
                    detail: error.to_string(),
                }
            }
        }
    };
    let _ = write.close().await;
    outcome
}

/// Delay before probe attempt `attempt` (zero-based) while a freshly launched
/// broker starts up.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 100u64.saturating_mul(2u64.saturating_pow(attempt));
    let bounded = base_ms.min(2_000);
    let jitter = rand::thread_rng().gen_range(0..=50);
    Duration::from_millis(bounded + jitter)
}

/// Poll the port until our broker answers or `budget` runs out.
pub async fn wait_for_broker(
    port: u16,
    probe_timeout: Duration,
    budget: Duration,
) -> Result<(), ConnectionError> {
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        match probe(port, probe_timeout).await {
            ProbeOutcome::Broker => {
                tracing::info!(
                    target = "ask_broker::liveness",
                    port = port,
                    attempts = attempt + 1,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "broker is answering"
                );
                return Ok(());
            }
            ProbeOutcome::Foreign { detail } => {
                tracing::warn!(
                    target = "ask_broker::liveness",
                    port = port,
                    detail = %detail,
                    "port taken by a foreign process"
                );
                return Err(ConnectionError::PortOccupied { port });
            }
            ProbeOutcome::Unreachable { .. } => {}
        }

        let elapsed = started.elapsed();
        if elapsed >= budget {
            return Err(ConnectionError::BrokerUnavailable {
                port,
                waited_ms: elapsed.as_millis() as u64,
            });
        }
        let delay = backoff_delay(attempt).min(budget - elapsed);
        attempt += 1;
        tokio::time::sleep(delay).await;
    }
}
