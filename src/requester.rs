//! Requester-side client: register for a workspace, answer pairing
//! proposals, and ask questions that the paired responder answers.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::{
    error::AskError,
    protocol::{BrokerMessage, InputRequest, PeerKind, PeerMessage},
    workspace::{decide_sync, normalize_workspace_path},
};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value, AskError>>>>>;

pub struct RequesterClient {
    workspace: String,
    tx: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    session_id: watch::Receiver<Option<String>>,
    paired: watch::Receiver<Option<String>>,
    reader: JoinHandle<()>,
}

impl RequesterClient {
    pub async fn connect(url: &str, workspace: &str) -> Result<Self> {
        let workspace = normalize_workspace_path(workspace);
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("failed to connect to broker at {url}"))?;
        let (mut write, mut read) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if write.send(message).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (session_tx, session_id) = watch::channel(None);
        let (paired_tx, paired) = watch::channel(None);

        let reader_pending = pending.clone();
        let reply = tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(error) => {
                        tracing::warn!(
                            target = "ask_broker::requester",
                            error = %error,
                            "broker socket error"
                        );
                        break;
                    }
                };
                let message: BrokerMessage = match serde_json::from_str(&text) {
                    Ok(message) => message,
                    Err(error) => {
                        tracing::warn!(
                            target = "ask_broker::requester",
                            error = %error,
                            "ignoring unreadable broker frame"
                        );
                        continue;
                    }
                };
                handle_frame(message, &reply, &reader_pending, &session_tx, &paired_tx);
            }

            let _ = paired_tx.send(None);
            let abandoned: Vec<_> = reader_pending.lock().drain().collect();
            for (_, waiter) in abandoned {
                let _ = waiter.send(Err(AskError::Closed));
            }
        });

        let client = Self {
            workspace,
            tx,
            pending,
            session_id,
            paired,
            reader,
        };
        client.send(&PeerMessage::Register {
            kind: PeerKind::Requester,
            workspace_id: client.workspace.clone(),
            session_id: None,
        })?;
        Ok(client)
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.borrow().clone()
    }

    pub fn paired_workspace(&self) -> Option<String> {
        self.paired.borrow().clone()
    }

    /// Wait until the broker confirms a pairing. Returns the agreed workspace.
    pub async fn wait_paired(&self, within: Duration) -> Result<String> {
        let mut paired = self.paired.clone();
        let workspace = tokio::time::timeout(within, paired.wait_for(Option::is_some))
            .await
            .with_context(|| format!("no responder paired within {} ms", within.as_millis()))?
            .context("connection to broker closed")?
            .clone();
        workspace.context("pairing state cleared")
    }

    /// Submit one request and wait for its answer. There is no client-side
    /// timeout; pass `timeout_ms` to have the broker expire it instead.
    pub async fn ask(
        &self,
        input_kind: &str,
        payload: Value,
        timeout_ms: Option<u64>,
    ) -> Result<Value, AskError> {
        let request_id = Uuid::new_v4().to_string();
        let (waiter, answer) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), waiter);

        let request = PeerMessage::Request(InputRequest {
            request_id: request_id.clone(),
            input_kind: input_kind.to_string(),
            payload,
            timeout_ms,
        });
        if self.send(&request).is_err() {
            self.pending.lock().remove(&request_id);
            return Err(AskError::Closed);
        }
        tracing::debug!(
            target = "ask_broker::requester",
            request_id = %request_id,
            input_kind = %input_kind,
            "request submitted"
        );

        answer.await.unwrap_or(Err(AskError::Closed))
    }

    pub fn close(self) {
        let _ = self.tx.send(Message::Close(None));
        self.reader.abort();
    }

    fn send(&self, message: &PeerMessage) -> Result<()> {
        let text = serde_json::to_string(message).context("failed to encode frame")?;
        self.tx
            .send(Message::Text(text))
            .map_err(|_| anyhow::anyhow!("connection to broker closed"))
    }
}

fn handle_frame(
    message: BrokerMessage,
    reply: &mpsc::UnboundedSender<Message>,
    pending: &PendingMap,
    session_tx: &watch::Sender<Option<String>>,
    paired_tx: &watch::Sender<Option<String>>,
) {
    match message {
        BrokerMessage::Register { session_id, .. } => {
            let _ = session_tx.send(Some(session_id));
        }
        BrokerMessage::WorkspaceSyncRequest {
            workspace_id,
            session_id,
            candidate_workspace_id,
            candidate_session_id,
        } => {
            let decision = decide_sync(&workspace_id, &candidate_workspace_id);
            let response = PeerMessage::WorkspaceSyncResponse {
                session_id,
                candidate_session_id,
                accepted: decision.accepted,
                final_workspace: decision.final_workspace,
            };
            if let Ok(text) = serde_json::to_string(&response) {
                let _ = reply.send(Message::Text(text));
            }
        }
        BrokerMessage::WorkspaceSyncComplete {
            final_workspace, ..
        } => {
            tracing::info!(
                target = "ask_broker::requester",
                workspace = %final_workspace,
                "paired with responder"
            );
            let _ = paired_tx.send(Some(final_workspace));
        }
        BrokerMessage::Response(response) => {
            match pending.lock().remove(&response.request_id) {
                Some(waiter) => {
                    let _ = waiter.send(Ok(response.payload));
                }
                None => tracing::warn!(
                    target = "ask_broker::requester",
                    request_id = %response.request_id,
                    "response for a request we are not waiting on"
                ),
            }
        }
        BrokerMessage::Error(error) => {
            let waiter = error
                .request_id
                .as_deref()
                .and_then(|id| pending.lock().remove(id));
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(Err(AskError::Rejected(error)));
                }
                None => tracing::warn!(
                    target = "ask_broker::requester",
                    code = ?error.code,
                    message = %error.message,
                    "broker reported an error"
                ),
            }
        }
        BrokerMessage::Request(_) | BrokerMessage::Heartbeat {} => {}
    }
}
