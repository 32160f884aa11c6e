//! Responder-side connection manager.
//!
//! One manager per editor window. `enable` brings the broker up if needed,
//! connects, registers and waits for pairing; `disable` tears the connection
//! down. Both run under a drop-if-busy operation lock so repeated toggling
//! never interleaves two attempts.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use futures::{future::BoxFuture, FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::{
    net::TcpStream,
    process::Child,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::{
    error::ConnectionError,
    launcher::{terminate_child, BrokerLauncher},
    liveness::{
        broker_url, probe, wait_for_broker, ProbeOutcome, DEFAULT_PROBE_TIMEOUT,
        DEFAULT_SPAWN_WAIT,
    },
    message_queue::{
        MessageQueue, QueuedMessage, DEFAULT_MAX_RETRIES, DEFAULT_QUEUE_CAPACITY,
        DEFAULT_QUEUE_TTL,
    },
    protocol::{BrokerMessage, InputRequest, InputResponse, PeerKind, PeerMessage},
    state::{
        ConnectionState, StateMachine, StateSnapshot, TransitionOutcome, DEFAULT_PAIRING_TIMEOUT,
    },
    workspace::{decide_sync, normalize_workspace_path},
};

const CHILD_GRACE: Duration = Duration::from_secs(2);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shows a request to the human and resolves with their answer.
pub trait Presenter: Send + Sync {
    fn present(&self, input_kind: &str, payload: Value) -> BoxFuture<'static, anyhow::Result<Value>>;
}

impl<F, Fut> Presenter for F
where
    F: Fn(String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    fn present(&self, input_kind: &str, payload: Value) -> BoxFuture<'static, anyhow::Result<Value>> {
        self(input_kind.to_string(), payload).boxed()
    }
}

#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub port: u16,
    pub workspace: String,
    pub pairing_timeout: Duration,
    pub probe_timeout: Duration,
    pub spawn_wait: Duration,
    pub connect_timeout: Duration,
    pub queue_capacity: usize,
    pub queue_ttl: Duration,
    pub max_retries: u32,
}

impl ResponderConfig {
    pub fn new(port: u16, workspace: &str) -> Self {
        Self {
            port,
            workspace: normalize_workspace_path(workspace),
            pairing_timeout: DEFAULT_PAIRING_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            spawn_wait: DEFAULT_SPAWN_WAIT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            queue_ttl: DEFAULT_QUEUE_TTL,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    /// The sequence ran to its end, successfully or into `Error`.
    Completed,
    /// Another enable or disable was already running; nothing happened.
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
}

struct Link {
    generation: u64,
    tx: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

pub struct ConnectionManager {
    config: ResponderConfig,
    machine: Arc<StateMachine>,
    operation: tokio::sync::Mutex<()>,
    link: Mutex<Option<Link>>,
    link_generation: AtomicU64,
    queue: Mutex<MessageQueue>,
    launcher: Arc<dyn BrokerLauncher>,
    presenter: Arc<dyn Presenter>,
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
    session_id: Mutex<Option<String>>,
    paired_workspace: Mutex<Option<String>>,
}

impl ConnectionManager {
    pub fn new(
        config: ResponderConfig,
        launcher: Arc<dyn BrokerLauncher>,
        presenter: Arc<dyn Presenter>,
    ) -> Arc<Self> {
        let machine = StateMachine::new(config.workspace.clone(), config.pairing_timeout);
        let child: Arc<tokio::sync::Mutex<Option<Child>>> = Arc::new(tokio::sync::Mutex::new(None));

        let spawned = child.clone();
        machine.set_cleanup(Arc::new(move || {
            let spawned = spawned.clone();
            async move {
                if let Some(mut child) = spawned.lock().await.take() {
                    tracing::info!(
                        target = "ask_broker::responder",
                        pid = child.id().unwrap_or_default(),
                        "stopping broker started by this window"
                    );
                    terminate_child(&mut child, CHILD_GRACE).await;
                }
            }
            .boxed()
        }));

        let queue = MessageQueue::new(config.queue_capacity, config.queue_ttl, config.max_retries);
        Arc::new(Self {
            config,
            machine,
            operation: tokio::sync::Mutex::new(()),
            link: Mutex::new(None),
            link_generation: AtomicU64::new(0),
            queue: Mutex::new(queue),
            launcher,
            presenter,
            child,
            session_id: Mutex::new(None),
            paired_workspace: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.machine.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.machine.subscribe()
    }

    pub fn transitions(&self) -> tokio::sync::broadcast::Receiver<StateSnapshot> {
        self.machine.transitions()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    pub fn paired_workspace(&self) -> Option<String> {
        self.paired_workspace.lock().clone()
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub async fn enable(self: &Arc<Self>) -> OperationOutcome {
        let Ok(_operation) = self.operation.try_lock() else {
            tracing::warn!(
                target = "ask_broker::responder",
                "enable ignored, another operation is in progress"
            );
            return OperationOutcome::Busy;
        };

        if let Err(error) = self.run_enable().await {
            tracing::warn!(
                target = "ask_broker::responder",
                error = %error,
                "enable failed"
            );
            self.close_link();
            self.machine.fail(&error).await;
        }
        OperationOutcome::Completed
    }

    async fn run_enable(self: &Arc<Self>) -> Result<(), ConnectionError> {
        match self.machine.state() {
            ConnectionState::Connected | ConnectionState::Paired => {
                tracing::debug!(target = "ask_broker::responder", "already enabled");
                return Ok(());
            }
            _ => {}
        }
        match self.machine.transition(ConnectionState::Starting, None).await {
            TransitionOutcome::Applied | TransitionOutcome::Unchanged => {}
            outcome => {
                tracing::warn!(
                    target = "ask_broker::responder",
                    outcome = ?outcome,
                    "could not enter starting state"
                );
                return Ok(());
            }
        }

        self.ensure_broker().await?;
        let ws = self.connect().await?;
        self.attach(ws);

        if self
            .machine
            .transition(ConnectionState::Connected, None)
            .await
            != TransitionOutcome::Applied
        {
            // disconnected while starting
            self.close_link();
            return Ok(());
        }
        self.send_now(&PeerMessage::Register {
            kind: PeerKind::Responder,
            workspace_id: self.config.workspace.clone(),
            session_id: None,
        })?;

        let mut rx = self.machine.subscribe();
        loop {
            let state = rx.borrow_and_update().state;
            if matches!(
                state,
                ConnectionState::Paired | ConnectionState::Error | ConnectionState::Disconnected
            ) {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn ensure_broker(&self) -> Result<(), ConnectionError> {
        let port = self.config.port;
        match probe(port, self.config.probe_timeout).await {
            ProbeOutcome::Broker => Ok(()),
            ProbeOutcome::Foreign { detail } => {
                tracing::warn!(
                    target = "ask_broker::responder",
                    port = port,
                    detail = %detail,
                    "broker port is held by another program"
                );
                Err(ConnectionError::PortOccupied { port })
            }
            ProbeOutcome::Unreachable { .. } => {
                let launched = self
                    .launcher
                    .launch(port)
                    .map_err(|error| ConnectionError::Launch(format!("{error:#}")))?;
                if let Some(child) = launched {
                    *self.child.lock().await = Some(child);
                }
                wait_for_broker(port, self.config.probe_timeout, self.config.spawn_wait).await
            }
        }
    }

    async fn connect(&self) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, ConnectionError> {
        let port = self.config.port;
        let url = broker_url(port);
        let (ws, _) = timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| ConnectionError::ConnectTimeout { port })?
        .map_err(|error| ConnectionError::Connect(error.to_string()))?;
        tracing::info!(target = "ask_broker::responder", url = %url, "connected to broker");
        Ok(ws)
    }

    fn attach(self: &Arc<Self>, ws: WebSocketStream<MaybeTlsStream<TcpStream>>) {
        let generation = self.link_generation.fetch_add(1, Ordering::SeqCst) + 1;
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

        let manager: Weak<Self> = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let Some(manager) = manager.upgrade() else {
                            return;
                        };
                        manager.handle_broker_frame(&text).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(
                            target = "ask_broker::responder",
                            error = %error,
                            "broker socket error"
                        );
                        break;
                    }
                }
            }
            if let Some(manager) = manager.upgrade() {
                manager.link_closed(generation).await;
            }
        });

        let previous = self.link.lock().replace(Link {
            generation,
            tx,
            reader,
        });
        if let Some(previous) = previous {
            previous.reader.abort();
        }
    }

    async fn link_closed(self: &Arc<Self>, generation: u64) {
        let current = {
            let mut link = self.link.lock();
            match link.as_ref() {
                Some(live) if live.generation == generation => link.take().is_some(),
                _ => false,
            }
        };
        if !current {
            return;
        }
        if matches!(
            self.machine.state(),
            ConnectionState::Connected | ConnectionState::Paired
        ) {
            self.machine.fail(&ConnectionError::ConnectionLost).await;
        }
    }

    fn close_link(&self) {
        if let Some(link) = self.link.lock().take() {
            // dropping the sender lets the writer flush and close
            link.reader.abort();
        }
    }

    async fn handle_broker_frame(self: &Arc<Self>, text: &str) {
        let message: BrokerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(
                    target = "ask_broker::responder",
                    error = %error,
                    "ignoring unreadable broker frame"
                );
                return;
            }
        };

        match message {
            BrokerMessage::Register {
                session_id,
                workspace_id,
            } => {
                tracing::info!(
                    target = "ask_broker::responder",
                    session_id = %session_id,
                    workspace = %workspace_id,
                    "registered with broker"
                );
                *self.session_id.lock() = Some(session_id);
            }
            BrokerMessage::WorkspaceSyncRequest {
                workspace_id,
                session_id,
                candidate_workspace_id,
                candidate_session_id,
            } => {
                let decision = decide_sync(&workspace_id, &candidate_workspace_id);
                let reply = PeerMessage::WorkspaceSyncResponse {
                    session_id,
                    candidate_session_id,
                    accepted: decision.accepted,
                    final_workspace: decision.final_workspace,
                };
                if let Err(error) = self.send_now(&reply) {
                    tracing::warn!(
                        target = "ask_broker::responder",
                        error = %error,
                        "failed to answer sync proposal"
                    );
                }
            }
            BrokerMessage::WorkspaceSyncComplete {
                final_workspace,
                requester_session_id,
                ..
            } => {
                tracing::info!(
                    target = "ask_broker::responder",
                    workspace = %final_workspace,
                    requester = %requester_session_id,
                    "paired with requester"
                );
                *self.paired_workspace.lock() = Some(final_workspace);
                self.machine
                    .transition(ConnectionState::Paired, None)
                    .await;
                if self.machine.state() == ConnectionState::Paired {
                    self.drain_queue();
                }
            }
            BrokerMessage::Request(request) => {
                if self.machine.state() == ConnectionState::Paired {
                    self.present(request);
                } else {
                    tracing::info!(
                        target = "ask_broker::responder",
                        request_id = %request.request_id,
                        "buffering request until pairing completes"
                    );
                    self.queue
                        .lock()
                        .push(QueuedMessage::Inbound(request), Instant::now());
                }
            }
            BrokerMessage::Error(error) => {
                tracing::warn!(
                    target = "ask_broker::responder",
                    code = ?error.code,
                    message = %error.message,
                    request_id = error.request_id.as_deref().unwrap_or(""),
                    "broker reported an error"
                );
            }
            BrokerMessage::Heartbeat {} | BrokerMessage::Response(_) => {}
        }
    }

    fn present(self: &Arc<Self>, request: InputRequest) {
        let manager = Arc::clone(self);
        let presenter = self.presenter.clone();
        tokio::spawn(async move {
            let InputRequest {
                request_id,
                input_kind,
                payload,
                ..
            } = request;
            let payload = match presenter.present(&input_kind, payload).await {
                Ok(answer) => answer,
                Err(error) => {
                    tracing::warn!(
                        target = "ask_broker::responder",
                        request_id = %request_id,
                        error = %error,
                        "presentation did not produce an answer"
                    );
                    json!({"cancelled": true, "reason": format!("{error:#}")})
                }
            };
            manager.send(PeerMessage::Response(InputResponse {
                request_id,
                payload,
            }));
        });
    }

    /// Send now when paired with nothing buffered ahead, otherwise buffer for
    /// replay once pairing completes.
    pub fn send(&self, message: PeerMessage) -> SendOutcome {
        let mut queue = self.queue.lock();
        if self.machine.state() == ConnectionState::Paired
            && queue.is_empty()
            && self.send_now(&message).is_ok()
        {
            return SendOutcome::Sent;
        }
        queue.push(QueuedMessage::Outbound(message), Instant::now());
        SendOutcome::Queued
    }

    fn send_now(&self, message: &PeerMessage) -> Result<(), ConnectionError> {
        let text = serde_json::to_string(message)
            .map_err(|error| ConnectionError::Connect(error.to_string()))?;
        let link = self.link.lock();
        let link = link.as_ref().ok_or(ConnectionError::ConnectionLost)?;
        link.tx
            .send(Message::Text(text))
            .map_err(|_| ConnectionError::ConnectionLost)
    }

    fn drain_queue(self: &Arc<Self>) {
        let mut inbound = Vec::new();
        {
            let mut queue = self.queue.lock();
            let (entries, report) = queue.drain_live(Instant::now());
            if report.expired > 0 {
                tracing::info!(
                    target = "ask_broker::responder",
                    expired = report.expired,
                    "discarded expired buffered messages"
                );
            }
            let delivered = entries.len();
            for entry in entries {
                match &entry.message {
                    QueuedMessage::Inbound(request) => inbound.push(request.clone()),
                    QueuedMessage::Outbound(message) => {
                        if self.send_now(message).is_err() {
                            if let Err(dropped) = queue.requeue(entry) {
                                tracing::warn!(
                                    target = "ask_broker::responder",
                                    retries = dropped.retry_count,
                                    "dropping buffered message after retry limit"
                                );
                            }
                        }
                    }
                }
            }
            tracing::debug!(
                target = "ask_broker::responder",
                delivered = delivered,
                remaining = queue.len(),
                "drained message queue"
            );
        }
        for request in inbound {
            self.present(request);
        }
    }

    pub async fn disable(self: &Arc<Self>) -> OperationOutcome {
        let Ok(_operation) = self.operation.try_lock() else {
            tracing::warn!(
                target = "ask_broker::responder",
                "disable ignored, another operation is in progress"
            );
            return OperationOutcome::Busy;
        };
        self.disconnect("disabled by user").await;
        OperationOutcome::Completed
    }

    /// Best-effort teardown for window close, independent of the operation lock.
    pub async fn shutdown(self: &Arc<Self>) {
        self.disconnect("window closed").await;
    }

    async fn disconnect(self: &Arc<Self>, reason: &str) {
        let _ = self.send_now(&PeerMessage::ManualDisconnection {
            reason: Some(reason.to_string()),
        });
        self.close_link();
        // entering Disconnected runs cleanup, which stops a broker this window spawned
        self.machine
            .transition(ConnectionState::Disconnected, Some(reason.to_string()))
            .await;
        *self.paired_workspace.lock() = None;
        let dropped = self.queue.lock().clear();
        if dropped > 0 {
            tracing::info!(
                target = "ask_broker::responder",
                dropped = dropped,
                "cleared buffered messages on disconnect"
            );
        }
    }
}
