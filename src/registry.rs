//! Peer registry, workspace pairing, and request routing.
//!
//! The registry is plain state: every operation applies its whole transition
//! and returns the frames to send, and the transport delivers them after the
//! registry lock is released. A connected peer is always in exactly one place,
//! either its kind's unmatched pool or one [`WorkspacePairing`].

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    error::RoutingError,
    protocol::{BrokerMessage, ErrorCode, InputRequest, InputResponse, PeerKind, ProtocolError},
    workspace::{normalize_workspace_path, shared_workspace},
};

/// Identifies one transport connection for its whole lifetime.
pub type ConnId = u64;

/// Write half of a connection as seen by the registry.
pub type Outbox = mpsc::UnboundedSender<BrokerMessage>;

/// A frame addressed to one connection.
#[derive(Debug)]
pub struct Outbound {
    pub conn: ConnId,
    pub outbox: Outbox,
    pub message: BrokerMessage,
}

impl Outbound {
    pub fn deliver(self) {
        if self.outbox.send(self.message).is_err() {
            tracing::debug!(
                target = "ask_broker::registry",
                conn = self.conn,
                "dropping frame for closed connection"
            );
        }
    }
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub conn: ConnId,
    pub kind: PeerKind,
    pub workspace_id: String,
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
    paired_workspace: Option<String>,
    /// Workspace of the pairing this peer was demoted from, until it pairs again.
    last_workspace: Option<String>,
    outbox: Outbox,
}

impl Peer {
    pub fn paired_workspace(&self) -> Option<&str> {
        self.paired_workspace.as_deref()
    }

    fn send(&self, message: BrokerMessage) -> Outbound {
        Outbound {
            conn: self.conn,
            outbox: self.outbox.clone(),
            message,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspacePairing {
    pub requester: Option<ConnId>,
    pub responder: Option<ConnId>,
}

impl WorkspacePairing {
    fn side(&self, kind: PeerKind) -> Option<ConnId> {
        match kind {
            PeerKind::Requester => self.requester,
            PeerKind::Responder => self.responder,
        }
    }
}

#[derive(Debug, Default)]
struct UnmatchedPool {
    requesters: HashMap<String, ConnId>,
    responders: HashMap<String, ConnId>,
}

impl UnmatchedPool {
    fn of(&self, kind: PeerKind) -> &HashMap<String, ConnId> {
        match kind {
            PeerKind::Requester => &self.requesters,
            PeerKind::Responder => &self.responders,
        }
    }

    fn of_mut(&mut self, kind: PeerKind) -> &mut HashMap<String, ConnId> {
        match kind {
            PeerKind::Requester => &mut self.requesters,
            PeerKind::Responder => &mut self.responders,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: String,
    pub source_workspace: String,
    pub requester: ConnId,
    pub responder: ConnId,
    pub created_at: Instant,
    pub deadline: Option<Instant>,
}

/// Counts reported by the sweeper at debug level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub peers: usize,
    pub pairings: Vec<String>,
    pub unmatched_requesters: usize,
    pub unmatched_responders: usize,
    pub pending_requests: usize,
}

#[derive(Debug, Default)]
pub struct Registry {
    peers: HashMap<ConnId, Peer>,
    sessions: HashMap<String, ConnId>,
    pairings: HashMap<String, WorkspacePairing>,
    unmatched: UnmatchedPool,
    /// Outstanding proposals keyed by (recipient session, candidate session).
    proposals: HashSet<(String, String)>,
    pending: HashMap<String, PendingRequest>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer(&self, conn: ConnId) -> Option<&Peer> {
        self.peers.get(&conn)
    }

    pub fn pairing(&self, workspace: &str) -> Option<&WorkspacePairing> {
        self.pairings.get(workspace)
    }

    pub fn is_unmatched(&self, session_id: &str) -> bool {
        [PeerKind::Requester, PeerKind::Responder]
            .iter()
            .any(|kind| self.unmatched.of(*kind).contains_key(session_id))
    }

    pub fn pending(&self, request_id: &str) -> Option<&PendingRequest> {
        self.pending.get(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut pairings: Vec<String> = self.pairings.keys().cloned().collect();
        pairings.sort();
        RegistrySnapshot {
            peers: self.peers.len(),
            pairings,
            unmatched_requesters: self.unmatched.requesters.len(),
            unmatched_responders: self.unmatched.responders.len(),
            pending_requests: self.pending.len(),
        }
    }

    /// Register (or re-register) the peer behind `conn`, then offer it to
    /// every unmatched peer of the opposite kind.
    pub fn register(
        &mut self,
        conn: ConnId,
        outbox: Outbox,
        kind: PeerKind,
        workspace_id: &str,
        session_id: Option<String>,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        if self.peers.contains_key(&conn) {
            tracing::info!(
                target = "ask_broker::registry",
                conn = conn,
                "replacing existing registration"
            );
            out.extend(self.remove_peer(conn));
        }

        let session_id = match session_id.filter(|id| !id.trim().is_empty()) {
            Some(id) if !self.sessions.contains_key(&id) => id,
            Some(id) => {
                tracing::warn!(
                    target = "ask_broker::registry",
                    conn = conn,
                    session_id = %id,
                    "session id already in use, assigning a fresh one"
                );
                Uuid::new_v4().to_string()
            }
            None => Uuid::new_v4().to_string(),
        };
        let workspace_id = normalize_workspace_path(workspace_id);

        let peer = Peer {
            conn,
            kind,
            workspace_id: workspace_id.clone(),
            session_id: session_id.clone(),
            connected_at: Utc::now(),
            paired_workspace: None,
            last_workspace: None,
            outbox,
        };
        out.push(peer.send(BrokerMessage::Register {
            session_id: session_id.clone(),
            workspace_id: workspace_id.clone(),
        }));
        self.sessions.insert(session_id.clone(), conn);
        self.unmatched
            .of_mut(kind)
            .insert(session_id.clone(), conn);
        self.peers.insert(conn, peer);

        tracing::info!(
            target = "ask_broker::registry",
            conn = conn,
            kind = %kind,
            workspace = %workspace_id,
            session_id = %session_id,
            "peer registered"
        );

        out.extend(self.offer_pairings(conn));
        out
    }

    /// Send a sync proposal about `conn` to every unmatched peer of the
    /// opposite kind.
    fn offer_pairings(&mut self, conn: ConnId) -> Vec<Outbound> {
        let Some(peer) = self.peers.get(&conn) else {
            return Vec::new();
        };
        if peer.paired_workspace.is_some() {
            return Vec::new();
        }

        let mut candidates: Vec<ConnId> = self
            .unmatched
            .of(peer.kind.opposite())
            .values()
            .copied()
            .collect();
        candidates.sort_unstable();

        let mut out = Vec::with_capacity(candidates.len());
        for other_conn in candidates {
            let Some(other) = self.peers.get(&other_conn) else {
                continue;
            };
            self.proposals
                .insert((other.session_id.clone(), peer.session_id.clone()));
            tracing::debug!(
                target = "ask_broker::registry",
                recipient = %other.session_id,
                candidate = %peer.session_id,
                "offering pairing"
            );
            out.push(other.send(BrokerMessage::WorkspaceSyncRequest {
                workspace_id: other.workspace_id.clone(),
                session_id: other.session_id.clone(),
                candidate_workspace_id: peer.workspace_id.clone(),
                candidate_session_id: peer.session_id.clone(),
            }));
        }
        out
    }

    /// Apply a peer's answer to a sync proposal. The first acceptance for a
    /// pair of unmatched sessions commits; anything later is ignored.
    pub fn handle_sync_response(
        &mut self,
        conn: ConnId,
        session_id: &str,
        candidate_session_id: &str,
        accepted: bool,
        final_workspace: Option<&str>,
    ) -> Result<Vec<Outbound>, RoutingError> {
        let peer = self.peers.get(&conn).ok_or(RoutingError::NotRegistered)?;
        if peer.session_id != session_id {
            tracing::warn!(
                target = "ask_broker::registry",
                conn = conn,
                claimed = %session_id,
                actual = %peer.session_id,
                "sync response for a session this connection does not own"
            );
            return Ok(Vec::new());
        }

        let key = (session_id.to_string(), candidate_session_id.to_string());
        if !self.proposals.remove(&key) {
            tracing::debug!(
                target = "ask_broker::registry",
                session_id = %session_id,
                candidate = %candidate_session_id,
                "ignoring sync response with no outstanding proposal"
            );
            return Ok(Vec::new());
        }

        if !accepted {
            tracing::info!(
                target = "ask_broker::registry",
                session_id = %session_id,
                candidate = %candidate_session_id,
                "pairing proposal rejected"
            );
            return Ok(Vec::new());
        }

        let Some(&candidate_conn) = self.sessions.get(candidate_session_id) else {
            tracing::debug!(
                target = "ask_broker::registry",
                candidate = %candidate_session_id,
                "candidate disconnected before pairing committed"
            );
            return Ok(Vec::new());
        };
        let (Some(peer), Some(candidate)) =
            (self.peers.get(&conn), self.peers.get(&candidate_conn))
        else {
            return Ok(Vec::new());
        };
        if peer.kind == candidate.kind
            || peer.paired_workspace.is_some()
            || candidate.paired_workspace.is_some()
        {
            tracing::debug!(
                target = "ask_broker::registry",
                session_id = %session_id,
                candidate = %candidate_session_id,
                "ignoring acceptance for sessions that are no longer both unmatched"
            );
            return Ok(Vec::new());
        }

        let Some(shared) = shared_workspace(&peer.workspace_id, &candidate.workspace_id) else {
            tracing::warn!(
                target = "ask_broker::registry",
                session_id = %session_id,
                candidate = %candidate_session_id,
                "ignoring acceptance for unrelated workspaces"
            );
            return Ok(Vec::new());
        };
        if let Some(proposed) = final_workspace.map(normalize_workspace_path) {
            if proposed != shared {
                tracing::warn!(
                    target = "ask_broker::registry",
                    session_id = %session_id,
                    proposed = %proposed,
                    shared = %shared,
                    "proposed final workspace is not the shared ancestor, using the ancestor"
                );
            }
        }
        let final_workspace = shared;
        let (requester, responder) = match peer.kind {
            PeerKind::Requester => (conn, candidate_conn),
            PeerKind::Responder => (candidate_conn, conn),
        };
        Ok(self.commit_pairing(requester, responder, final_workspace))
    }

    fn commit_pairing(
        &mut self,
        requester: ConnId,
        responder: ConnId,
        workspace: String,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();

        for conn in [requester, responder] {
            if let Some(peer) = self.peers.get(&conn) {
                let session = peer.session_id.clone();
                self.unmatched.of_mut(peer.kind).remove(&session);
                self.proposals
                    .retain(|(recipient, candidate)| recipient != &session && candidate != &session);
            }
        }

        let mut displaced = Vec::new();
        if let Some(previous) = self.pairings.remove(&workspace) {
            for old in [previous.requester, previous.responder].into_iter().flatten() {
                if old != requester && old != responder {
                    displaced.push(old);
                }
            }
            tracing::warn!(
                target = "ask_broker::registry",
                workspace = %workspace,
                displaced = displaced.len(),
                "overwriting existing pairing"
            );
        }

        self.pairings.insert(
            workspace.clone(),
            WorkspacePairing {
                requester: Some(requester),
                responder: Some(responder),
            },
        );
        for conn in [requester, responder] {
            if let Some(peer) = self.peers.get_mut(&conn) {
                peer.paired_workspace = Some(workspace.clone());
                peer.last_workspace = None;
            }
        }

        for old in &displaced {
            self.demote(*old);
        }
        out.extend(self.fail_pending_where(
            |pending| pending.source_workspace == workspace && pending.responder != responder,
            || {
                ProtocolError::new(
                    ErrorCode::ResponderDisconnected,
                    format!("responder for {workspace} was replaced"),
                )
            },
        ));

        let requester_session = self.session_of(requester);
        let responder_session = self.session_of(responder);
        tracing::info!(
            target = "ask_broker::registry",
            workspace = %workspace,
            requester = %requester_session,
            responder = %responder_session,
            "workspace paired"
        );
        let complete = BrokerMessage::WorkspaceSyncComplete {
            final_workspace: workspace.clone(),
            requester_session_id: requester_session,
            responder_session_id: responder_session,
        };
        for conn in [requester, responder] {
            if let Some(peer) = self.peers.get(&conn) {
                out.push(peer.send(complete.clone()));
            }
        }

        for old in displaced {
            out.extend(self.offer_pairings(old));
        }
        out
    }

    /// Move a paired peer back into its unmatched pool.
    fn demote(&mut self, conn: ConnId) {
        let Some(peer) = self.peers.get_mut(&conn) else {
            return;
        };
        peer.last_workspace = peer.paired_workspace.take();
        let (kind, session) = (peer.kind, peer.session_id.clone());
        tracing::info!(
            target = "ask_broker::registry",
            session_id = %session,
            kind = %kind,
            "peer returned to unmatched pool"
        );
        self.unmatched.of_mut(kind).insert(session, conn);
    }

    fn session_of(&self, conn: ConnId) -> String {
        self.peers
            .get(&conn)
            .map(|peer| peer.session_id.clone())
            .unwrap_or_default()
    }

    /// Accept a request from a paired requester and forward it to the paired
    /// responder.
    pub fn submit_request(
        &mut self,
        conn: ConnId,
        request: InputRequest,
        now: Instant,
    ) -> Result<Vec<Outbound>, RoutingError> {
        let peer = self.peers.get(&conn).ok_or(RoutingError::NotRegistered)?;
        if peer.kind != PeerKind::Requester {
            return Err(RoutingError::UnexpectedMessage {
                kind: peer.kind,
                message: "request",
            });
        }
        let Some(workspace) = peer.paired_workspace.clone() else {
            // a requester whose responder left keeps waiting on that workspace
            return Err(match &peer.last_workspace {
                Some(workspace) => RoutingError::NoResponder {
                    workspace: workspace.clone(),
                },
                None => RoutingError::NotPaired,
            });
        };
        let pairing = self
            .pairings
            .get(&workspace)
            .filter(|pairing| pairing.requester == Some(conn))
            .ok_or(RoutingError::NotPaired)?;
        let responder = pairing
            .responder
            .and_then(|id| self.peers.get(&id))
            .ok_or_else(|| RoutingError::NoResponder {
                workspace: workspace.clone(),
            })?;
        if self.pending.contains_key(&request.request_id) {
            return Err(RoutingError::DuplicateRequest {
                request_id: request.request_id,
            });
        }

        let pending = PendingRequest {
            request_id: request.request_id.clone(),
            source_workspace: workspace.clone(),
            requester: conn,
            responder: responder.conn,
            created_at: now,
            deadline: request
                .timeout_ms
                .map(|ms| now + Duration::from_millis(ms)),
        };
        tracing::info!(
            target = "ask_broker::registry",
            request_id = %request.request_id,
            workspace = %workspace,
            input_kind = %request.input_kind,
            "forwarding request"
        );
        let forward = responder.send(BrokerMessage::Request(request));
        self.pending.insert(pending.request_id.clone(), pending);
        Ok(vec![forward])
    }

    /// Resolve a pending request with the paired responder's answer.
    pub fn submit_response(
        &mut self,
        conn: ConnId,
        response: InputResponse,
    ) -> Result<Vec<Outbound>, RoutingError> {
        let peer = self.peers.get(&conn).ok_or(RoutingError::NotRegistered)?;
        if peer.kind != PeerKind::Responder {
            return Err(RoutingError::UnexpectedMessage {
                kind: peer.kind,
                message: "response",
            });
        }
        let Some(pending) = self.pending.get(&response.request_id) else {
            tracing::warn!(
                target = "ask_broker::registry",
                request_id = %response.request_id,
                "response for unknown or already resolved request ignored"
            );
            return Err(RoutingError::UnknownRequest {
                request_id: response.request_id,
            });
        };
        let paired_responder = self
            .pairings
            .get(&pending.source_workspace)
            .and_then(|pairing| pairing.responder);
        if paired_responder != Some(conn) {
            tracing::warn!(
                target = "ask_broker::registry",
                request_id = %response.request_id,
                workspace = %pending.source_workspace,
                conn = conn,
                "rejecting response from a responder outside the request's pairing"
            );
            return Err(RoutingError::WorkspaceMismatch {
                request_id: response.request_id,
                workspace: pending.source_workspace.clone(),
            });
        }

        let Some(pending) = self.pending.remove(&response.request_id) else {
            return Ok(Vec::new());
        };
        match self.peers.get(&pending.requester) {
            Some(requester) => {
                tracing::info!(
                    target = "ask_broker::registry",
                    request_id = %pending.request_id,
                    elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                    "request resolved"
                );
                Ok(vec![requester.send(BrokerMessage::Response(response))])
            }
            None => {
                tracing::warn!(
                    target = "ask_broker::registry",
                    request_id = %pending.request_id,
                    "requester left before its response arrived"
                );
                Ok(Vec::new())
            }
        }
    }

    /// Forget the peer behind `conn`. A surviving pairing partner goes back
    /// to the unmatched pool and is re-offered immediately.
    pub fn disconnect(&mut self, conn: ConnId) -> Vec<Outbound> {
        self.remove_peer(conn)
    }

    fn remove_peer(&mut self, conn: ConnId) -> Vec<Outbound> {
        let Some(peer) = self.peers.remove(&conn) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        self.sessions.remove(&peer.session_id);
        self.proposals.retain(|(recipient, candidate)| {
            recipient != &peer.session_id && candidate != &peer.session_id
        });
        self.unmatched
            .of_mut(peer.kind)
            .remove(&peer.session_id);

        tracing::info!(
            target = "ask_broker::registry",
            conn = conn,
            kind = %peer.kind,
            session_id = %peer.session_id,
            "peer removed"
        );

        let Some(workspace) = peer.paired_workspace else {
            return out;
        };
        let survivor = self
            .pairings
            .remove(&workspace)
            .and_then(|pairing| pairing.side(peer.kind.opposite()));

        if peer.kind == PeerKind::Responder {
            out.extend(self.fail_pending_where(
                |pending| pending.source_workspace == workspace,
                || {
                    ProtocolError::new(
                        ErrorCode::ResponderDisconnected,
                        format!("responder for {workspace} disconnected"),
                    )
                    .retryable()
                },
            ));
        }

        if let Some(survivor) = survivor {
            self.demote(survivor);
            out.extend(self.offer_pairings(survivor));
        }
        out
    }

    /// Fail requests whose workspace lost its pairing, whose requester is
    /// gone, or whose deadline passed.
    pub fn sweep(&mut self, now: Instant) -> Vec<Outbound> {
        let abandoned: Vec<String> = self
            .pending
            .values()
            .filter(|pending| !self.peers.contains_key(&pending.requester))
            .map(|pending| pending.request_id.clone())
            .collect();
        for request_id in &abandoned {
            self.pending.remove(request_id);
        }
        if !abandoned.is_empty() {
            tracing::info!(
                target = "ask_broker::registry",
                count = abandoned.len(),
                "reclaimed requests abandoned by their requester"
            );
        }

        let mut out = self.fail_pending_where(
            |pending| pending.deadline.is_some_and(|deadline| deadline <= now),
            || ProtocolError::new(ErrorCode::RequestExpired, "request deadline elapsed"),
        );
        let live: HashSet<String> = self.pairings.keys().cloned().collect();
        out.extend(self.fail_pending_where(
            |pending| !live.contains(&pending.source_workspace),
            || {
                ProtocolError::new(
                    ErrorCode::WorkspaceUnavailable,
                    "workspace no longer available",
                )
            },
        ));
        out
    }

    fn fail_pending_where<P, E>(&mut self, predicate: P, error: E) -> Vec<Outbound>
    where
        P: Fn(&PendingRequest) -> bool,
        E: Fn() -> ProtocolError,
    {
        let doomed: Vec<String> = self
            .pending
            .values()
            .filter(|pending| predicate(pending))
            .map(|pending| pending.request_id.clone())
            .collect();

        let mut out = Vec::with_capacity(doomed.len());
        for request_id in doomed {
            let Some(pending) = self.pending.remove(&request_id) else {
                continue;
            };
            let failure = error().for_request(&pending.request_id);
            tracing::warn!(
                target = "ask_broker::registry",
                request_id = %pending.request_id,
                workspace = %pending.source_workspace,
                reason = %failure.message,
                "failing pending request"
            );
            if let Some(requester) = self.peers.get(&pending.requester) {
                out.push(requester.send(BrokerMessage::Error(failure)));
            }
        }
        out
    }

    /// Check the placement invariant: every peer is in exactly one of its
    /// kind's unmatched pool or a pairing, and no pairing is empty.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (conn, peer) in &self.peers {
            let in_pool = self.unmatched.of(peer.kind).get(&peer.session_id) == Some(conn);
            let in_pairing = self
                .pairings
                .values()
                .any(|pairing| pairing.side(peer.kind) == Some(*conn));
            if in_pool == in_pairing {
                return Err(format!(
                    "session {} in_pool={in_pool} in_pairing={in_pairing}",
                    peer.session_id
                ));
            }
            if in_pairing != peer.paired_workspace.is_some() {
                return Err(format!(
                    "session {} paired_workspace disagrees with pairings",
                    peer.session_id
                ));
            }
        }
        for (workspace, pairing) in &self.pairings {
            if pairing.requester.is_none() && pairing.responder.is_none() {
                return Err(format!("empty pairing for {workspace}"));
            }
        }
        let pooled = self.unmatched.requesters.len() + self.unmatched.responders.len();
        let paired: usize = self
            .pairings
            .values()
            .map(|pairing| {
                usize::from(pairing.requester.is_some()) + usize::from(pairing.responder.is_some())
            })
            .sum();
        if pooled + paired != self.peers.len() {
            return Err(format!(
                "{} peers but {pooled} pooled and {paired} paired",
                self.peers.len()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::{ConnId, Outbound, Registry};
    use crate::{
        error::RoutingError,
        protocol::{BrokerMessage, ErrorCode, InputRequest, InputResponse, PeerKind},
    };

    struct Harness {
        registry: Registry,
        outboxes: Vec<mpsc::UnboundedReceiver<BrokerMessage>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                registry: Registry::new(),
                outboxes: Vec::new(),
            }
        }

        fn connect(&mut self) -> (ConnId, super::Outbox) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.outboxes.push(rx);
            ((self.outboxes.len() - 1) as ConnId, tx)
        }

        fn register(&mut self, kind: PeerKind, workspace: &str) -> (ConnId, String) {
            let (conn, tx) = self.connect();
            let out = self.registry.register(conn, tx, kind, workspace, None);
            deliver(out);
            let session = self.registry.peer(conn).unwrap().session_id.clone();
            (conn, session)
        }

        fn drain(&mut self, conn: ConnId) -> Vec<BrokerMessage> {
            let rx = &mut self.outboxes[conn as usize];
            let mut messages = Vec::new();
            while let Ok(message) = rx.try_recv() {
                messages.push(message);
            }
            messages
        }

        /// Answer every outstanding proposal addressed to `conn`.
        fn answer_proposals(&mut self, conn: ConnId, accept: bool) {
            for message in self.drain(conn) {
                if let BrokerMessage::WorkspaceSyncRequest {
                    workspace_id,
                    session_id,
                    candidate_session_id,
                    ..
                } = message
                {
                    let out = self
                        .registry
                        .handle_sync_response(
                            conn,
                            &session_id,
                            &candidate_session_id,
                            accept,
                            accept.then_some(workspace_id.as_str()),
                        )
                        .unwrap();
                    deliver(out);
                }
            }
        }

        fn pair(&mut self, workspace: &str) -> (ConnId, ConnId) {
            let (requester, _) = self.register(PeerKind::Requester, workspace);
            let (responder, _) = self.register(PeerKind::Responder, workspace);
            self.answer_proposals(requester, true);
            self.drain(requester);
            self.drain(responder);
            (requester, responder)
        }

        fn request(&mut self, conn: ConnId, id: &str) -> Result<(), RoutingError> {
            let out = self.registry.submit_request(
                conn,
                InputRequest {
                    request_id: id.into(),
                    input_kind: "confirm".into(),
                    payload: json!({"question": "ok?"}),
                    timeout_ms: None,
                },
                Instant::now(),
            )?;
            deliver(out);
            Ok(())
        }

        fn respond(&mut self, conn: ConnId, id: &str) -> Result<(), RoutingError> {
            let out = self.registry.submit_response(
                conn,
                InputResponse {
                    request_id: id.into(),
                    payload: json!({"answer": true}),
                },
            )?;
            deliver(out);
            Ok(())
        }
    }

    fn deliver(out: Vec<Outbound>) {
        for outbound in out {
            outbound.deliver();
        }
    }

    fn sync_complete(messages: &[BrokerMessage]) -> Option<&str> {
        messages.iter().find_map(|message| match message {
            BrokerMessage::WorkspaceSyncComplete {
                final_workspace, ..
            } => Some(final_workspace.as_str()),
            _ => None,
        })
    }

    #[test]
    fn register_acknowledges_with_normalized_workspace() {
        let mut h = Harness::new();
        let (conn, session) = h.register(PeerKind::Responder, "/reg-proj/./sub/");
        let messages = h.drain(conn);
        assert_eq!(
            messages[0],
            BrokerMessage::Register {
                session_id: session.clone(),
                workspace_id: "/reg-proj/sub".into(),
            }
        );
        assert!(h.registry.is_unmatched(&session));
        h.registry.check_invariants().unwrap();
    }

    #[test]
    fn requester_then_responder_pairs_in_one_round() {
        let mut h = Harness::new();
        let (requester, _) = h.register(PeerKind::Requester, "/proj");
        let (responder, _) = h.register(PeerKind::Responder, "/proj");

        // the requester was unmatched, so it receives the proposal
        h.answer_proposals(requester, true);

        assert_eq!(sync_complete(&h.drain(requester)), Some("/proj"));
        assert_eq!(sync_complete(&h.drain(responder)), Some("/proj"));
        let pairing = h.registry.pairing("/proj").unwrap();
        assert_eq!(pairing.requester, Some(requester));
        assert_eq!(pairing.responder, Some(responder));
        h.registry.check_invariants().unwrap();
    }

    #[test]
    fn subdirectory_peers_pair_on_the_ancestor() {
        let mut h = Harness::new();
        let (responder, _) = h.register(PeerKind::Responder, "/mono");
        let (requester, _) = h.register(PeerKind::Requester, "/mono/packages/api");
        h.answer_proposals(responder, true);
        assert_eq!(sync_complete(&h.drain(requester)), Some("/mono"));
    }

    #[test]
    fn rejection_leaves_both_unmatched() {
        let mut h = Harness::new();
        let (requester, req_session) = h.register(PeerKind::Requester, "/one");
        let (_responder, resp_session) = h.register(PeerKind::Responder, "/two");
        h.answer_proposals(requester, false);

        assert!(h.registry.is_unmatched(&req_session));
        assert!(h.registry.is_unmatched(&resp_session));
        assert!(h.registry.pairing("/one").is_none());
        h.registry.check_invariants().unwrap();
    }

    #[test]
    fn later_acceptance_for_committed_sessions_is_ignored() {
        let mut h = Harness::new();
        let (requester, req_session) = h.register(PeerKind::Requester, "/proj");
        let (responder, resp_session) = h.register(PeerKind::Responder, "/proj");
        h.answer_proposals(requester, true);
        h.drain(responder);

        let out = h
            .registry
            .handle_sync_response(requester, &req_session, &resp_session, true, Some("/proj"))
            .unwrap();
        assert!(out.is_empty());
        h.registry.check_invariants().unwrap();
    }

    #[test]
    fn responder_sees_every_unmatched_requester() {
        let mut h = Harness::new();
        let (first, _) = h.register(PeerKind::Requester, "/alpha");
        let (second, _) = h.register(PeerKind::Requester, "/beta");
        h.register(PeerKind::Responder, "/beta");

        let first_msgs = h.drain(first);
        let second_msgs = h.drain(second);
        assert!(first_msgs
            .iter()
            .any(|m| matches!(m, BrokerMessage::WorkspaceSyncRequest { .. })));
        assert!(second_msgs
            .iter()
            .any(|m| matches!(m, BrokerMessage::WorkspaceSyncRequest { .. })));
    }

    #[test]
    fn request_without_pairing_is_rejected() {
        let mut h = Harness::new();
        let (requester, _) = h.register(PeerKind::Requester, "/lonely");
        assert_eq!(h.request(requester, "r1"), Err(RoutingError::NotPaired));
        assert_eq!(h.registry.pending_count(), 0);
    }

    #[test]
    fn requester_left_by_its_responder_gets_no_responder() {
        let mut h = Harness::new();
        let (requester, responder) = h.pair("/proj");
        deliver(h.registry.disconnect(responder));

        assert_eq!(
            h.request(requester, "r1"),
            Err(RoutingError::NoResponder {
                workspace: "/proj".into()
            })
        );

        h.register(PeerKind::Responder, "/proj");
        h.answer_proposals(requester, true);
        h.drain(requester);
        assert!(h.request(requester, "r2").is_ok());
    }

    #[test]
    fn final_workspace_is_pinned_to_the_shared_ancestor() {
        let mut h = Harness::new();
        let (requester, req_session) = h.register(PeerKind::Requester, "/mono/app");
        let (responder, resp_session) = h.register(PeerKind::Responder, "/mono");
        h.drain(requester);

        let out = h
            .registry
            .handle_sync_response(
                requester,
                &req_session,
                &resp_session,
                true,
                Some("/elsewhere"),
            )
            .unwrap();
        deliver(out);

        assert_eq!(sync_complete(&h.drain(responder)), Some("/mono"));
        assert!(h.registry.pairing("/elsewhere").is_none());
        assert!(h.registry.pairing("/mono").is_some());
        h.registry.check_invariants().unwrap();
    }

    #[test]
    fn acceptance_for_unrelated_workspaces_is_ignored() {
        let mut h = Harness::new();
        let (requester, req_session) = h.register(PeerKind::Requester, "/one");
        let (_, resp_session) = h.register(PeerKind::Responder, "/two");

        let out = h
            .registry
            .handle_sync_response(requester, &req_session, &resp_session, true, Some("/one"))
            .unwrap();
        assert!(out.is_empty());
        assert!(h.registry.is_unmatched(&req_session));
        assert!(h.registry.is_unmatched(&resp_session));
        h.registry.check_invariants().unwrap();
    }

    #[test]
    fn responder_cannot_submit_requests() {
        let mut h = Harness::new();
        let (_, responder) = h.pair("/proj");
        assert!(matches!(
            h.request(responder, "r1"),
            Err(RoutingError::UnexpectedMessage { .. })
        ));
    }

    #[test]
    fn unregistered_connection_is_rejected() {
        let mut h = Harness::new();
        let (conn, _tx) = h.connect();
        assert_eq!(h.request(conn, "r1"), Err(RoutingError::NotRegistered));
    }

    #[test]
    fn request_and_response_round_trip() {
        let mut h = Harness::new();
        let (requester, responder) = h.pair("/proj");

        h.request(requester, "r1").unwrap();
        let forwarded = h.drain(responder);
        assert!(matches!(&forwarded[0], BrokerMessage::Request(r) if r.request_id == "r1"));
        assert!(h.registry.pending("r1").is_some());

        h.respond(responder, "r1").unwrap();
        let delivered = h.drain(requester);
        assert!(matches!(&delivered[0], BrokerMessage::Response(r) if r.request_id == "r1"));
        assert!(h.registry.pending("r1").is_none());
    }

    #[test]
    fn duplicate_request_id_is_rejected() {
        let mut h = Harness::new();
        let (requester, _) = h.pair("/proj");
        h.request(requester, "r1").unwrap();
        assert!(matches!(
            h.request(requester, "r1"),
            Err(RoutingError::DuplicateRequest { .. })
        ));
        assert_eq!(h.registry.pending_count(), 1);
    }

    #[test]
    fn second_response_is_a_no_op() {
        let mut h = Harness::new();
        let (requester, responder) = h.pair("/proj");
        h.request(requester, "r1").unwrap();
        h.respond(responder, "r1").unwrap();
        h.drain(requester);

        assert!(matches!(
            h.respond(responder, "r1"),
            Err(RoutingError::UnknownRequest { .. })
        ));
        assert!(h.drain(requester).is_empty());
    }

    #[test]
    fn response_from_other_workspace_is_rejected() {
        let mut h = Harness::new();
        let (requester, _responder) = h.pair("/proj-a");
        let (_, other_responder) = h.pair("/proj-b");
        h.request(requester, "r1").unwrap();

        assert!(matches!(
            h.respond(other_responder, "r1"),
            Err(RoutingError::WorkspaceMismatch { .. })
        ));
        assert!(h.registry.pending("r1").is_some());
    }

    #[test]
    fn responder_disconnect_fails_pending_and_demotes_requester() {
        let mut h = Harness::new();
        let (requester, responder) = h.pair("/proj");
        h.request(requester, "r1").unwrap();

        let out = h.registry.disconnect(responder);
        deliver(out);

        let messages = h.drain(requester);
        assert!(messages.iter().any(|m| matches!(
            m,
            BrokerMessage::Error(e)
                if e.code == ErrorCode::ResponderDisconnected
                    && e.request_id.as_deref() == Some("r1")
        )));
        assert!(h.registry.pending("r1").is_none());
        assert!(h.registry.pairing("/proj").is_none());
        let session = h.registry.peer(requester).unwrap().session_id.clone();
        assert!(h.registry.is_unmatched(&session));
        h.registry.check_invariants().unwrap();
    }

    #[test]
    fn survivor_is_reoffered_to_waiting_peers() {
        let mut h = Harness::new();
        let (requester, responder) = h.pair("/proj");
        let (spare, _) = h.register(PeerKind::Responder, "/proj");
        // the paired requester is not in the pool, so nothing was offered yet
        assert!(h.drain(requester).is_empty());

        deliver(h.registry.disconnect(responder));
        h.answer_proposals(spare, true);
        assert_eq!(sync_complete(&h.drain(requester)), Some("/proj"));
        h.registry.check_invariants().unwrap();
    }

    #[test]
    fn requester_disconnect_leaves_pending_for_sweep() {
        let mut h = Harness::new();
        let (requester, _responder) = h.pair("/proj");
        h.request(requester, "r1").unwrap();

        deliver(h.registry.disconnect(requester));
        assert!(h.registry.pending("r1").is_some());

        deliver(h.registry.sweep(Instant::now()));
        assert!(h.registry.pending("r1").is_none());
    }

    #[test]
    fn sweep_enforces_request_deadlines() {
        let mut h = Harness::new();
        let (requester, _) = h.pair("/proj");
        let now = Instant::now();
        let out = h
            .registry
            .submit_request(
                requester,
                InputRequest {
                    request_id: "r-deadline".into(),
                    input_kind: "text".into(),
                    payload: json!({}),
                    timeout_ms: Some(1_000),
                },
                now,
            )
            .unwrap();
        deliver(out);

        assert!(h.registry.sweep(now).is_empty());
        deliver(h.registry.sweep(now + Duration::from_secs(2)));
        let messages = h.drain(requester);
        assert!(messages.iter().any(|m| matches!(
            m,
            BrokerMessage::Error(e) if e.code == ErrorCode::RequestExpired
        )));
    }

    #[test]
    fn re_registration_replaces_previous_entry() {
        let mut h = Harness::new();
        let (requester, responder) = h.pair("/proj");
        let old_session = h.registry.peer(responder).unwrap().session_id.clone();

        let tx = h.registry.peer(responder).unwrap().outbox.clone();
        deliver(
            h.registry
                .register(responder, tx, PeerKind::Responder, "/proj", None),
        );
        let new_session = h.registry.peer(responder).unwrap().session_id.clone();
        assert_ne!(old_session, new_session);
        assert!(!h.registry.is_unmatched(&old_session));
        assert!(h.registry.is_unmatched(&new_session));
        // the requester was demoted and offered the fresh registration
        let requester_msgs = h.drain(requester);
        assert!(requester_msgs
            .iter()
            .any(|m| matches!(m, BrokerMessage::WorkspaceSyncRequest { candidate_session_id, .. } if candidate_session_id == &new_session)));
        h.registry.check_invariants().unwrap();
    }

    #[test]
    fn overwriting_a_pairing_demotes_the_displaced_peers() {
        let mut h = Harness::new();
        let (requester, responder) = h.pair("/proj");
        let (new_requester, new_req_session) = h.register(PeerKind::Requester, "/proj");
        let (new_responder, new_resp_session) = h.register(PeerKind::Responder, "/proj");

        let out = h
            .registry
            .handle_sync_response(
                new_requester,
                &new_req_session,
                &new_resp_session,
                true,
                Some("/proj"),
            )
            .unwrap();
        deliver(out);

        let pairing = h.registry.pairing("/proj").unwrap();
        assert_eq!(pairing.requester, Some(new_requester));
        assert_eq!(pairing.responder, Some(new_responder));
        for conn in [requester, responder] {
            let session = h.registry.peer(conn).unwrap().session_id.clone();
            assert!(h.registry.is_unmatched(&session));
        }
        h.registry.check_invariants().unwrap();
    }

    #[test]
    fn placement_invariant_holds_through_churn() {
        let mut h = Harness::new();
        let mut live = Vec::new();
        for round in 0..6 {
            let workspace = format!("/churn/{}", round % 2);
            let (requester, responder) = h.pair(&workspace);
            live.push(requester);
            live.push(responder);
            h.registry.check_invariants().unwrap();
            if round % 3 == 2 {
                let victim = live.remove(0);
                deliver(h.registry.disconnect(victim));
                h.registry.check_invariants().unwrap();
            }
        }
        for conn in live {
            deliver(h.registry.disconnect(conn));
            h.registry.check_invariants().unwrap();
        }
        assert_eq!(h.registry.snapshot().peers, 0);
    }
}
