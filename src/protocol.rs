use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    Requester,
    Responder,
}

impl PeerKind {
    pub fn opposite(self) -> Self {
        match self {
            PeerKind::Requester => PeerKind::Responder,
            PeerKind::Responder => PeerKind::Requester,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PeerKind::Requester => "requester",
            PeerKind::Responder => "responder",
        }
    }
}

impl fmt::Display for PeerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A human-input request as it travels requester → broker → responder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
    pub request_id: String,
    pub input_kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputResponse {
    pub request_id: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    InvalidMessage,
    UnexpectedMessage,
    NotRegistered,
    NotPaired,
    NoResponder,
    DuplicateRequest,
    UnknownRequest,
    WorkspaceMismatch,
    ResponderDisconnected,
    WorkspaceUnavailable,
    RequestExpired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ProtocolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
            request_id: None,
        }
    }

    pub fn for_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Frames a peer may send to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerMessage {
    #[serde(rename_all = "camelCase")]
    Register {
        kind: PeerKind,
        workspace_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    WorkspaceSyncResponse {
        session_id: String,
        candidate_session_id: String,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        final_workspace: Option<String>,
    },
    Request(InputRequest),
    Response(InputResponse),
    Heartbeat {},
    ManualDisconnection {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl PeerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::Register { .. } => "register",
            PeerMessage::WorkspaceSyncResponse { .. } => "workspace-sync-response",
            PeerMessage::Request(_) => "request",
            PeerMessage::Response(_) => "response",
            PeerMessage::Heartbeat {} => "heartbeat",
            PeerMessage::ManualDisconnection { .. } => "manual-disconnection",
        }
    }
}

/// Frames the broker sends to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BrokerMessage {
    /// Registration acknowledgment carrying the normalized workspace id.
    #[serde(rename_all = "camelCase")]
    Register {
        session_id: String,
        workspace_id: String,
    },
    #[serde(rename_all = "camelCase")]
    WorkspaceSyncRequest {
        workspace_id: String,
        session_id: String,
        candidate_workspace_id: String,
        candidate_session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    WorkspaceSyncComplete {
        final_workspace: String,
        requester_session_id: String,
        responder_session_id: String,
    },
    Request(InputRequest),
    Response(InputResponse),
    Heartbeat {},
    Error(ProtocolError),
}

/// Decode one inbound frame, classifying failures as protocol errors so the
/// caller can answer them without dropping the connection.
pub fn decode_peer_message(text: &str) -> Result<PeerMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|error| {
        ProtocolError::new(
            ErrorCode::InvalidMessage,
            format!("frame is not valid JSON: {error}"),
        )
    })?;
    let msg_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ProtocolError::new(ErrorCode::InvalidMessage, "frame has no `type` field")
        })?
        .to_string();
    serde_json::from_value(value).map_err(|error| {
        ProtocolError::new(
            ErrorCode::InvalidMessage,
            format!("malformed `{msg_type}` frame: {error}"),
        )
    })
}

/// True when `value` has the shape of a frame our broker emits in answer to a
/// probe. Anything else on the port belongs to some other program.
pub fn is_broker_envelope(value: &Value) -> bool {
    let Ok(message) = serde_json::from_value::<BrokerMessage>(value.clone()) else {
        return false;
    };
    matches!(
        message,
        BrokerMessage::Register { .. } | BrokerMessage::Heartbeat {} | BrokerMessage::Response(_)
    )
}
