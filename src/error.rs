use crate::protocol::{ErrorCode, PeerKind, ProtocolError};

/// Routing failures answered to the offending peer. None of these end the
/// connection.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("connection has not registered")]
    NotRegistered,
    #[error("{kind} peers cannot send `{message}`")]
    UnexpectedMessage {
        kind: PeerKind,
        message: &'static str,
    },
    #[error("requester is not paired with a workspace")]
    NotPaired,
    #[error("no responder for workspace {workspace}")]
    NoResponder { workspace: String },
    #[error("request {request_id} is already in flight")]
    DuplicateRequest { request_id: String },
    #[error("no pending request {request_id}")]
    UnknownRequest { request_id: String },
    #[error("response to {request_id} did not come from the responder paired with {workspace}")]
    WorkspaceMismatch {
        request_id: String,
        workspace: String,
    },
}

impl RoutingError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RoutingError::NotRegistered => ErrorCode::NotRegistered,
            RoutingError::UnexpectedMessage { .. } => ErrorCode::UnexpectedMessage,
            RoutingError::NotPaired => ErrorCode::NotPaired,
            RoutingError::NoResponder { .. } => ErrorCode::NoResponder,
            RoutingError::DuplicateRequest { .. } => ErrorCode::DuplicateRequest,
            RoutingError::UnknownRequest { .. } => ErrorCode::UnknownRequest,
            RoutingError::WorkspaceMismatch { .. } => ErrorCode::WorkspaceMismatch,
        }
    }

    pub fn to_protocol(&self, request_id: Option<&str>) -> ProtocolError {
        let mut error = ProtocolError::new(self.code(), self.to_string());
        if matches!(
            self,
            RoutingError::NotPaired | RoutingError::NoResponder { .. }
        ) {
            error = error.retryable();
        }
        match request_id {
            Some(id) => error.for_request(id),
            None => error,
        }
    }
}

/// Liveness and connection failures on the responder side. Each one lands the
/// state machine in `Error` and is recoverable by enabling again.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("port {port} is occupied by a process that does not speak the broker protocol")]
    PortOccupied { port: u16 },
    #[error("broker did not become reachable on port {port} within {waited_ms} ms")]
    BrokerUnavailable { port: u16, waited_ms: u64 },
    #[error("failed to launch broker: {0}")]
    Launch(String),
    #[error("timed out connecting to broker on port {port}")]
    ConnectTimeout { port: u16 },
    #[error("failed to connect to broker: {0}")]
    Connect(String),
    #[error("no requester paired with {workspace} within {timeout_ms} ms")]
    PairingTimeout { workspace: String, timeout_ms: u64 },
    #[error("connection to broker lost")]
    ConnectionLost,
}

/// Failure of a single requester-side `ask`.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum AskError {
    #[error("broker rejected request: {0}")]
    Rejected(ProtocolError),
    #[error("connection to broker closed before a response arrived")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::RoutingError;
    use crate::protocol::ErrorCode;

    #[test]
    fn routing_errors_map_to_wire_codes() {
        let err = RoutingError::NoResponder {
            workspace: "/proj".into(),
        };
        let wire = err.to_protocol(Some("r1"));
        assert_eq!(wire.code, ErrorCode::NoResponder);
        assert_eq!(wire.request_id.as_deref(), Some("r1"));
        assert!(wire.retryable);
        assert_eq!(wire.message, "no responder for workspace /proj");
    }

    #[test]
    fn mismatch_is_not_retryable() {
        let err = RoutingError::WorkspaceMismatch {
            request_id: "r2".into(),
            workspace: "/proj".into(),
        };
        assert!(!err.to_protocol(None).retryable);
        assert_eq!(err.code(), ErrorCode::WorkspaceMismatch);
    }
}
