//! Shared error types for TabBridge.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for broker, client and agent.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The transport is absent or was lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Bad credentials, unknown or duplicate identifier, unsupported kind.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// No live agent matches the requested target.
    #[error("Routing error: {0}")]
    Routing(String),

    /// Malformed or out-of-order frame, duplicate registration, double response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A response arrived from a session that does not own the request.
    #[error("Hijack detected: {0}")]
    Hijack(String),

    /// Path resolution or invocation failed on the remote side.
    #[error("Remote execution failed: {0}")]
    RemoteExecution(String),

    /// The remote operation completed but the underlying API reported failure.
    #[error("Application error: {0}")]
    Application(String),

    /// The connection closed while the request was in flight.
    #[error("Disconnected")]
    Disconnected,

    /// The operation was cancelled before it completed.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The cross-process port lock could not be acquired.
    #[error("Port lock error: {0}")]
    Lock(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Alias for Result with BridgeError.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Wire name of an error taxonomy entry, carried as `errorKind` on failed
/// responses so the requester can rebuild the right [`BridgeError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Authentication,
    Routing,
    Protocol,
    Hijack,
    RemoteExecution,
    Application,
}

impl BridgeError {
    /// Taxonomy entry for this error, as sent on the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Connection(_) | BridgeError::Disconnected | BridgeError::Io(_) => {
                ErrorKind::Connection
            }
            BridgeError::Authentication(_) => ErrorKind::Authentication,
            BridgeError::Routing(_) => ErrorKind::Routing,
            BridgeError::Protocol(_) | BridgeError::Json(_) => ErrorKind::Protocol,
            BridgeError::Hijack(_) => ErrorKind::Hijack,
            BridgeError::Application(_) => ErrorKind::Application,
            BridgeError::RemoteExecution(_)
            | BridgeError::Cancelled(_)
            | BridgeError::Lock(_)
            | BridgeError::Config(_) => ErrorKind::RemoteExecution,
        }
    }

    /// Rebuild an error from a failed response's `error` text and optional kind.
    ///
    /// Responses from peers that do not send `errorKind` are treated as
    /// remote execution failures.
    pub fn from_wire(kind: Option<ErrorKind>, message: String) -> Self {
        match kind.unwrap_or(ErrorKind::RemoteExecution) {
            ErrorKind::Connection => BridgeError::Connection(message),
            ErrorKind::Authentication => BridgeError::Authentication(message),
            ErrorKind::Routing => BridgeError::Routing(message),
            ErrorKind::Protocol => BridgeError::Protocol(message),
            ErrorKind::Hijack => BridgeError::Hijack(message),
            ErrorKind::RemoteExecution => BridgeError::RemoteExecution(message),
            ErrorKind::Application => BridgeError::Application(message),
        }
    }

    /// Message text without the variant prefix, for the `error` field of a
    /// response frame.
    pub fn wire_message(&self) -> String {
        match self {
            BridgeError::Connection(m)
            | BridgeError::Authentication(m)
            | BridgeError::Routing(m)
            | BridgeError::Protocol(m)
            | BridgeError::Hijack(m)
            | BridgeError::RemoteExecution(m)
            | BridgeError::Application(m)
            | BridgeError::Cancelled(m)
            | BridgeError::Lock(m)
            | BridgeError::Config(m) => m.clone(),
            BridgeError::Disconnected => "disconnected".to_string(),
            BridgeError::Io(e) => e.to_string(),
            BridgeError::Json(e) => e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip_preserves_kind() {
        let err = BridgeError::Routing("agent chrome is not connected".to_string());
        let rebuilt = BridgeError::from_wire(Some(err.kind()), err.wire_message());
        assert!(matches!(rebuilt, BridgeError::Routing(m) if m.contains("not connected")));
    }

    #[test]
    fn test_missing_kind_defaults_to_remote_execution() {
        let err = BridgeError::from_wire(None, "boom".to_string());
        assert!(matches!(err, BridgeError::RemoteExecution(_)));
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::RemoteExecution).unwrap();
        assert_eq!(json, "\"remote_execution\"");
    }
}
