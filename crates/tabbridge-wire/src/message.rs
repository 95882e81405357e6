//! Wire protocol frames.
//!
//! Every WebSocket text frame carries one JSON object with a `type`
//! discriminator. Field names follow the protocol's camelCase spelling.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tabbridge_types::{BridgeError, BridgeResult, ErrorKind, PathSegment, RequestContent, Target};

/// Close code: malformed frame or out-of-order registration.
pub const CLOSE_PROTOCOL: u16 = 1002;
/// Close code: broker shutting down.
pub const CLOSE_SHUTDOWN: u16 = 1001;
/// Close code: normal client-initiated close.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code: registration rejected.
pub const CLOSE_AUTH: u16 = 4001;
/// Close code: response from a session that does not own the request.
pub const CLOSE_HIJACK: u16 = 4003;

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// First frame of every session.
    #[serde(rename = "register")]
    Register { info: RegisterInfo },
    /// Client → broker (with `target`) or broker → agent (without).
    #[serde(rename = "request")]
    Request {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Target>,
        #[serde(rename = "requestId")]
        request_id: u64,
        content: RequestContent,
    },
    #[serde(rename = "response")]
    Response {
        #[serde(rename = "responseId")]
        response_id: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(
            rename = "errorKind",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        error_kind: Option<ErrorKind>,
    },
    #[serde(rename = "subscribe")]
    Subscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Target>,
        #[serde(rename = "eventPath")]
        event_path: Vec<PathSegment>,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Target>,
        #[serde(rename = "eventPath")]
        event_path: Vec<PathSegment>,
    },
    #[serde(rename = "event")]
    Event(EventFrame),
}

/// Registration payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RegisterInfo {
    Client {
        username: String,
        #[serde(default)]
        key: String,
    },
    Agent {
        /// Kept as text so an unsupported kind is an authentication
        /// failure rather than a malformed frame.
        kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identifier: Option<String>,
    },
}

/// An event emitted by an agent and fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    #[serde(rename = "eventPath")]
    pub event_path: Vec<PathSegment>,
    #[serde(default)]
    pub args: Vec<Value>,
    /// The originating agent, stamped by the broker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Target>,
}

impl Frame {
    /// A successful response.
    pub fn success(response_id: u64, content: Value) -> Self {
        Frame::Response {
            response_id,
            success: true,
            content: Some(content),
            error: None,
            error_kind: None,
        }
    }

    /// A failed response carrying the error's taxonomy entry.
    pub fn failure(response_id: u64, error: &BridgeError) -> Self {
        Frame::Response {
            response_id,
            success: false,
            content: None,
            error: Some(error.wire_message()),
            error_kind: Some(error.kind()),
        }
    }

    /// Build a response frame from an outcome.
    pub fn outcome(response_id: u64, result: BridgeResult<Value>) -> Self {
        match result {
            Ok(content) => Frame::success(response_id, content),
            Err(e) => Frame::failure(response_id, &e),
        }
    }

    /// The `type` discriminator, for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Register { .. } => "register",
            Frame::Request { .. } => "request",
            Frame::Response { .. } => "response",
            Frame::Subscribe { .. } => "subscribe",
            Frame::Unsubscribe { .. } => "unsubscribe",
            Frame::Event(_) => "event",
        }
    }

    pub fn encode(&self) -> BridgeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> BridgeResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| BridgeError::Protocol(format!("malformed frame: {e}")))
    }
}

/// Turn a response frame's fields back into an outcome.
pub fn response_outcome(
    success: bool,
    content: Option<Value>,
    error: Option<String>,
    error_kind: Option<ErrorKind>,
) -> BridgeResult<Value> {
    if success {
        Ok(content.unwrap_or(Value::Null))
    } else {
        Err(BridgeError::from_wire(
            error_kind,
            error.unwrap_or_else(|| "request failed".to_string()),
        ))
    }
}
