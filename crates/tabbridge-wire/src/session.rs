//! Session identity, roles, and the socket writer every connection shares.

use std::fmt;

use futures::{Sink, SinkExt};
use tabbridge_types::{AgentKind, Target};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Broker-assigned connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// What a session registered as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Connected, no registration seen yet.
    Unclassified,
    Client { username: String },
    Agent {
        kind: AgentKind,
        identifier: Option<String>,
    },
}

impl Role {
    pub fn is_agent(&self) -> bool {
        matches!(self, Role::Agent { .. })
    }

    pub fn is_client(&self) -> bool {
        matches!(self, Role::Client { .. })
    }

    /// The target naming this agent, stamped on its events.
    pub fn agent_target(&self) -> Option<Target> {
        match self {
            Role::Agent { kind, identifier } => Some(Target::agent(*kind, identifier.as_deref())),
            _ => None,
        }
    }
}

/// Something for a session's writer task to put on the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    /// Send a close frame and stop writing.
    Close { code: u16, reason: String },
}

/// Drain `outbound` onto a WebSocket sink until the queue closes or a close
/// frame has been written.
pub(crate) async fn write_outbound<S>(mut sink: S, mut outbound: mpsc::UnboundedReceiver<Outbound>)
where
    S: Sink<Message> + Unpin,
{
    while let Some(out) = outbound.recv().await {
        match out {
            Outbound::Text(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

/// Close code and reason from a received close frame.
pub(crate) fn close_details(frame: Option<&CloseFrame<'_>>) -> (u16, String) {
    match frame {
        Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
        None => (1005, String::new()),
    }
}
