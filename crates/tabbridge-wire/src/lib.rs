//! TabBridge relay protocol over WebSocket.
//!
//! Lets a short-lived requester drive a live API surface hosted by a
//! long-running agent, through a broker neither side reaches directly.
//!
//! ## Architecture
//!
//! - **Broker**: accepts connections, classifies them by registration,
//!   routes requests to agents and responses back, fans out events
//! - **BridgeClient**: one broker connection multiplexing many requests
//! - **BridgeAgent**: serves requests against an injected surface root
//! - **RemoteProxy**: a callable mirror of a remote surface's shape
//! - **KeyStore** / **PortLock**: per-port key files and the single-binder lock

pub mod agent;
pub mod broker;
pub mod client;
pub mod connect;
pub mod credentials;
pub mod dispatch;
pub mod lock;
pub mod message;
pub mod pending;
pub mod proxy;
pub mod router;
pub mod session;
pub mod subscription;

pub use agent::{AgentHandle, AgentState, BridgeAgent};
pub use broker::{Broker, BrokerHandle};
pub use client::{BridgeClient, EventSubscription, PendingRequest};
pub use credentials::{Authenticator, KeyStore};
pub use lock::PortLock;
pub use message::{EventFrame, Frame, RegisterInfo};
pub use proxy::{CallConvention, PendingCall, RemoteProxy, RequestSender};
