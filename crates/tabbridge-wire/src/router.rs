//! Broker state machine.
//!
//! [`Router`] owns every session, pending request and subscription. It is
//! driven by one task consuming [`BrokerEvent`]s in arrival order and never
//! writes to a socket itself: all output goes onto per-session outbound
//! queues, so handling one session's frame never runs another session's
//! logic inline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tabbridge_types::config::BrokerConfig;
use tabbridge_types::target::normalize_identifier;
use tabbridge_types::{
    AgentKind, BridgeError, ErrorKind, Introspector, LiveValue, PathSegment, RequestContent,
    Target, TargetType,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::credentials::Authenticator;
use crate::dispatch::{dispatch, Responder};
use crate::message::{
    EventFrame, Frame, RegisterInfo, CLOSE_AUTH, CLOSE_HIJACK, CLOSE_PROTOCOL, CLOSE_SHUTDOWN,
};
use crate::pending::PendingTable;
use crate::session::{Outbound, Role, SessionId};
use crate::subscription::{SubscriptionKey, SubscriptionTable};

/// Input to the router task.
#[derive(Debug)]
pub enum BrokerEvent {
    Opened {
        session: SessionId,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    Text {
        session: SessionId,
        text: String,
    },
    /// A non-text data frame.
    Binary { session: SessionId },
    Closed { session: SessionId },
}

/// Live counters published after every event.
#[derive(Debug, Default)]
pub struct BrokerStats {
    agents: AtomicUsize,
    clients: AtomicUsize,
    pending: AtomicUsize,
    subscriptions: AtomicUsize,
}

impl BrokerStats {
    pub fn agent_count(&self) -> usize {
        self.agents.load(Ordering::SeqCst)
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

struct SessionEntry {
    role: Role,
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// A request forwarded to an agent and awaiting its response.
#[derive(Debug, Clone)]
struct PendingEntry {
    client: SessionId,
    client_request_id: u64,
    agent: SessionId,
}

pub struct Router {
    config: BrokerConfig,
    authenticator: Arc<Authenticator>,
    introspector: Introspector,
    sessions: HashMap<SessionId, SessionEntry>,
    pending: PendingTable<PendingEntry>,
    subscriptions: SubscriptionTable,
    stats: Arc<BrokerStats>,
}

impl Router {
    pub fn new(
        config: BrokerConfig,
        authenticator: Arc<Authenticator>,
        stats: Arc<BrokerStats>,
    ) -> Self {
        Self {
            config,
            authenticator,
            introspector: Introspector::new(),
            sessions: HashMap::new(),
            pending: PendingTable::new(),
            subscriptions: SubscriptionTable::new(),
            stats,
        }
    }

    pub fn handle(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Opened {
                session,
                addr,
                outbound,
            } => self.open_session(session, addr, outbound),
            BrokerEvent::Text { session, text } => self.handle_text(session, &text),
            BrokerEvent::Binary { session } => {
                self.violation(session, "binary frames are not supported")
            }
            BrokerEvent::Closed { session } => self.close_session(session),
        }
        self.publish_stats();
    }

    fn publish_stats(&self) {
        let agents = self.sessions.values().filter(|s| s.role.is_agent()).count();
        let clients = self.sessions.values().filter(|s| s.role.is_client()).count();
        self.stats.agents.store(agents, Ordering::SeqCst);
        self.stats.clients.store(clients, Ordering::SeqCst);
        self.stats.pending.store(self.pending.len(), Ordering::SeqCst);
        self.stats
            .subscriptions
            .store(self.subscriptions.len(), Ordering::SeqCst);
    }

    pub fn open_session(
        &mut self,
        session: SessionId,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) {
        debug!(%session, %addr, "Session opened");
        self.sessions.insert(
            session,
            SessionEntry {
                role: Role::Unclassified,
                addr,
                outbound,
            },
        );
    }

    fn send(&self, session: SessionId, frame: &Frame) {
        let Some(entry) = self.sessions.get(&session) else {
            debug!(%session, kind = frame.type_name(), "Dropping frame for closed session");
            return;
        };
        match frame.encode() {
            Ok(text) => {
                let _ = entry.outbound.send(Outbound::Text(text));
            }
            Err(e) => warn!(%session, error = %e, "Failed to encode frame"),
        }
    }

    /// Close `session` with `code` and drop all of its state.
    fn kick(&mut self, session: SessionId, code: u16, reason: &str) {
        if let Some(entry) = self.sessions.get(&session) {
            let _ = entry.outbound.send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
        self.close_session(session);
    }

    fn violation(&mut self, session: SessionId, reason: &str) {
        warn!(%session, reason, "Protocol violation, closing session");
        self.kick(session, CLOSE_PROTOCOL, reason);
    }

    pub fn handle_text(&mut self, session: SessionId, text: &str) {
        let Some(role) = self.sessions.get(&session).map(|s| s.role.clone()) else {
            debug!(%session, "Frame from unknown session ignored");
            return;
        };
        if text.len() > self.config.max_frame_bytes {
            let reason = format!(
                "frame of {} bytes exceeds limit of {}",
                text.len(),
                self.config.max_frame_bytes
            );
            self.violation(session, &reason);
            return;
        }
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.violation(session, &e.wire_message());
                return;
            }
        };

        match (role, frame) {
            (Role::Unclassified, Frame::Register { info }) => self.register(session, info),
            (Role::Unclassified, other) => {
                let reason = format!("expected register, got {}", other.type_name());
                self.violation(session, &reason);
            }
            (_, Frame::Register { .. }) => self.violation(session, "duplicate registration"),
            (Role::Client { .. }, Frame::Request {
                target,
                request_id,
                content,
            }) => self.client_request(session, target.map(Target::normalized), request_id, content),
            (Role::Client { .. }, Frame::Subscribe { target, event_path }) => {
                self.client_subscribe(session, target.map(Target::normalized), event_path)
            }
            (Role::Client { .. }, Frame::Unsubscribe { target, event_path }) => {
                self.client_unsubscribe(session, target.map(Target::normalized), event_path)
            }
            (Role::Client { .. }, Frame::Response { response_id, .. }) => {
                self.reject_foreign_response(session, response_id)
            }
            (Role::Agent { .. }, Frame::Response {
                response_id,
                success,
                content,
                error,
                error_kind,
            }) => self.agent_response(session, response_id, success, content, error, error_kind),
            (Role::Agent { .. }, Frame::Event(event)) => self.agent_event(session, event),
            (Role::Agent { .. }, Frame::Request { request_id, .. }) => {
                let err = BridgeError::Protocol("agents cannot issue requests".to_string());
                self.send(session, &Frame::failure(request_id, &err));
            }
            (role, frame) => {
                warn!(%session, ?role, kind = frame.type_name(), "Unexpected frame ignored");
            }
        }
    }

    // --- registration ---

    fn register(&mut self, session: SessionId, info: RegisterInfo) {
        match info {
            RegisterInfo::Client { username, key } => {
                if !self.authenticator.verify(&username, &key) {
                    warn!(%session, user = %username, "Client authentication failed");
                    self.kick(session, CLOSE_AUTH, "invalid credentials");
                    return;
                }
                info!(%session, user = %username, "Client registered");
                if let Some(entry) = self.sessions.get_mut(&session) {
                    entry.role = Role::Client { username };
                }
            }
            RegisterInfo::Agent { kind, identifier } => {
                match self.validate_agent(&kind, identifier) {
                    Ok((kind, identifier)) => self.accept_agent(session, kind, identifier),
                    Err(reason) => {
                        warn!(%session, %reason, "Agent registration rejected");
                        self.kick(session, CLOSE_AUTH, &reason);
                    }
                }
            }
        }
    }

    fn validate_agent(
        &self,
        kind: &str,
        identifier: Option<String>,
    ) -> Result<(AgentKind, Option<String>), String> {
        let kind: AgentKind = kind.parse()?;
        if !self.config.supported_kinds.contains(&kind) {
            return Err(format!("agent kind '{kind}' is not supported"));
        }
        let identifier = normalize_identifier(identifier);
        if let Some(id) = identifier.as_deref() {
            let taken = self.sessions.values().any(|s| {
                matches!(&s.role, Role::Agent { identifier: Some(existing), .. } if existing == id)
            });
            if taken {
                return Err(format!("identifier '{id}' is already in use"));
            }
        }
        if !self.config.identifier_allowed(identifier.as_deref()) {
            return Err(format!(
                "identifier '{}' is not allowed",
                identifier.as_deref().unwrap_or("")
            ));
        }
        Ok((kind, identifier))
    }

    fn accept_agent(&mut self, session: SessionId, kind: AgentKind, identifier: Option<String>) {
        info!(%session, %kind, identifier = ?identifier, "Agent registered");
        if let Some(entry) = self.sessions.get_mut(&session) {
            entry.role = Role::Agent {
                kind,
                identifier: identifier.clone(),
            };
        }
        let paths = self
            .subscriptions
            .reattach(session, |t| t.matches_agent(kind, identifier.as_deref()));
        for event_path in paths {
            debug!(%session, path = ?event_path, "Reattaching subscription");
            self.send(
                session,
                &Frame::Subscribe {
                    target: None,
                    event_path,
                },
            );
        }
    }

    // --- routing ---

    /// The live agent a target routes to. Lowest session id wins among
    /// several agents of one kind.
    fn route(&self, target: &Target) -> Option<SessionId> {
        self.sessions
            .iter()
            .filter(|(_, s)| match &s.role {
                Role::Agent { kind, identifier } => target.matches_agent(*kind, identifier.as_deref()),
                _ => false,
            })
            .map(|(id, _)| *id)
            .min()
    }

    fn client_request(
        &mut self,
        session: SessionId,
        target: Option<Target>,
        request_id: u64,
        content: RequestContent,
    ) {
        let Some(target) = target else {
            let err = BridgeError::Protocol("request without target".to_string());
            self.send(session, &Frame::failure(request_id, &err));
            return;
        };
        if target.target_type == TargetType::Server {
            self.serve_locally(session, request_id, content);
            return;
        }
        let Some(agent) = self.route(&target) else {
            debug!(%session, %target, request_id, "No agent for target");
            let err = BridgeError::Routing(format!("agent {target} is not connected"));
            self.send(session, &Frame::failure(request_id, &err));
            return;
        };
        let broker_id = self.pending.insert(PendingEntry {
            client: session,
            client_request_id: request_id,
            agent,
        });
        debug!(%session, %agent, request_id, broker_id, "Forwarding request");
        self.send(
            agent,
            &Frame::Request {
                target: None,
                request_id: broker_id,
                content,
            },
        );
    }

    /// Snapshot of the broker exposed to `server` targets.
    fn surface(&self) -> LiveValue {
        let mut agents: Vec<(SessionId, &Role)> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.role.is_agent())
            .map(|(id, s)| (*id, &s.role))
            .collect();
        agents.sort_by_key(|(id, _)| *id);
        let agents = agents
            .into_iter()
            .filter_map(|(id, role)| match role {
                Role::Agent { kind, identifier } => Some(LiveValue::from(json!({
                    "kind": kind,
                    "identifier": identifier,
                    "session": id.to_string(),
                }))),
                _ => None,
            })
            .collect();
        LiveValue::object([
            ("agents", LiveValue::Array(agents)),
            (
                "clients",
                LiveValue::from(json!(self.sessions.values().filter(|s| s.role.is_client()).count())),
            ),
            ("subscriptions", LiveValue::from(json!(self.subscriptions.len()))),
            ("version", LiveValue::from(json!(env!("CARGO_PKG_VERSION")))),
        ])
    }

    fn serve_locally(&mut self, session: SessionId, request_id: u64, content: RequestContent) {
        let Some(outbound) = self.sessions.get(&session).map(|s| s.outbound.clone()) else {
            return;
        };
        let responder = Responder::new(
            request_id,
            Arc::new(move |frame: Frame| match frame.encode() {
                Ok(text) => {
                    let _ = outbound.send(Outbound::Text(text));
                }
                Err(e) => warn!(error = %e, "Failed to encode server response"),
            }),
        );
        dispatch(&self.surface(), &self.introspector, content, responder);
    }

    fn agent_response(
        &mut self,
        session: SessionId,
        response_id: u64,
        success: bool,
        content: Option<Value>,
        error: Option<String>,
        error_kind: Option<ErrorKind>,
    ) {
        let Some(entry) = self.pending.get(response_id).cloned() else {
            debug!(%session, response_id, "Response for unknown request ignored");
            return;
        };
        if entry.agent != session {
            self.reject_foreign_response(session, response_id);
            return;
        }
        self.pending.remove(response_id);
        self.send(
            entry.client,
            &Frame::Response {
                response_id: entry.client_request_id,
                success,
                content,
                error,
                error_kind,
            },
        );
    }

    /// A response from any session other than the owning agent fails the
    /// request it names, if still pending, and closes the sender.
    fn reject_foreign_response(&mut self, session: SessionId, response_id: u64) {
        let owner = self.pending.get(response_id).map(|p| p.agent);
        warn!(%session, owner = ?owner, response_id, "Response from non-owning session, closing it");
        if let Some(entry) = self.pending.remove(response_id) {
            let err = BridgeError::Hijack(format!(
                "response for request {} came from a session that does not own it",
                entry.client_request_id
            ));
            self.send(entry.client, &Frame::failure(entry.client_request_id, &err));
        }
        self.kick(session, CLOSE_HIJACK, "response hijack");
    }

    // --- subscriptions ---

    fn client_subscribe(
        &mut self,
        session: SessionId,
        target: Option<Target>,
        event_path: Vec<PathSegment>,
    ) {
        let Some(target) = target.filter(|t| t.target_type == TargetType::Agent) else {
            warn!(%session, "Subscribe without an agent target ignored");
            return;
        };
        let receiver = self.route(&target);
        let key = SubscriptionKey {
            target,
            event_path: event_path.clone(),
        };
        if let Some(agent) = self.subscriptions.subscribe(key, session, || receiver) {
            debug!(%session, %agent, path = ?event_path, "First subscriber, notifying agent");
            self.send(
                agent,
                &Frame::Subscribe {
                    target: None,
                    event_path,
                },
            );
        }
    }

    fn client_unsubscribe(
        &mut self,
        session: SessionId,
        target: Option<Target>,
        event_path: Vec<PathSegment>,
    ) {
        let Some(target) = target else {
            warn!(%session, "Unsubscribe without target ignored");
            return;
        };
        let key = SubscriptionKey { target, event_path };
        if let Some(removed) = self.subscriptions.unsubscribe(&key, session) {
            self.notify_unsubscribed(removed.receiver, removed.event_path);
        }
    }

    fn notify_unsubscribed(&self, receiver: Option<SessionId>, event_path: Vec<PathSegment>) {
        if let Some(agent) = receiver {
            debug!(%agent, path = ?event_path, "Last subscriber gone, notifying agent");
            self.send(
                agent,
                &Frame::Unsubscribe {
                    target: None,
                    event_path,
                },
            );
        }
    }

    fn agent_event(&mut self, session: SessionId, mut event: EventFrame) {
        if event.sender.is_none() {
            event.sender = self
                .sessions
                .get(&session)
                .and_then(|s| s.role.agent_target());
        }
        let subscribers = self.subscriptions.subscribers_for(session, &event.event_path);
        if subscribers.is_empty() {
            debug!(%session, path = ?event.event_path, "Event without subscribers dropped");
            return;
        }
        let frame = Frame::Event(event);
        for client in subscribers {
            self.send(client, &frame);
        }
    }

    // --- teardown ---

    pub fn close_session(&mut self, session: SessionId) {
        let Some(entry) = self.sessions.remove(&session) else {
            return;
        };
        match entry.role {
            Role::Client { username } => {
                let dropped = self.pending.drain_where(|p| p.client == session);
                for removed in self.subscriptions.remove_client(session) {
                    self.notify_unsubscribed(removed.receiver, removed.event_path);
                }
                info!(%session, user = %username, dropped = dropped.len(), "Client disconnected");
            }
            Role::Agent { kind, identifier } => {
                let orphaned = self.pending.drain_where(|p| p.agent == session);
                for (_, pending) in &orphaned {
                    let err = BridgeError::Connection("agent disconnected".to_string());
                    self.send(pending.client, &Frame::failure(pending.client_request_id, &err));
                }
                let detached = self.subscriptions.detach_receiver(session);
                info!(
                    %session,
                    %kind,
                    identifier = ?identifier,
                    failed = orphaned.len(),
                    detached,
                    "Agent disconnected"
                );
            }
            Role::Unclassified => {
                debug!(%session, addr = %entry.addr, "Unregistered session closed");
            }
        }
    }

    /// Close every session and forget all state.
    pub fn shutdown(&mut self) {
        for entry in self.sessions.values() {
            let _ = entry.outbound.send(Outbound::Close {
                code: CLOSE_SHUTDOWN,
                reason: "broker shutting down".to_string(),
            });
        }
        info!(sessions = self.sessions.len(), "Broker state cleared");
        self.sessions.clear();
        self.pending.drain_all();
        self.subscriptions.clear();
        self.publish_stats();
    }
}
