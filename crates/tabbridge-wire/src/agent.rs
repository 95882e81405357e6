//! Bridge agent. Hosts a live surface and serves the broker's requests.
//!
//! The agent keeps one broker connection alive for its whole life: failed
//! attempts and dropped sessions are retried after a fixed backoff. A restart
//! tears the session down and reconnects at once, optionally with new
//! settings. A restart asked for while an attempt is in flight waits for that
//! attempt to settle first.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tabbridge_types::config::AgentConfig;
use tabbridge_types::request::format_path;
use tabbridge_types::value::{EventHandle, ListenerId};
use tabbridge_types::{BridgeError, BridgeResult, Introspector, LiveValue, PathSegment};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::connect::{connect_once, WsStream};
use crate::dispatch::{dispatch, Responder, ResponseSink};
use crate::message::{EventFrame, Frame, RegisterInfo, CLOSE_NORMAL};
use crate::session::{close_details, write_outbound, Outbound};

/// Connection state published by a running agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Connecting,
    /// Registration sent and the session is serving requests. The broker
    /// never acknowledges a registration: a rejected agent sees its session
    /// closed, so `Connected` is followed by `Disconnected`.
    Connected,
    /// Waiting out the reconnect backoff.
    Disconnected,
    Stopped,
}

enum Control {
    Restart(Option<AgentConfig>),
    Emit {
        path: Vec<PathSegment>,
        args: Vec<Value>,
    },
    Shutdown,
}

enum SessionExit {
    Lost,
    Restart,
    Shutdown,
}

/// An agent ready to be started.
pub struct BridgeAgent {
    config: AgentConfig,
    surface: LiveValue,
    introspector: Introspector,
}

impl BridgeAgent {
    pub fn new(config: AgentConfig, surface: LiveValue) -> Self {
        Self {
            config,
            surface,
            introspector: Introspector::new(),
        }
    }

    /// Replace the introspector used for `introspect` requests.
    pub fn with_introspector(mut self, introspector: Introspector) -> Self {
        self.introspector = introspector;
        self
    }

    /// Start the connection loop on the current runtime.
    pub fn spawn(self) -> AgentHandle {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(AgentState::Connecting);
        let task = tokio::spawn(self.run(control_rx, state_tx));
        AgentHandle {
            control: control_tx,
            state: state_rx,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Control>,
        state: watch::Sender<AgentState>,
    ) {
        info!(
            url = %self.config.url,
            kind = self.config.kind.as_str(),
            identifier = ?self.config.identifier,
            "Agent starting"
        );
        loop {
            state.send_replace(AgentState::Connecting);

            let mut restart: Option<Option<AgentConfig>> = None;
            let url = self.config.url.clone();
            let attempt = connect_once(&url);
            tokio::pin!(attempt);
            let outcome = loop {
                tokio::select! {
                    outcome = &mut attempt => break outcome,
                    ctl = control.recv() => match ctl {
                        Some(Control::Restart(config)) => {
                            debug!("Restart requested during connect, deferring");
                            merge_restart(&mut restart, config);
                        }
                        Some(Control::Emit { path, .. }) => {
                            debug!(path = %format_path(&path), "Not connected, event dropped");
                        }
                        Some(Control::Shutdown) | None => {
                            state.send_replace(AgentState::Stopped);
                            info!("Agent stopped");
                            return;
                        }
                    },
                }
            };

            if let Some(config) = restart {
                self.apply_restart(config);
                // The settled attempt used the old settings; drop it.
                continue;
            }

            match outcome {
                Ok(ws) => match self.serve(ws, &mut control, &state).await {
                    SessionExit::Shutdown => {
                        state.send_replace(AgentState::Stopped);
                        info!("Agent stopped");
                        return;
                    }
                    SessionExit::Restart => continue,
                    SessionExit::Lost => {}
                },
                Err(e) => warn!(url = %self.config.url, error = %e, "Agent connect failed"),
            }

            state.send_replace(AgentState::Disconnected);
            let backoff = tokio::time::sleep(Duration::from_millis(self.config.reconnect_delay_ms));
            tokio::pin!(backoff);
            loop {
                tokio::select! {
                    _ = &mut backoff => break,
                    ctl = control.recv() => match ctl {
                        Some(Control::Restart(config)) => {
                            self.apply_restart(config);
                            break;
                        }
                        Some(Control::Emit { path, .. }) => {
                            debug!(path = %format_path(&path), "Not connected, event dropped");
                        }
                        Some(Control::Shutdown) | None => {
                            state.send_replace(AgentState::Stopped);
                            info!("Agent stopped");
                            return;
                        }
                    },
                }
            }
        }
    }

    fn apply_restart(&mut self, config: Option<AgentConfig>) {
        if let Some(config) = config {
            if config != self.config {
                info!(url = %config.url, identifier = ?config.identifier, "Agent configuration changed");
            }
            self.config = config;
        }
        info!("Agent restarting");
    }

    /// Register and serve one broker session until it ends.
    async fn serve(
        &mut self,
        ws: WsStream,
        control: &mut mpsc::UnboundedReceiver<Control>,
        state: &watch::Sender<AgentState>,
    ) -> SessionExit {
        let (sink, mut source) = ws.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_outbound(sink, out_rx));

        let register = Frame::Register {
            info: RegisterInfo::Agent {
                kind: self.config.kind.as_str().to_string(),
                identifier: self.config.identifier.clone(),
            },
        };
        if let Err(e) = send_frame(&out_tx, &register) {
            warn!(error = %e, "Could not queue registration");
            drop(out_tx);
            let _ = writer.await;
            return SessionExit::Lost;
        }
        state.send_replace(AgentState::Connected);
        info!(url = %self.config.url, "Agent registration sent");

        let mut forwarders = Forwarders::default();
        let exit = loop {
            tokio::select! {
                msg = source.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text, &out_tx, &mut forwarders),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = close_details(frame.as_ref());
                        warn!(code, %reason, "Broker closed agent session");
                        break SessionExit::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Agent session read error");
                        break SessionExit::Lost;
                    }
                    None => break SessionExit::Lost,
                },
                ctl = control.recv() => match ctl {
                    Some(Control::Emit { path, args }) => forwarders.emit(&out_tx, path, args),
                    Some(Control::Restart(config)) => {
                        let _ = out_tx.send(Outbound::Close {
                            code: CLOSE_NORMAL,
                            reason: "agent restarting".to_string(),
                        });
                        self.apply_restart(config);
                        break SessionExit::Restart;
                    }
                    Some(Control::Shutdown) | None => {
                        let _ = out_tx.send(Outbound::Close {
                            code: CLOSE_NORMAL,
                            reason: "agent shutting down".to_string(),
                        });
                        break SessionExit::Shutdown;
                    }
                },
            }
        };

        forwarders.detach_all();
        drop(out_tx);
        let _ = writer.await;
        exit
    }

    fn handle_text(
        &self,
        text: &str,
        out: &mpsc::UnboundedSender<Outbound>,
        forwarders: &mut Forwarders,
    ) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Undecodable frame from broker");
                return;
            }
        };
        match frame {
            Frame::Request {
                request_id,
                content,
                ..
            } => {
                let out = out.clone();
                let sink: ResponseSink = Arc::new(move |frame: Frame| {
                    if let Err(e) = send_frame(&out, &frame) {
                        debug!(error = %e, "Response dropped, session gone");
                    }
                });
                dispatch(
                    &self.surface,
                    &self.introspector,
                    content,
                    Responder::new(request_id, sink),
                );
            }
            Frame::Subscribe { event_path, .. } => {
                forwarders.attach(&self.surface, out, event_path)
            }
            Frame::Unsubscribe { event_path, .. } => forwarders.detach(&event_path),
            other => debug!(kind = other.type_name(), "Ignoring frame"),
        }
    }
}

fn merge_restart(slot: &mut Option<Option<AgentConfig>>, config: Option<AgentConfig>) {
    match (slot.as_mut(), config) {
        (Some(existing), Some(config)) => *existing = Some(config),
        (Some(_), None) => {}
        (None, config) => *slot = Some(config),
    }
}

fn send_frame(out: &mpsc::UnboundedSender<Outbound>, frame: &Frame) -> BridgeResult<()> {
    let text = frame.encode()?;
    out.send(Outbound::Text(text))
        .map_err(|_| BridgeError::Disconnected)
}

struct Forwarder {
    refs: usize,
    /// The event node and our listener on it, when the path names an
    /// [`EventHandle`].
    listener: Option<(LiveValue, ListenerId)>,
}

/// Subscribed event paths for one session.
#[derive(Default)]
struct Forwarders {
    paths: BTreeMap<Vec<PathSegment>, Forwarder>,
}

impl Forwarders {
    fn attach(&mut self, surface: &LiveValue, out: &mpsc::UnboundedSender<Outbound>, path: Vec<PathSegment>) {
        if let Some(existing) = self.paths.get_mut(&path) {
            existing.refs += 1;
            return;
        }
        let listener = surface.resolve(&path).and_then(|node| {
            let handle = node.as_native::<EventHandle>()?;
            let out = out.clone();
            let event_path = path.clone();
            let id = handle.add_listener(Arc::new(move |args: &[Value]| {
                let frame = Frame::Event(EventFrame {
                    event_path: event_path.clone(),
                    args: args.to_vec(),
                    sender: None,
                });
                if let Err(e) = send_frame(&out, &frame) {
                    debug!(error = %e, "Event dropped, session gone");
                }
            }));
            Some((node, id))
        });
        if listener.is_none() {
            debug!(path = %format_path(&path), "Subscribed path has no event handle; forwarding emitted events only");
        }
        info!(path = %format_path(&path), "Event subscription attached");
        self.paths.insert(path, Forwarder { refs: 1, listener });
    }

    fn detach(&mut self, path: &[PathSegment]) {
        let Some(forwarder) = self.paths.get_mut(path) else {
            debug!(path = %format_path(path), "Unsubscribe for unknown path");
            return;
        };
        forwarder.refs -= 1;
        if forwarder.refs > 0 {
            return;
        }
        if let Some(forwarder) = self.paths.remove(path) {
            remove_listener(forwarder);
            info!(path = %format_path(path), "Event subscription detached");
        }
    }

    fn detach_all(&mut self) {
        for (_, forwarder) in std::mem::take(&mut self.paths) {
            remove_listener(forwarder);
        }
    }

    fn emit(&self, out: &mpsc::UnboundedSender<Outbound>, path: Vec<PathSegment>, args: Vec<Value>) {
        if !self.paths.contains_key(&path) {
            debug!(path = %format_path(&path), "No subscribers, event dropped");
            return;
        }
        let frame = Frame::Event(EventFrame {
            event_path: path,
            args,
            sender: None,
        });
        if let Err(e) = send_frame(out, &frame) {
            debug!(error = %e, "Event dropped, session gone");
        }
    }
}

fn remove_listener(forwarder: Forwarder) {
    if let Some((node, id)) = forwarder.listener {
        if let Some(handle) = node.as_native::<EventHandle>() {
            handle.remove_listener(id);
        }
    }
}

/// Control surface of a running agent.
pub struct AgentHandle {
    control: mpsc::UnboundedSender<Control>,
    state: watch::Receiver<AgentState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AgentHandle {
    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn state_watch(&self) -> watch::Receiver<AgentState> {
        self.state.clone()
    }

    /// Wait until the agent reports `wanted`, up to `timeout`.
    pub async fn wait_for(&self, wanted: AgentState, timeout: Duration) -> BridgeResult<()> {
        let mut rx = self.state.clone();
        let wait = rx.wait_for(|s| *s == wanted);
        let result = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(BridgeError::Cancelled("agent stopped".to_string())),
            Err(_) => Err(BridgeError::Connection(format!(
                "agent did not reach {wanted:?} within {}ms",
                timeout.as_millis()
            ))),
        };
        result
    }

    /// Reconnect now, optionally with new settings.
    pub fn restart(&self, config: Option<AgentConfig>) -> BridgeResult<()> {
        self.control
            .send(Control::Restart(config))
            .map_err(|_| BridgeError::Cancelled("agent stopped".to_string()))
    }

    /// Forward an event to the broker if anyone is subscribed to `path`.
    pub fn emit_event(&self, path: Vec<PathSegment>, args: Vec<Value>) -> BridgeResult<()> {
        self.control
            .send(Control::Emit { path, args })
            .map_err(|_| BridgeError::Cancelled("agent stopped".to_string()))
    }

    /// Close the session and stop reconnecting.
    pub async fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Agent task failed");
            }
        }
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn collect() -> (mpsc::UnboundedSender<Outbound>, mpsc::UnboundedReceiver<Outbound>) {
        mpsc::unbounded_channel()
    }

    fn events(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<EventFrame> {
        let mut out = Vec::new();
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            if let Ok(Frame::Event(event)) = Frame::decode(&text) {
                out.push(event);
            }
        }
        out
    }

    #[test]
    fn test_forwarder_attaches_and_detaches_listener() {
        let handle = EventHandle::new("tabs.onUpdated");
        let surface = LiveValue::object([(
            "tabs",
            LiveValue::object([("onUpdated", handle.into_value())]),
        )]);
        let path: Vec<PathSegment> = vec!["tabs".into(), "onUpdated".into()];
        let (tx, mut rx) = collect();
        let mut forwarders = Forwarders::default();

        forwarders.attach(&surface, &tx, path.clone());
        forwarders.attach(&surface, &tx, path.clone());
        assert_eq!(handle.listener_count(), 1);

        handle.emit(&[json!(3)]);
        let seen = events(&mut rx);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].args, vec![json!(3)]);
        assert_eq!(seen[0].sender, None);

        forwarders.detach(&path);
        assert_eq!(handle.listener_count(), 1);
        forwarders.detach(&path);
        assert_eq!(handle.listener_count(), 0);
        handle.emit(&[json!(4)]);
        assert!(events(&mut rx).is_empty());
    }

    #[test]
    fn test_emit_only_for_subscribed_paths() {
        let surface = LiveValue::object([("ping", LiveValue::from(json!(1)))]);
        let (tx, mut rx) = collect();
        let mut forwarders = Forwarders::default();

        forwarders.emit(&tx, vec!["custom".into()], vec![json!("a")]);
        assert!(events(&mut rx).is_empty());

        forwarders.attach(&surface, &tx, vec!["custom".into()]);
        forwarders.emit(&tx, vec!["custom".into()], vec![json!("b")]);
        let seen = events(&mut rx);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].args, vec![json!("b")]);
    }

    #[test]
    fn test_detach_all_clears_listeners() {
        let first = EventHandle::new("a");
        let second = EventHandle::new("b");
        let surface = LiveValue::object([("a", first.into_value()), ("b", second.into_value())]);
        let (tx, _rx) = collect();
        let mut forwarders = Forwarders::default();
        forwarders.attach(&surface, &tx, vec!["a".into()]);
        forwarders.attach(&surface, &tx, vec!["b".into()]);
        forwarders.detach_all();
        assert_eq!(first.listener_count(), 0);
        assert_eq!(second.listener_count(), 0);
    }

    #[test]
    fn test_merge_restart_keeps_latest_config() {
        let mut slot = None;
        merge_restart(&mut slot, None);
        assert_eq!(slot, Some(None));
        let config = AgentConfig {
            identifier: Some("work".to_string()),
            ..Default::default()
        };
        merge_restart(&mut slot, Some(config.clone()));
        merge_restart(&mut slot, None);
        assert_eq!(slot, Some(Some(config)));
    }

    #[tokio::test]
    async fn test_agent_backs_off_and_stops() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let agent = BridgeAgent::new(
            AgentConfig {
                url: format!("ws://127.0.0.1:{port}"),
                reconnect_delay_ms: 50,
                ..Default::default()
            },
            LiveValue::null(),
        )
        .spawn();
        let mut watch = agent.state_watch();
        let sink = Arc::clone(&seen);
        let recorder = tokio::spawn(async move {
            while watch.changed().await.is_ok() {
                let state = *watch.borrow();
                sink.lock().unwrap().push(state);
                if state == AgentState::Stopped {
                    break;
                }
            }
        });

        agent
            .wait_for(AgentState::Disconnected, Duration::from_secs(5))
            .await
            .unwrap();
        agent.shutdown().await;
        assert_eq!(agent.state(), AgentState::Stopped);
        let _ = tokio::time::timeout(Duration::from_secs(1), recorder).await;
        assert!(!seen.lock().unwrap().contains(&AgentState::Connected));
    }
}
