//! Bridge client, the requester side.
//!
//! One WebSocket connection multiplexes any number of in-flight requests,
//! each keyed by a local monotonic id. A reader task resolves them as
//! responses arrive and fails all of them once the connection is gone.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::Value;
use tabbridge_types::config::ClientConfig;
use tabbridge_types::{
    AgentKind, BridgeError, BridgeResult, PathSegment, RequestContent, Shape, Target,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::connect::connect_until;
use crate::message::{response_outcome, EventFrame, Frame, RegisterInfo, CLOSE_AUTH, CLOSE_NORMAL};
use crate::pending::PendingTable;
use crate::proxy::{CallConvention, PendingCall, RemoteProxy, RequestSender};
use crate::session::{close_details, write_outbound, Outbound};

type Reply = oneshot::Sender<BridgeResult<Value>>;
type SubKey = (Target, Vec<PathSegment>);

/// Why the connection ended.
#[derive(Debug, Clone)]
enum Closed {
    Local,
    Remote { code: u16, reason: String },
}

impl Closed {
    fn to_error(&self) -> BridgeError {
        match self {
            Closed::Local => BridgeError::Connection("client is closed".to_string()),
            Closed::Remote { code, reason } if *code == CLOSE_AUTH => {
                BridgeError::Authentication(format!("broker rejected registration: {reason}"))
            }
            Closed::Remote { code, reason } => {
                BridgeError::Connection(format!("broker closed the connection ({code}) {reason}"))
            }
        }
    }
}

#[derive(Default)]
struct ClientShared {
    pending: PendingTable<Reply>,
    subscriptions: HashMap<SubKey, Vec<(u64, mpsc::UnboundedSender<EventFrame>)>>,
    next_subscription: u64,
    closed: Option<Closed>,
}

struct ClientInner {
    shared: Mutex<ClientShared>,
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, ClientShared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send_frame(&self, frame: &Frame) -> BridgeResult<()> {
        let text = frame.encode()?;
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| BridgeError::Disconnected)
    }

    /// Mark closed and fail everything in flight.
    fn fail_all(&self, closed: Closed) {
        let (pending, subs, rejected) = {
            let mut shared = self.lock();
            if shared.closed.is_none() {
                shared.closed = Some(closed);
            }
            let rejected = match &shared.closed {
                Some(c @ Closed::Remote { code, .. }) if *code == CLOSE_AUTH => {
                    Some(c.to_error().wire_message())
                }
                _ => None,
            };
            let subs = std::mem::take(&mut shared.subscriptions);
            (shared.pending.drain_all(), subs, rejected)
        };
        if !pending.is_empty() {
            debug!(count = pending.len(), "Failing in-flight requests");
        }
        for (_, reply) in pending {
            let err = match &rejected {
                Some(message) => BridgeError::Authentication(message.clone()),
                None => BridgeError::Disconnected,
            };
            let _ = reply.send(Err(err));
        }
        drop(subs);
    }

    fn resolve(&self, id: u64, outcome: BridgeResult<Value>) {
        let reply = self.lock().pending.remove(id);
        match reply {
            Some(reply) => {
                let _ = reply.send(outcome);
            }
            None => debug!(response_id = id, "Response for unknown or cancelled request"),
        }
    }

    fn deliver_event(&self, event: EventFrame) {
        let sender_kind = event
            .sender
            .as_ref()
            .and_then(|s| s.name.parse::<AgentKind>().ok());
        let sender_id = event.sender.as_ref().and_then(|s| s.identifier.clone());
        let shared = self.lock();
        for ((target, path), listeners) in &shared.subscriptions {
            if *path != event.event_path {
                continue;
            }
            let matches = match sender_kind {
                Some(kind) => target.matches_agent(kind, sender_id.as_deref()),
                None => true,
            };
            if matches {
                for (_, tx) in listeners {
                    let _ = tx.send(event.clone());
                }
            }
        }
    }

    fn drop_subscription(&self, key: &SubKey, sub_id: u64) {
        let last = {
            let mut shared = self.lock();
            let Some(listeners) = shared.subscriptions.get_mut(key) else {
                return;
            };
            listeners.retain(|(id, _)| *id != sub_id);
            if listeners.is_empty() {
                shared.subscriptions.remove(key);
                true
            } else {
                false
            }
        };
        if last {
            let _ = self.send_frame(&Frame::Unsubscribe {
                target: Some(key.0.clone()),
                event_path: key.1.clone(),
            });
        }
    }
}

/// A connection to a broker, registered as a client. Cheap to clone.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<ClientInner>,
}

impl BridgeClient {
    /// Connect, retrying until `connect_timeout_ms` elapses, and register.
    pub async fn connect(config: &ClientConfig) -> BridgeResult<Self> {
        let ws = connect_until(
            &config.url,
            Duration::from_millis(config.connect_timeout_ms),
            Duration::from_millis(config.retry_interval_ms),
        )
        .await?;
        let (sink, mut source) = ws.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_outbound(sink, out_rx));

        let inner = Arc::new(ClientInner {
            shared: Mutex::new(ClientShared::default()),
            outbound: out_tx,
            reader: Mutex::new(None),
        });
        inner.send_frame(&Frame::Register {
            info: RegisterInfo::Client {
                username: config.username.clone(),
                key: config.key.clone().unwrap_or_default(),
            },
        })?;

        let weak = Arc::downgrade(&inner);
        let reader = tokio::spawn(async move {
            let mut closed = Closed::Remote {
                code: 1006,
                reason: "connection lost".to_string(),
            };
            while let Some(msg) = source.next().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match msg {
                    Ok(Message::Text(text)) => match Frame::decode(&text) {
                        Ok(Frame::Response {
                            response_id,
                            success,
                            content,
                            error,
                            error_kind,
                        }) => inner.resolve(
                            response_id,
                            response_outcome(success, content, error, error_kind),
                        ),
                        Ok(Frame::Event(event)) => inner.deliver_event(event),
                        Ok(other) => debug!(kind = other.type_name(), "Unexpected frame from broker"),
                        Err(e) => warn!(error = %e, "Undecodable frame from broker"),
                    },
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = close_details(frame.as_ref());
                        info!(code, %reason, "Broker closed connection");
                        closed = Closed::Remote { code, reason };
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "Client read error");
                        break;
                    }
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.fail_all(closed);
            }
        });
        *inner.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(reader);

        info!(url = %config.url, user = %config.username, "Client connected");
        Ok(Self { inner })
    }

    /// Issue a request. The returned handle resolves with the outcome and
    /// may be cancelled; dropping it also cancels.
    pub fn send_request(&self, target: Target, content: RequestContent) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut shared = self.inner.lock();
            if let Some(closed) = &shared.closed {
                let _ = tx.send(Err(closed.to_error()));
                return PendingRequest::settled(rx);
            }
            shared.pending.insert(tx)
        };
        let frame = Frame::Request {
            target: Some(target),
            request_id: id,
            content,
        };
        if let Err(e) = self.inner.send_frame(&frame) {
            self.inner.resolve(id, Err(e));
        }
        PendingRequest {
            id,
            rx,
            client: Arc::downgrade(&self.inner),
            done: false,
        }
    }

    pub async fn request(&self, target: Target, content: RequestContent) -> BridgeResult<Value> {
        self.send_request(target, content).await
    }

    pub async fn query(
        &self,
        target: Target,
        path: Vec<PathSegment>,
        params: Vec<Value>,
    ) -> BridgeResult<Value> {
        self.request(target, RequestContent::query(path, params)).await
    }

    pub async fn introspect(&self, target: Target, path: Vec<PathSegment>) -> BridgeResult<Shape> {
        let value = self.request(target, RequestContent::introspect(path)).await?;
        serde_json::from_value(value)
            .map_err(|e| BridgeError::Protocol(format!("invalid shape description: {e}")))
    }

    /// Fetch the target's whole surface and build a proxy over it.
    pub async fn proxy(&self, target: Target, convention: CallConvention) -> BridgeResult<RemoteProxy> {
        let shape = self.introspect(target.clone(), Vec::new()).await?;
        let sender: Arc<dyn RequestSender> = Arc::new(TargetedSender {
            client: self.clone(),
            target,
        });
        Ok(RemoteProxy::build(shape, sender, convention))
    }

    /// Subscribe to an event on the target's surface.
    pub fn subscribe(&self, target: Target, event_path: Vec<PathSegment>) -> BridgeResult<EventSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let key: SubKey = (target, event_path);
        let (sub_id, first) = {
            let mut shared = self.inner.lock();
            if let Some(closed) = &shared.closed {
                return Err(closed.to_error());
            }
            shared.next_subscription += 1;
            let sub_id = shared.next_subscription;
            let listeners = shared.subscriptions.entry(key.clone()).or_default();
            listeners.push((sub_id, tx));
            (sub_id, listeners.len() == 1)
        };
        if first {
            self.inner.send_frame(&Frame::Subscribe {
                target: Some(key.0.clone()),
                event_path: key.1.clone(),
            })?;
        }
        Ok(EventSubscription {
            key,
            sub_id,
            rx,
            client: Arc::downgrade(&self.inner),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }

    /// Close the connection. Every in-flight request fails with
    /// [`BridgeError::Disconnected`].
    pub async fn close(&self) {
        let _ = self.inner.outbound.send(Outbound::Close {
            code: CLOSE_NORMAL,
            reason: "client closing".to_string(),
        });
        self.inner.fail_all(Closed::Local);
        let reader = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(reader) = reader {
            reader.abort();
            let _ = reader.await;
        }
    }
}

/// A request awaiting its response.
pub struct PendingRequest {
    id: u64,
    rx: oneshot::Receiver<BridgeResult<Value>>,
    client: Weak<ClientInner>,
    done: bool,
}

impl PendingRequest {
    fn settled(rx: oneshot::Receiver<BridgeResult<Value>>) -> Self {
        Self {
            id: 0,
            rx,
            client: Weak::new(),
            done: true,
        }
    }

    /// Local request id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Forget the request. A late response is discarded.
    pub fn cancel(mut self) {
        self.forget();
    }

    fn forget(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(inner) = self.client.upgrade() {
            if inner.lock().pending.remove(self.id).is_some() {
                debug!(request_id = self.id, "Request cancelled");
            }
        }
    }
}

impl Future for PendingRequest {
    type Output = BridgeResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(outcome) => {
                self.done = true;
                Poll::Ready(outcome.unwrap_or(Err(BridgeError::Disconnected)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.forget();
    }
}

/// A stream of events for one `(target, eventPath)`. Dropping it
/// unsubscribes once no other local subscription shares the key.
pub struct EventSubscription {
    key: SubKey,
    sub_id: u64,
    rx: mpsc::UnboundedReceiver<EventFrame>,
    client: Weak<ClientInner>,
}

impl EventSubscription {
    pub fn target(&self) -> &Target {
        &self.key.0
    }

    pub fn event_path(&self) -> &[PathSegment] {
        &self.key.1
    }

    /// Next event, or `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<EventFrame> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Stream for EventSubscription {
    type Item = EventFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.client.upgrade() {
            inner.drop_subscription(&self.key, self.sub_id);
        }
    }
}

/// A client bound to one target, as a proxy's request primitive.
pub struct TargetedSender {
    client: BridgeClient,
    target: Target,
}

impl TargetedSender {
    pub fn new(client: BridgeClient, target: Target) -> Self {
        Self { client, target }
    }
}

impl RequestSender for TargetedSender {
    fn send(&self, content: RequestContent) -> PendingCall {
        PendingCall::new(self.client.send_request(self.target.clone(), content))
    }
}
