//! Remote proxies: a local mirror of a remote surface.
//!
//! [`RemoteProxy::build`] materializes a [`Shape`] so that every function leaf
//! becomes a stub issuing a `query` request for its path. The calling
//! convention is fixed per proxy:
//!
//! - [`CallConvention::Awaitable`]: a stub returns a deferred result.
//! - [`CallConvention::Callback`]: a trailing completion argument receives
//!   the result; the stub returns at once. On failure the completion gets
//!   `Err` and [`RemoteProxy::last_error`] holds the error while it runs.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use serde_json::Value;
use tabbridge_types::request::format_path;
use tabbridge_types::shape::{materialize, CallCapability};
use tabbridge_types::value::{Argument, CompletionHandler, Invocation};
use tabbridge_types::{BridgeError, BridgeResult, LiveValue, PathSegment, RequestContent, Shape};
use tracing::warn;

/// How proxy stubs deliver their results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConvention {
    Callback,
    Awaitable,
}

/// Issues requests for a proxy. Implemented by a client bound to a target.
pub trait RequestSender: Send + Sync {
    /// Send `content` now and return a handle to its outcome.
    fn send(&self, content: RequestContent) -> PendingCall;
}

/// The outcome of a remote call. Dropping it (or calling
/// [`PendingCall::cancel`]) abandons the call; a late response is discarded.
pub struct PendingCall {
    inner: BoxFuture<'static, BridgeResult<Value>>,
}

impl PendingCall {
    pub fn new<F>(fut: F) -> Self
    where
        F: Future<Output = BridgeResult<Value>> + Send + 'static,
    {
        Self {
            inner: Box::pin(fut),
        }
    }

    /// An already-settled call.
    pub fn ready(result: BridgeResult<Value>) -> Self {
        Self::new(futures::future::ready(result))
    }

    pub fn cancel(self) {}
}

impl Future for PendingCall {
    type Output = BridgeResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PendingCall")
    }
}

struct ErrorSlot {
    message: String,
    read: bool,
}

/// Holds the error of the completion currently being run.
#[derive(Default)]
pub struct LastError {
    slot: Mutex<Option<ErrorSlot>>,
}

impl LastError {
    /// The current error, marking it as checked.
    pub fn get(&self) -> Option<String> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_mut().map(|s| {
            s.read = true;
            s.message.clone()
        })
    }

    fn complete(&self, handler: CompletionHandler, outcome: BridgeResult<Value>) {
        let message = match outcome {
            Ok(value) => {
                handler(Ok(value));
                return;
            }
            Err(e) => e.to_string(),
        };
        {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = slot.as_ref().filter(|s| !s.read) {
                warn!(error = %previous.message, "Previous remote error was never checked");
            }
            *slot = Some(ErrorSlot {
                message: message.clone(),
                read: false,
            });
        }
        handler(Err(message));
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(unread) = slot.take().filter(|s| !s.read) {
            warn!(error = %unread.message, "Remote error was not checked by its callback");
        }
    }
}

/// A local mirror of a remote surface.
pub struct RemoteProxy {
    root: LiveValue,
    shape: Shape,
    convention: CallConvention,
    sender: Arc<dyn RequestSender>,
    last_error: Arc<LastError>,
}

impl RemoteProxy {
    pub fn build(shape: Shape, sender: Arc<dyn RequestSender>, convention: CallConvention) -> Self {
        let last_error = Arc::new(LastError::default());
        let capability = stub_capability(Arc::clone(&sender), convention, Arc::clone(&last_error));
        let root = materialize(&shape, &mut Vec::new(), &capability);
        Self {
            root,
            shape,
            convention,
            sender,
            last_error,
        }
    }

    pub fn root(&self) -> &LiveValue {
        &self.root
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn convention(&self) -> CallConvention {
        self.convention
    }

    /// The mirrored node at `path`.
    pub fn get(&self, path: &[PathSegment]) -> Option<LiveValue> {
        self.root.resolve(path)
    }

    /// Error of the callback-convention completion currently running.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.get()
    }

    /// Call the remote function at `path` and await it, whatever the
    /// proxy's convention.
    pub fn perform(&self, path: &[PathSegment], args: Vec<Value>) -> PendingCall {
        match self.shape.at(path) {
            Some(Shape::Function) => self
                .sender
                .send(RequestContent::query(path.to_vec(), args)),
            Some(_) => PendingCall::ready(Err(BridgeError::RemoteExecution(format!(
                "{} is not a function",
                format_path(path)
            )))),
            None => PendingCall::ready(Err(BridgeError::RemoteExecution(format!(
                "path not found: {}",
                format_path(path)
            )))),
        }
    }
}

fn stub_capability(
    sender: Arc<dyn RequestSender>,
    convention: CallConvention,
    last_error: Arc<LastError>,
) -> CallCapability {
    Arc::new(move |path: &[PathSegment], mut args: Vec<Argument>| -> Result<Invocation, String> {
        let completion = match (convention, args.last()) {
            (CallConvention::Callback, Some(Argument::Completion(_))) => match args.pop() {
                Some(Argument::Completion(handler)) => Some(handler),
                _ => None,
            },
            _ => None,
        };
        let mut params = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                Argument::Value(v) => params.push(v),
                Argument::Completion(_) => {
                    return Err(match convention {
                        CallConvention::Awaitable => {
                            "an awaitable proxy does not take callback arguments".to_string()
                        }
                        CallConvention::Callback => {
                            "the callback must be the last argument".to_string()
                        }
                    })
                }
            }
        }

        match completion {
            Some(handler) => {
                let runtime = tokio::runtime::Handle::try_current()
                    .map_err(|_| "no async runtime available for callback delivery".to_string())?;
                let slot = params.len();
                let call = sender.send(RequestContent::query_with_callback(path.to_vec(), params, slot));
                let last_error = Arc::clone(&last_error);
                runtime.spawn(async move {
                    let outcome = call.await;
                    last_error.complete(handler, outcome);
                });
                Ok(Invocation::Ready(Value::Null))
            }
            None => {
                let call = sender.send(RequestContent::query(path.to_vec(), params));
                Ok(Invocation::Deferred(Box::pin(async move {
                    call.await.map_err(|e| e.to_string())
                })))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tokio::sync::oneshot;

    /// Answers every query with `{"path": ..., "params": ...}`; paths
    /// starting with `fail` error out.
    #[derive(Default)]
    struct EchoSender {
        sent: Mutex<Vec<RequestContent>>,
    }

    impl RequestSender for EchoSender {
        fn send(&self, content: RequestContent) -> PendingCall {
            self.sent.lock().unwrap().push(content.clone());
            match content {
                RequestContent::Query { path, params, .. } => {
                    if path.first() == Some(&PathSegment::from("fail")) {
                        PendingCall::ready(Err(BridgeError::Application("nope".into())))
                    } else {
                        PendingCall::ready(Ok(json!({"path": path, "params": params})))
                    }
                }
                RequestContent::Introspect { .. } => PendingCall::ready(Ok(Value::Null)),
            }
        }
    }

    fn shape() -> Shape {
        Shape::Object {
            properties: BTreeMap::from([
                (
                    "windows".to_string(),
                    Shape::Object {
                        properties: BTreeMap::from([("getAll".to_string(), Shape::Function)]),
                    },
                ),
                ("fail".to_string(), Shape::Function),
                ("version".to_string(), Shape::Value { value: json!("2") }),
            ]),
        }
    }

    fn invoke(proxy: &RemoteProxy, path: &[PathSegment], args: Vec<Argument>) -> Invocation {
        proxy
            .get(path)
            .and_then(|v| v.as_callable().cloned())
            .unwrap()
            .call(args)
            .unwrap()
    }

    #[tokio::test]
    async fn test_awaitable_stub_sends_query() {
        let sender = Arc::new(EchoSender::default());
        let proxy = RemoteProxy::build(shape(), sender.clone(), CallConvention::Awaitable);
        let path: Vec<PathSegment> = vec!["windows".into(), "getAll".into()];
        match invoke(&proxy, &path, vec![Argument::Value(json!({}))]) {
            Invocation::Deferred(fut) => {
                let value = fut.await.unwrap();
                assert_eq!(value["path"], json!(["windows", "getAll"]));
                assert_eq!(value["params"], json!([{}]));
            }
            Invocation::Ready(_) => panic!("Expected deferred result"),
        }
        assert_eq!(proxy.get(&["version".into()]).unwrap().to_json(), json!("2"));
    }

    #[tokio::test]
    async fn test_awaitable_rejects_callback_argument() {
        let proxy = RemoteProxy::build(
            shape(),
            Arc::new(EchoSender::default()),
            CallConvention::Awaitable,
        );
        let callable = proxy.get(&["fail".into()]).unwrap();
        let err = callable
            .as_callable()
            .unwrap()
            .call(vec![Argument::Completion(Box::new(|_| {}))])
            .err()
            .unwrap();
        assert!(err.contains("awaitable"));
    }

    #[tokio::test]
    async fn test_callback_convention_sets_callback_index() {
        let sender = Arc::new(EchoSender::default());
        let proxy = RemoteProxy::build(shape(), sender.clone(), CallConvention::Callback);
        let (tx, rx) = oneshot::channel();
        let handler: CompletionHandler = Box::new(move |result| {
            let _ = tx.send(result);
        });
        let path: Vec<PathSegment> = vec!["windows".into(), "getAll".into()];
        let returned = invoke(
            &proxy,
            &path,
            vec![Argument::Value(json!({"populate": true})), Argument::Completion(handler)],
        );
        assert!(matches!(returned, Invocation::Ready(Value::Null)));
        let result = rx.await.unwrap().unwrap();
        assert_eq!(result["params"], json!([{"populate": true}]));
        let sent = sender.sent.lock().unwrap();
        assert!(matches!(
            &sent[0],
            RequestContent::Query { callback_index: Some(1), .. }
        ));
    }

    #[tokio::test]
    async fn test_callback_error_visible_through_last_error() {
        let proxy = Arc::new(RemoteProxy::build(
            shape(),
            Arc::new(EchoSender::default()),
            CallConvention::Callback,
        ));
        let (tx, rx) = oneshot::channel();
        let inside = Arc::clone(&proxy);
        let handler: CompletionHandler = Box::new(move |result| {
            let seen = inside.last_error();
            let _ = tx.send((result, seen));
        });
        invoke(&proxy, &["fail".into()], vec![Argument::Completion(handler)]);
        let (result, seen) = rx.await.unwrap();
        assert!(result.is_err());
        assert!(seen.unwrap().contains("nope"));
        assert!(proxy.last_error().is_none());
    }

    #[tokio::test]
    async fn test_perform_checks_shape() {
        let proxy = RemoteProxy::build(
            shape(),
            Arc::new(EchoSender::default()),
            CallConvention::Callback,
        );
        let value = proxy
            .perform(&["windows".into(), "getAll".into()], vec![])
            .await
            .unwrap();
        assert_eq!(value["path"], json!(["windows", "getAll"]));
        assert!(proxy.perform(&["version".into()], vec![]).await.is_err());
        assert!(proxy.perform(&["missing".into()], vec![]).await.is_err());
    }
}
