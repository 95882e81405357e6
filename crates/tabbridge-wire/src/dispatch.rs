//! Request dispatch against a live surface.
//!
//! Used by the agent for inbound requests and by the broker for requests
//! addressed to the server itself. Resolution and invocation failures,
//! including panics, become error responses; a request is answered at most
//! once.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use serde_json::Value;
use tabbridge_types::request::{format_path, params_to_args};
use tabbridge_types::value::{Argument, Callable, Invocation};
use tabbridge_types::{BridgeError, BridgeResult, Introspector, LiveValue, PathSegment, RequestContent};
use tracing::{debug, error, warn};

use crate::message::Frame;

/// Where a responder delivers its response frame.
pub type ResponseSink = Arc<dyn Fn(Frame) + Send + Sync>;

/// Answers one inbound request, at most once.
#[derive(Clone)]
pub struct Responder {
    request_id: u64,
    answered: Arc<AtomicBool>,
    sink: ResponseSink,
}

impl Responder {
    pub fn new(request_id: u64, sink: ResponseSink) -> Self {
        Self {
            request_id,
            answered: Arc::new(AtomicBool::new(false)),
            sink,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::SeqCst)
    }

    /// Send the response. A second answer is a programming error: it is
    /// logged and dropped.
    pub fn respond(&self, result: BridgeResult<Value>) -> BridgeResult<()> {
        if self.answered.swap(true, Ordering::SeqCst) {
            error!(
                request_id = self.request_id,
                "Request answered twice; dropping second response"
            );
            return Err(BridgeError::Protocol(format!(
                "request {} already answered",
                self.request_id
            )));
        }
        (self.sink)(Frame::outcome(self.request_id, result));
        Ok(())
    }

    /// Report a synchronous failure unless a response already went out.
    fn fail_unless_answered(&self, err: BridgeError) {
        if self.is_answered() {
            warn!(
                request_id = self.request_id,
                error = %err,
                "Failure after request was already answered"
            );
        } else {
            let _ = self.respond(Err(err));
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Resolve the request's path under `root` and answer it through `responder`.
pub fn dispatch(
    root: &LiveValue,
    introspector: &Introspector,
    content: RequestContent,
    responder: Responder,
) {
    let path: Vec<PathSegment> = content.path().to_vec();
    let resolved = match catch_unwind(AssertUnwindSafe(|| root.resolve(&path))) {
        Ok(Some(value)) => value,
        Ok(None) => {
            responder.fail_unless_answered(BridgeError::RemoteExecution(format!(
                "path not found: {}",
                format_path(&path)
            )));
            return;
        }
        Err(panic) => {
            responder.fail_unless_answered(BridgeError::RemoteExecution(format!(
                "resolving {} panicked: {}",
                format_path(&path),
                panic_message(panic)
            )));
            return;
        }
    };

    match content {
        RequestContent::Introspect { .. } => {
            match catch_unwind(AssertUnwindSafe(|| introspector.describe(&resolved))) {
                Ok(shape) => {
                    let _ = responder.respond(serde_json::to_value(shape).map_err(BridgeError::from));
                }
                Err(panic) => responder.fail_unless_answered(BridgeError::RemoteExecution(
                    format!("introspection panicked: {}", panic_message(panic)),
                )),
            }
        }
        RequestContent::Query {
            params,
            callback_index,
            ..
        } => match resolved {
            LiveValue::Callable(callable) => {
                debug!(path = %format_path(&path), ?callback_index, "Invoking callable");
                invoke(&callable, params_to_args(&params), callback_index, responder);
            }
            other => {
                let _ = responder.respond(Ok(other.to_json()));
            }
        },
    }
}

/// Completion handler injected into a callback slot.
///
/// If the callable drops the handler without calling it, the request is still
/// answered: with the callable's own return value when the drop happens before
/// the invocation settles, or with an error when it happens afterwards.
struct CompletionSlot {
    responder: Responder,
    state: Arc<Mutex<SlotState>>,
    called: bool,
}

#[derive(Default)]
struct SlotState {
    dropped: bool,
    settled: bool,
}

impl CompletionSlot {
    fn complete(mut self, result: Result<Value, String>) {
        self.called = true;
        let _ = self.responder.respond(result.map_err(BridgeError::Application));
    }
}

impl Drop for CompletionSlot {
    fn drop(&mut self) {
        if self.called {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.settled {
            self.responder.fail_unless_answered(BridgeError::RemoteExecution(
                "completion handler dropped without being called".to_string(),
            ));
        } else {
            state.dropped = true;
        }
    }
}

/// The invocation returned `value`. Answer with it if the handler is already
/// gone; otherwise leave the answer to the handler.
fn settle(state: &Mutex<SlotState>, responder: &Responder, value: Value) {
    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
    if state.dropped {
        if !responder.is_answered() {
            debug!(
                request_id = responder.request_id(),
                "Completion handler unused, answering with return value"
            );
            let _ = responder.respond(Ok(value));
        }
    } else {
        state.settled = true;
    }
}

fn invoke(callable: &Callable, args: Vec<Value>, callback_index: Option<usize>, responder: Responder) {
    let mut argv: Vec<Argument> = args.into_iter().map(Argument::Value).collect();
    let slot_state = callback_index.map(|slot| {
        while argv.len() < slot {
            argv.push(Argument::Value(Value::Null));
        }
        let state = Arc::new(Mutex::new(SlotState::default()));
        let completion = CompletionSlot {
            responder: responder.clone(),
            state: Arc::clone(&state),
            called: false,
        };
        argv.insert(
            slot,
            Argument::Completion(Box::new(move |result: Result<Value, String>| {
                completion.complete(result)
            })),
        );
        state
    });

    match catch_unwind(AssertUnwindSafe(|| callable.call(argv))) {
        Ok(Ok(Invocation::Ready(value))) => match &slot_state {
            Some(state) => settle(state, &responder, value),
            None => {
                let _ = responder.respond(Ok(value));
            }
        },
        Ok(Ok(Invocation::Deferred(fut))) => {
            tokio::spawn(async move {
                let outcome = AssertUnwindSafe(fut).catch_unwind().await;
                let result = match outcome {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(msg)) => Err(BridgeError::Application(msg)),
                    Err(panic) => Err(BridgeError::RemoteExecution(format!(
                        "invocation panicked: {}",
                        panic_message(panic)
                    ))),
                };
                match (slot_state, result) {
                    (None, result) => {
                        let _ = responder.respond(result);
                    }
                    (Some(state), Ok(value)) => settle(&state, &responder, value),
                    (Some(_), Err(e)) => responder.fail_unless_answered(e),
                }
            });
        }
        Ok(Err(msg)) => responder.fail_unless_answered(BridgeError::RemoteExecution(msg)),
        Err(panic) => responder.fail_unless_answered(BridgeError::RemoteExecution(format!(
            "invocation panicked: {}",
            panic_message(panic)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tabbridge_types::value::CompletionHandler;

    type Captured = Arc<Mutex<Vec<Frame>>>;

    fn capture() -> (ResponseSink, Captured) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink_frames = Arc::clone(&frames);
        let sink: ResponseSink = Arc::new(move |frame| sink_frames.lock().unwrap().push(frame));
        (sink, frames)
    }

    fn surface() -> LiveValue {
        LiveValue::object([
            (
                "windows",
                LiveValue::object([(
                    "getAll",
                    LiveValue::Callable(Callable::with_callback(|_args, done: CompletionHandler| {
                        done(Ok(json!([{"id": 1}])));
                        Ok(())
                    })),
                )]),
            ),
            ("version", LiveValue::from(json!("1.0"))),
            (
                "add",
                LiveValue::Callable(Callable::sync(|args| {
                    let a = args.first().and_then(Value::as_i64).ok_or("a missing")?;
                    let b = args.get(1).and_then(Value::as_i64).ok_or("b missing")?;
                    Ok(json!(a + b))
                })),
            ),
            (
                "explode",
                LiveValue::Callable(Callable::sync(|_| panic!("kaboom"))),
            ),
            (
                "twice",
                LiveValue::Callable(Callable::with_callback(|_args, done| {
                    done(Ok(json!(1)));
                    Err("late failure".to_string())
                })),
            ),
            (
                "denied",
                LiveValue::Callable(Callable::with_callback(|_args, done| {
                    done(Err("permission denied".to_string()));
                    Ok(())
                })),
            ),
            (
                "forget",
                LiveValue::Callable(Callable::with_callback(|_args, done| {
                    drop(done);
                    Ok(())
                })),
            ),
            (
                "slow",
                LiveValue::Callable(Callable::future(|args| async move {
                    Ok::<_, String>(json!({"echo": args}))
                })),
            ),
        ])
    }

    fn run(content: RequestContent) -> Vec<Frame> {
        let (sink, frames) = capture();
        dispatch(&surface(), &Introspector::new(), content, Responder::new(9, sink));
        let frames = frames.lock().unwrap().clone();
        frames
    }

    fn single(content: RequestContent) -> BridgeResult<Value> {
        let frames = run(content);
        assert_eq!(frames.len(), 1, "expected exactly one response: {frames:?}");
        match frames.into_iter().next().unwrap() {
            Frame::Response {
                response_id,
                success,
                content,
                error,
                error_kind,
            } => {
                assert_eq!(response_id, 9);
                crate::message::response_outcome(success, content, error, error_kind)
            }
            other => panic!("Expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_callback_style_query() {
        let result = single(RequestContent::query_with_callback(
            vec!["windows".into(), "getAll".into()],
            vec![json!({})],
            1,
        ));
        assert_eq!(result.unwrap(), json!([{"id": 1}]));
    }

    #[test]
    fn test_sync_call_and_data_query() {
        assert_eq!(
            single(RequestContent::query(vec!["add".into()], vec![json!(2), json!(3)])).unwrap(),
            json!(5)
        );
        assert_eq!(
            single(RequestContent::query(vec!["version".into()], vec![])).unwrap(),
            json!("1.0")
        );
    }

    #[test]
    fn test_missing_path_is_remote_execution_error() {
        let err = single(RequestContent::query(vec!["nope".into()], vec![])).unwrap_err();
        assert!(matches!(err, BridgeError::RemoteExecution(m) if m.contains("nope")));
    }

    #[test]
    fn test_synchronous_error_becomes_response() {
        let err = single(RequestContent::query(vec!["add".into()], vec![])).unwrap_err();
        assert!(matches!(err, BridgeError::RemoteExecution(m) if m == "a missing"));
    }

    #[test]
    fn test_panic_is_caught() {
        let err = single(RequestContent::query(vec!["explode".into()], vec![])).unwrap_err();
        assert!(matches!(err, BridgeError::RemoteExecution(m) if m.contains("kaboom")));
    }

    #[test]
    fn test_error_after_answer_is_only_logged() {
        let result = single(RequestContent::query_with_callback(vec!["twice".into()], vec![], 0));
        assert_eq!(result.unwrap(), json!(1));
    }

    #[test]
    fn test_callback_error_is_application_error() {
        let err = single(RequestContent::query_with_callback(vec!["denied".into()], vec![], 0))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Application(m) if m == "permission denied"));
    }

    #[test]
    fn test_sync_callable_with_callback_slot_still_answers() {
        let result = single(RequestContent::query_with_callback(
            vec!["add".into()],
            vec![json!(4), json!(5)],
            2,
        ));
        assert_eq!(result.unwrap(), json!(9));
    }

    #[test]
    fn test_dropped_handler_answers_with_return_value() {
        let result = single(RequestContent::query_with_callback(vec!["forget".into()], vec![], 0));
        assert_eq!(result.unwrap(), Value::Null);
    }

    #[test]
    fn test_handler_dropped_after_return_is_error() {
        let stash: Arc<Mutex<Option<CompletionHandler>>> = Arc::new(Mutex::new(None));
        let held = Arc::clone(&stash);
        let root = LiveValue::object([(
            "later",
            LiveValue::Callable(Callable::with_callback(move |_args, done| {
                *held.lock().unwrap() = Some(done);
                Ok(())
            })),
        )]);
        let (sink, frames) = capture();
        dispatch(
            &root,
            &Introspector::new(),
            RequestContent::query_with_callback(vec!["later".into()], vec![], 0),
            Responder::new(3, sink),
        );
        assert!(frames.lock().unwrap().is_empty());

        stash.lock().unwrap().take();
        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Response { success, error, .. } => {
                assert!(!success);
                assert!(error.as_deref().unwrap_or("").contains("dropped without being called"));
            }
            other => panic!("Expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_future_with_callback_slot_answers_with_output() {
        let (sink, frames) = capture();
        dispatch(
            &surface(),
            &Introspector::new(),
            RequestContent::query_with_callback(vec!["slow".into()], vec![json!("x")], 1),
            Responder::new(6, sink),
        );
        for _ in 0..50 {
            if !frames.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let frames = frames.lock().unwrap();
        assert_eq!(frames.as_slice(), &[Frame::success(6, json!({"echo": ["x"]}))]);
    }

    #[test]
    fn test_introspect_returns_shape() {
        let shape = single(RequestContent::introspect(vec!["windows".into()])).unwrap();
        assert_eq!(
            shape,
            json!({"type": "object", "properties": {"getAll": {"type": "function"}}})
        );
    }

    #[test]
    fn test_responder_rejects_second_answer() {
        let (sink, frames) = capture();
        let responder = Responder::new(1, sink);
        assert!(responder.respond(Ok(json!(1))).is_ok());
        assert!(matches!(
            responder.respond(Ok(json!(2))),
            Err(BridgeError::Protocol(_))
        ));
        assert_eq!(frames.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deferred_invocation() {
        let (sink, frames) = capture();
        dispatch(
            &surface(),
            &Introspector::new(),
            RequestContent::query(vec!["slow".into()], vec![json!("hi")]),
            Responder::new(4, sink),
        );
        for _ in 0..50 {
            if !frames.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let frames = frames.lock().unwrap();
        assert_eq!(frames.as_slice(), &[Frame::success(4, json!({"echo": ["hi"]}))]);
    }
}
