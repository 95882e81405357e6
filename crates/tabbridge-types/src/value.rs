//! Live values: an in-process API surface that can be introspected and invoked.
//!
//! A [`LiveValue`] is a graph of plain data, callables and opaque host objects.
//! The agent holds one as its surface root; the proxy builder produces one
//! whose callables forward to a remote agent.

use crate::request::PathSegment;
use futures::future::BoxFuture;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Receives the outcome of a callback-style call. `Err` carries the
/// application-level failure the API reported.
pub type CompletionHandler = Box<dyn FnOnce(Result<Value, String>) + Send>;

/// One argument passed to a [`Callable`].
pub enum Argument {
    Value(Value),
    Completion(CompletionHandler),
}

impl fmt::Debug for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Argument::Value(v) => write!(f, "Value({v})"),
            Argument::Completion(_) => f.write_str("Completion(..)"),
        }
    }
}

/// What a callable produced when invoked.
pub enum Invocation {
    /// Returned synchronously.
    Ready(Value),
    /// Will settle later. `Err` is an application failure.
    Deferred(BoxFuture<'static, Result<Value, String>>),
}

type CallFn = dyn Fn(Vec<Argument>) -> Result<Invocation, String> + Send + Sync;

/// A function embedded in a live surface.
///
/// Returning `Err` from the function is the equivalent of a synchronous
/// exception: the caller did not get as far as starting the operation.
#[derive(Clone)]
pub struct Callable {
    func: Arc<CallFn>,
    bound_path: Option<Vec<PathSegment>>,
}

impl Callable {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(Vec<Argument>) -> Result<Invocation, String> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            bound_path: None,
        }
    }

    /// A plain synchronous function over JSON arguments. Completion arguments
    /// are dropped.
    pub fn sync<F>(func: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self::new(move |args| func(values_only(args)).map(Invocation::Ready))
    }

    /// A callback-style function: the completion handler is extracted from
    /// wherever it was placed and handed over separately.
    pub fn with_callback<F>(func: F) -> Self
    where
        F: Fn(Vec<Value>, CompletionHandler) -> Result<(), String> + Send + Sync + 'static,
    {
        Self::new(move |args| {
            let mut values = Vec::with_capacity(args.len());
            let mut completion = None;
            for arg in args {
                match arg {
                    Argument::Value(v) => values.push(v),
                    Argument::Completion(h) if completion.is_none() => completion = Some(h),
                    Argument::Completion(_) => return Err("more than one callback".to_string()),
                }
            }
            let completion = completion.ok_or_else(|| "missing callback argument".to_string())?;
            func(values, completion)?;
            Ok(Invocation::Ready(Value::Null))
        })
    }

    /// An async function over JSON arguments.
    pub fn future<F, Fut>(func: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        Self::new(move |args| Ok(Invocation::Deferred(Box::pin(func(values_only(args))))))
    }

    /// Mark this callable as a stub standing in for the remote function at `path`.
    pub fn bound_to(mut self, path: Vec<PathSegment>) -> Self {
        self.bound_path = Some(path);
        self
    }

    /// The remote path this callable forwards to, if it is a materialized stub.
    pub fn bound_path(&self) -> Option<&[PathSegment]> {
        self.bound_path.as_deref()
    }

    pub fn call(&self, args: Vec<Argument>) -> Result<Invocation, String> {
        (self.func)(args)
    }

    pub fn ptr_eq(&self, other: &Callable) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bound_path {
            Some(path) => write!(f, "Callable({})", crate::request::format_path(path)),
            None => f.write_str("Callable"),
        }
    }
}

fn values_only(args: Vec<Argument>) -> Vec<Value> {
    args.into_iter()
        .filter_map(|a| match a {
            Argument::Value(v) => Some(v),
            Argument::Completion(_) => None,
        })
        .collect()
}

/// An opaque host object exposed through the surface.
///
/// Without a matching class recognizer the introspector describes a native
/// object by recursing over [`NativeObject::keys`].
pub trait NativeObject: Send + Sync + fmt::Debug + 'static {
    /// Name used by class recognizers to pick this object out.
    fn class_name(&self) -> &str;
    fn keys(&self) -> Vec<String>;
    fn get(&self, key: &str) -> Option<LiveValue>;
    fn as_any(&self) -> &dyn Any;
}

/// A node in a live surface graph.
#[derive(Clone)]
pub enum LiveValue {
    Scalar(Value),
    Array(Vec<LiveValue>),
    Object(BTreeMap<String, LiveValue>),
    Callable(Callable),
    Native(Arc<dyn NativeObject>),
}

impl LiveValue {
    pub fn null() -> Self {
        LiveValue::Scalar(Value::Null)
    }

    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, LiveValue)>,
    {
        LiveValue::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_callable(&self) -> Option<&Callable> {
        match self {
            LiveValue::Callable(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, LiveValue::Callable(_))
    }

    /// Downcast a native node to a concrete host type.
    pub fn as_native<T: NativeObject>(&self) -> Option<&T> {
        match self {
            LiveValue::Native(obj) => obj.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Walk `path` from this node. Scalars are walked as JSON.
    pub fn resolve(&self, path: &[PathSegment]) -> Option<LiveValue> {
        let Some((first, rest)) = path.split_first() else {
            return Some(self.clone());
        };
        match (self, first) {
            (LiveValue::Object(map), PathSegment::Key(k)) => map.get(k)?.resolve(rest),
            (LiveValue::Object(map), PathSegment::Index(i)) => {
                map.get(&i.to_string())?.resolve(rest)
            }
            (LiveValue::Array(items), PathSegment::Index(i)) => items.get(*i)?.resolve(rest),
            (LiveValue::Native(obj), PathSegment::Key(k)) => obj.get(k)?.resolve(rest),
            (LiveValue::Native(obj), PathSegment::Index(i)) => {
                obj.get(&i.to_string())?.resolve(rest)
            }
            (LiveValue::Scalar(v), PathSegment::Key(k)) => {
                LiveValue::Scalar(v.get(k)?.clone()).resolve(rest)
            }
            (LiveValue::Scalar(v), PathSegment::Index(i)) => {
                LiveValue::Scalar(v.get(*i)?.clone()).resolve(rest)
            }
            _ => None,
        }
    }

    /// Render the data part of the graph as JSON. Callables and native
    /// objects become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            LiveValue::Scalar(v) => v.clone(),
            LiveValue::Array(items) => Value::Array(items.iter().map(|i| i.to_json()).collect()),
            LiveValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            LiveValue::Callable(_) | LiveValue::Native(_) => Value::Null,
        }
    }
}

impl From<Value> for LiveValue {
    fn from(value: Value) -> Self {
        LiveValue::Scalar(value)
    }
}

impl From<Callable> for LiveValue {
    fn from(callable: Callable) -> Self {
        LiveValue::Callable(callable)
    }
}

impl fmt::Debug for LiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiveValue::Scalar(v) => write!(f, "{v}"),
            LiveValue::Array(items) => f.debug_list().entries(items).finish(),
            LiveValue::Object(map) => f.debug_map().entries(map).finish(),
            LiveValue::Callable(c) => c.fmt(f),
            LiveValue::Native(obj) => write!(f, "Native({})", obj.class_name()),
        }
    }
}

/// Identifies a listener attached to an [`EventHandle`].
pub type ListenerId = u64;

/// A listener receiving event arguments.
pub type Listener = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Class name reported by [`EventHandle`].
pub const EVENT_CLASS: &str = "Event";

/// An event source on a live surface (`tabs.onUpdated`, ...).
///
/// Host code calls [`EventHandle::emit`]; the agent attaches a forwarding
/// listener while at least one client is subscribed.
pub struct EventHandle {
    name: String,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
}

impl EventHandle {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_listener(&self, listener: Listener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Deliver `args` to every listener. Listeners run outside the lock so
    /// they may add or remove listeners themselves.
    pub fn emit(&self, args: &[Value]) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(args);
        }
    }

    /// Wrap this handle as a surface node.
    pub fn into_value(self: &Arc<Self>) -> LiveValue {
        LiveValue::Native(Arc::clone(self) as Arc<dyn NativeObject>)
    }
}

impl fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandle")
            .field("name", &self.name)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl NativeObject for EventHandle {
    fn class_name(&self) -> &str {
        EVENT_CLASS
    }

    fn keys(&self) -> Vec<String> {
        ["addListener", "removeListener", "hasListeners", "listeners"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn get(&self, key: &str) -> Option<LiveValue> {
        let name = self.name.clone();
        match key {
            "addListener" | "removeListener" => Some(LiveValue::Callable(Callable::sync(
                move |_| Err(format!("listeners on '{name}' cannot be attached remotely; subscribe instead")),
            ))),
            "hasListeners" => {
                let count = self.listener_count();
                Some(LiveValue::Callable(Callable::sync(move |_| {
                    Ok(Value::Bool(count > 0))
                })))
            }
            "listeners" => {
                let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
                Some(LiveValue::Array(
                    listeners
                        .iter()
                        .map(|(_, l)| {
                            let l = Arc::clone(l);
                            LiveValue::Callable(Callable::sync(move |args| {
                                l(args.as_slice());
                                Ok(Value::Null)
                            }))
                        })
                        .collect(),
                ))
            }
            _ => None,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn surface() -> LiveValue {
        LiveValue::object([
            ("version", LiveValue::from(json!("1.2"))),
            (
                "tabs",
                LiveValue::object([(
                    "get",
                    LiveValue::Callable(Callable::sync(|args| Ok(json!({"id": args[0]})))),
                )]),
            ),
            (
                "list",
                LiveValue::Array(vec![LiveValue::from(json!(1)), LiveValue::from(json!({"a": [5]}))]),
            ),
        ])
    }

    #[test]
    fn test_resolve_object_array_and_scalar_paths() {
        let root = surface();
        let v = root.resolve(&["version".into()]).unwrap();
        assert_eq!(v.to_json(), json!("1.2"));
        let nested = root
            .resolve(&["list".into(), PathSegment::Index(1), "a".into(), PathSegment::Index(0)])
            .unwrap();
        assert_eq!(nested.to_json(), json!(5));
        assert!(root.resolve(&["missing".into()]).is_none());
        assert!(root.resolve(&["tabs".into(), "get".into()]).unwrap().is_callable());
    }

    #[test]
    fn test_to_json_nulls_callables() {
        let json = surface().to_json();
        assert_eq!(json["tabs"]["get"], Value::Null);
        assert_eq!(json["list"][0], json!(1));
    }

    #[test]
    fn test_with_callback_extracts_handler() {
        let callable = Callable::with_callback(|args, done| {
            done(Ok(json!(args.len())));
            Ok(())
        });
        let (tx, rx) = std::sync::mpsc::channel();
        let handler: CompletionHandler = Box::new(move |r| {
            tx.send(r).unwrap();
        });
        callable
            .call(vec![
                Argument::Value(json!(1)),
                Argument::Completion(handler),
            ])
            .unwrap();
        assert_eq!(rx.recv().unwrap(), Ok(json!(1)));
    }

    #[test]
    fn test_with_callback_requires_handler() {
        let callable = Callable::with_callback(|_, _| Ok(()));
        let err = callable.call(vec![Argument::Value(json!(1))]).err().unwrap();
        assert!(err.contains("missing callback"));
    }

    #[tokio::test]
    async fn test_future_callable_settles_later() {
        let callable = Callable::future(|args| async move {
            tokio::task::yield_now().await;
            match args.first() {
                Some(v) => Ok(json!({"got": v})),
                None => Err("no argument".to_string()),
            }
        });
        let Ok(Invocation::Deferred(fut)) = callable.call(vec![Argument::Value(json!(3))]) else {
            panic!("Expected a deferred invocation");
        };
        assert_eq!(fut.await, Ok(json!({"got": 3})));

        let Ok(Invocation::Deferred(fut)) = callable.call(vec![]) else {
            panic!("Expected a deferred invocation");
        };
        assert_eq!(fut.await, Err("no argument".to_string()));
    }

    #[test]
    fn test_event_handle_listeners() {
        let handle = EventHandle::new("tabs.onUpdated");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = handle.add_listener(Arc::new(move |args: &[Value]| {
            sink.lock().unwrap().push(args.to_vec());
        }));
        handle.emit(&[json!(7)]);
        assert!(handle.remove_listener(id));
        handle.emit(&[json!(8)]);
        assert_eq!(*seen.lock().unwrap(), vec![vec![json!(7)]]);
        assert!(!handle.remove_listener(id));
    }

    #[test]
    fn test_event_handle_downcast() {
        let handle = EventHandle::new("onChanged");
        let value = handle.into_value();
        assert_eq!(value.as_native::<EventHandle>().unwrap().name(), "onChanged");
    }
}
