//! Shape descriptions: the wire-safe form of a live value.
//!
//! [`Introspector::describe`] turns a [`LiveValue`] graph into a [`Shape`];
//! [`materialize`] turns a `Shape` back into a graph whose callables are stubs
//! bound to their path. Graphs are walked recursively. Cyclic graphs built from
//! native objects recurse without bound unless a depth cap is set.

use crate::request::PathSegment;
use crate::value::{Argument, Callable, Invocation, LiveValue, EVENT_CLASS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Recursive description of a value graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Shape {
    Array { items: Vec<Shape> },
    Object { properties: BTreeMap<String, Shape> },
    /// A callable. Nothing inside a callable is described.
    Function,
    /// A literal leaf.
    Value { value: Value },
}

impl Shape {
    pub fn null() -> Self {
        Shape::Value { value: Value::Null }
    }

    /// Walk `path` through arrays and objects.
    pub fn at(&self, path: &[PathSegment]) -> Option<&Shape> {
        let Some((first, rest)) = path.split_first() else {
            return Some(self);
        };
        match (self, first) {
            (Shape::Array { items }, PathSegment::Index(i)) => items.get(*i)?.at(rest),
            (Shape::Object { properties }, PathSegment::Key(k)) => properties.get(k)?.at(rest),
            (Shape::Object { properties }, PathSegment::Index(i)) => {
                properties.get(&i.to_string())?.at(rest)
            }
            _ => None,
        }
    }

    /// Paths of every callable leaf, in traversal order.
    pub fn function_paths(&self) -> Vec<Vec<PathSegment>> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        collect_functions(self, &mut path, &mut out);
        out
    }
}

fn collect_functions(shape: &Shape, path: &mut Vec<PathSegment>, out: &mut Vec<Vec<PathSegment>>) {
    match shape {
        Shape::Function => out.push(path.clone()),
        Shape::Array { items } => {
            for (i, item) in items.iter().enumerate() {
                path.push(PathSegment::Index(i));
                collect_functions(item, path, out);
                path.pop();
            }
        }
        Shape::Object { properties } => {
            for (key, prop) in properties {
                path.push(PathSegment::Key(key.clone()));
                collect_functions(prop, path, out);
                path.pop();
            }
        }
        Shape::Value { .. } => {}
    }
}

/// Decides whether a recognizer applies to a node.
pub type Predicate = Arc<dyn Fn(&LiveValue) -> bool + Send + Sync>;

/// Custom serializer for a recognized node.
pub type Serializer = Arc<dyn Fn(&LiveValue) -> Shape + Send + Sync>;

/// A (predicate, serializer) pair consulted before default recursion.
#[derive(Clone)]
pub struct ClassRecognizer {
    pub name: String,
    predicate: Predicate,
    serializer: Serializer,
}

impl ClassRecognizer {
    pub fn new<P, S>(name: impl Into<String>, predicate: P, serializer: S) -> Self
    where
        P: Fn(&LiveValue) -> bool + Send + Sync + 'static,
        S: Fn(&LiveValue) -> Shape + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            serializer: Arc::new(serializer),
        }
    }

    /// Matches native objects reporting `class_name`.
    pub fn for_class<S>(class_name: &str, serializer: S) -> Self
    where
        S: Fn(&LiveValue) -> Shape + Send + Sync + 'static,
    {
        let class = class_name.to_string();
        Self::new(
            class_name,
            move |value| matches!(value, LiveValue::Native(obj) if obj.class_name() == class),
            serializer,
        )
    }
}

impl fmt::Debug for ClassRecognizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassRecognizer").field("name", &self.name).finish()
    }
}

/// Event handles are described by their three methods only; their listener
/// storage is never walked.
pub fn event_handle_recognizer() -> ClassRecognizer {
    ClassRecognizer::for_class(EVENT_CLASS, |_| Shape::Object {
        properties: ["addListener", "removeListener", "hasListeners"]
            .iter()
            .map(|name| (name.to_string(), Shape::Function))
            .collect(),
    })
}

/// Produces [`Shape`]s from live values.
#[derive(Debug, Clone)]
pub struct Introspector {
    recognizers: Vec<ClassRecognizer>,
    max_depth: Option<usize>,
}

impl Default for Introspector {
    fn default() -> Self {
        Self {
            recognizers: vec![event_handle_recognizer()],
            max_depth: None,
        }
    }
}

impl Introspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// An introspector with no recognizers at all.
    pub fn bare() -> Self {
        Self {
            recognizers: Vec::new(),
            max_depth: None,
        }
    }

    /// Append a recognizer. Earlier recognizers win.
    pub fn with_recognizer(mut self, recognizer: ClassRecognizer) -> Self {
        self.recognizers.push(recognizer);
        self
    }

    /// Describe at most `depth` levels below the root; deeper nodes become `null`.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn describe(&self, value: &LiveValue) -> Shape {
        let mut truncated = 0usize;
        let shape = self.describe_at(value, 0, &mut truncated);
        if truncated > 0 {
            warn!(
                truncated,
                max_depth = ?self.max_depth,
                "Shape description truncated at depth cap"
            );
        }
        shape
    }

    fn describe_at(&self, value: &LiveValue, depth: usize, truncated: &mut usize) -> Shape {
        if self.max_depth.is_some_and(|max| depth > max) {
            *truncated += 1;
            return Shape::null();
        }
        if let Some(recognizer) = self.recognizers.iter().find(|r| (r.predicate)(value)) {
            return (recognizer.serializer)(value);
        }
        match value {
            LiveValue::Scalar(v) => Shape::Value { value: v.clone() },
            LiveValue::Callable(_) => Shape::Function,
            LiveValue::Array(items) => Shape::Array {
                items: items
                    .iter()
                    .map(|item| self.describe_at(item, depth + 1, truncated))
                    .collect(),
            },
            LiveValue::Object(map) => Shape::Object {
                properties: map
                    .iter()
                    .map(|(k, v)| (k.clone(), self.describe_at(v, depth + 1, truncated)))
                    .collect(),
            },
            LiveValue::Native(obj) => Shape::Object {
                properties: obj
                    .keys()
                    .into_iter()
                    .filter_map(|k| {
                        let child = obj.get(&k)?;
                        Some((k, self.describe_at(&child, depth + 1, truncated)))
                    })
                    .collect(),
            },
        }
    }
}

/// Invoked by materialized stubs with their bound path and call arguments.
pub type CallCapability =
    Arc<dyn Fn(&[PathSegment], Vec<Argument>) -> Result<Invocation, String> + Send + Sync>;

/// Rebuild a live graph from `shape`. Callable markers become stubs that call
/// `capability` with the path accumulated from `path` onwards.
pub fn materialize(
    shape: &Shape,
    path: &mut Vec<PathSegment>,
    capability: &CallCapability,
) -> LiveValue {
    match shape {
        Shape::Value { value } => LiveValue::Scalar(value.clone()),
        Shape::Function => {
            let bound = path.clone();
            let cap = Arc::clone(capability);
            let stub_path = bound.clone();
            LiveValue::Callable(
                Callable::new(move |args| cap(&stub_path, args)).bound_to(bound),
            )
        }
        Shape::Array { items } => LiveValue::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    path.push(PathSegment::Index(i));
                    let v = materialize(item, path, capability);
                    path.pop();
                    v
                })
                .collect(),
        ),
        Shape::Object { properties } => LiveValue::Object(
            properties
                .iter()
                .map(|(key, prop)| {
                    path.push(PathSegment::Key(key.clone()));
                    let v = materialize(prop, path, capability);
                    path.pop();
                    (key.clone(), v)
                })
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::EventHandle;
    use serde_json::json;
    use std::sync::Mutex;

    fn sample_surface() -> LiveValue {
        LiveValue::object([
            ("runtime", LiveValue::object([("id", LiveValue::from(json!("ext-1")))])),
            (
                "windows",
                LiveValue::object([
                    ("getAll", LiveValue::Callable(Callable::sync(|_| Ok(json!([]))))),
                    ("WINDOW_ID_NONE", LiveValue::from(json!(-1))),
                ]),
            ),
            (
                "list",
                LiveValue::Array(vec![
                    LiveValue::from(json!(1)),
                    LiveValue::Callable(Callable::sync(|_| Ok(Value::Null))),
                    LiveValue::from(json!({"nested": [true, null]})),
                ]),
            ),
        ])
    }

    fn recording_capability() -> (CallCapability, Arc<Mutex<Vec<Vec<PathSegment>>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let cap: CallCapability = Arc::new(move |path, _args| {
            sink.lock().unwrap().push(path.to_vec());
            Ok(Invocation::Ready(Value::Null))
        });
        (cap, calls)
    }

    #[test]
    fn test_describe_basic_graph() {
        let shape = Introspector::new().describe(&sample_surface());
        assert_eq!(
            shape.at(&["windows".into(), "getAll".into()]),
            Some(&Shape::Function)
        );
        assert_eq!(
            shape.at(&["runtime".into(), "id".into()]),
            Some(&Shape::Value { value: json!("ext-1") })
        );
        assert_eq!(shape.at(&["list".into(), PathSegment::Index(1)]), Some(&Shape::Function));
    }

    #[test]
    fn test_shape_wire_format() {
        let shape = Shape::Object {
            properties: BTreeMap::from([
                ("f".to_string(), Shape::Function),
                ("n".to_string(), Shape::Value { value: json!(3) }),
            ]),
        };
        let json = serde_json::to_value(&shape).unwrap();
        assert_eq!(
            json,
            json!({"type": "object", "properties": {
                "f": {"type": "function"},
                "n": {"type": "value", "value": 3}
            }})
        );
        let back: Shape = serde_json::from_value(json).unwrap();
        assert_eq!(back, shape);
    }

    #[test]
    fn test_materialize_preserves_scalar_leaves() {
        let surface = sample_surface();
        let introspector = Introspector::new();
        let shape = introspector.describe(&surface);
        let (cap, _) = recording_capability();
        let rebuilt = materialize(&shape, &mut Vec::new(), &cap);
        assert_eq!(rebuilt.to_json(), surface.to_json());
        assert_eq!(introspector.describe(&rebuilt), shape);
    }

    #[test]
    fn test_materialized_stubs_are_bound_to_their_path() {
        let shape = Introspector::new().describe(&sample_surface());
        let (cap, calls) = recording_capability();
        let rebuilt = materialize(&shape, &mut vec!["root".into()], &cap);

        let get_all = rebuilt.resolve(&["windows".into(), "getAll".into()]).unwrap();
        let list_fn = rebuilt.resolve(&["list".into(), PathSegment::Index(1)]).unwrap();
        let get_all = get_all.as_callable().unwrap();
        let list_fn = list_fn.as_callable().unwrap();
        assert!(!get_all.ptr_eq(list_fn));

        get_all.call(vec![]).unwrap();
        list_fn.call(vec![]).unwrap();
        let expected: Vec<Vec<PathSegment>> = vec![
            vec!["root".into(), "windows".into(), "getAll".into()],
            vec!["root".into(), "list".into(), PathSegment::Index(1)],
        ];
        assert_eq!(*calls.lock().unwrap(), expected);
    }

    #[test]
    fn test_event_handle_recognized_without_listeners() {
        let handle = EventHandle::new("tabs.onUpdated");
        handle.add_listener(Arc::new(|_: &[Value]| {}));
        let surface = LiveValue::object([("onUpdated", handle.into_value())]);

        let shape = Introspector::new().describe(&surface);
        let event = shape.at(&["onUpdated".into()]).unwrap();
        match event {
            Shape::Object { properties } => {
                assert_eq!(properties.len(), 3);
                assert!(properties.contains_key("hasListeners"));
                assert!(!properties.contains_key("listeners"));
            }
            other => panic!("Expected Object, got {other:?}"),
        }

        let bare = Introspector::bare().describe(&surface);
        assert!(bare.at(&["onUpdated".into(), "listeners".into(), PathSegment::Index(0)]).is_some());
    }

    #[test]
    fn test_recognizer_order_first_match_wins() {
        let introspector = Introspector::bare()
            .with_recognizer(ClassRecognizer::for_class(EVENT_CLASS, |_| Shape::Value {
                value: json!("first"),
            }))
            .with_recognizer(ClassRecognizer::for_class(EVENT_CLASS, |_| Shape::Value {
                value: json!("second"),
            }));
        let shape = introspector.describe(&EventHandle::new("e").into_value());
        assert_eq!(shape, Shape::Value { value: json!("first") });
    }

    #[test]
    fn test_depth_cap_truncates_to_null() {
        let deep = LiveValue::object([(
            "a",
            LiveValue::object([("b", LiveValue::object([("c", LiveValue::from(json!(1)))]))]),
        )]);
        let shape = Introspector::new().with_max_depth(2).describe(&deep);
        assert_eq!(
            shape.at(&["a".into(), "b".into()]),
            Some(&Shape::Object {
                properties: BTreeMap::from([("c".to_string(), Shape::null())])
            })
        );
    }

    #[test]
    fn test_function_paths() {
        let shape = Introspector::new().describe(&sample_surface());
        let paths = shape.function_paths();
        assert_eq!(paths.len(), 2);
        assert!(paths.contains(&vec![PathSegment::from("windows"), "getAll".into()]));
    }
}
