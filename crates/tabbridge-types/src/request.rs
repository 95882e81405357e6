//! Application-layer request content carried inside `request` frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One step of a path into a live surface: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "[{i}]"),
            PathSegment::Key(k) => f.write_str(k),
        }
    }
}

/// Build a path from a dotted string: `"windows.getAll"`, `"tabs.0.id"`.
///
/// Purely numeric segments become indices.
pub fn parse_path(dotted: &str) -> Vec<PathSegment> {
    dotted
        .split('.')
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<usize>() {
            Ok(i) => PathSegment::Index(i),
            Err(_) => PathSegment::Key(s.to_string()),
        })
        .collect()
}

/// Render a path for logs and error messages: `windows.getAll`, `tabs[0]`.
pub fn format_path(path: &[PathSegment]) -> String {
    let mut out = String::new();
    for segment in path {
        match segment {
            PathSegment::Index(i) => out.push_str(&format!("[{i}]")),
            PathSegment::Key(k) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(k);
            }
        }
    }
    if out.is_empty() {
        "<root>".to_string()
    } else {
        out
    }
}

/// The `content` of a request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum RequestContent {
    /// Resolve `path`; if it is callable invoke it with `params`, otherwise
    /// return its data.
    Query {
        #[serde(default)]
        path: Vec<PathSegment>,
        #[serde(default = "empty_params")]
        params: Value,
        /// Argument slot that receives the agent's completion handler.
        #[serde(
            rename = "callbackIndex",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        callback_index: Option<usize>,
    },
    /// Resolve `path` and return its shape description.
    Introspect {
        #[serde(default)]
        path: Vec<PathSegment>,
    },
}

fn empty_params() -> Value {
    Value::Array(Vec::new())
}

impl RequestContent {
    pub fn query(path: Vec<PathSegment>, params: Vec<Value>) -> Self {
        RequestContent::Query {
            path,
            params: Value::Array(params),
            callback_index: None,
        }
    }

    pub fn query_with_callback(path: Vec<PathSegment>, params: Vec<Value>, slot: usize) -> Self {
        RequestContent::Query {
            path,
            params: Value::Array(params),
            callback_index: Some(slot),
        }
    }

    pub fn introspect(path: Vec<PathSegment>) -> Self {
        RequestContent::Introspect { path }
    }

    pub fn path(&self) -> &[PathSegment] {
        match self {
            RequestContent::Query { path, .. } | RequestContent::Introspect { path } => path,
        }
    }
}

/// Positional arguments for a `params` value: an array spreads, `null` is no
/// arguments, and any other value (typically an object) is a single argument.
pub fn params_to_args(params: &Value) -> Vec<Value> {
    match params {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}
