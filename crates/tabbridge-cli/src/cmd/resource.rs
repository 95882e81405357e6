//! Resource commands (`list/create/update/remove <tabs|windows|bookmarks>`)
//! mapped onto callback-style browser API calls.
//!
//! Every call passes its parameters positionally and asks the agent to
//! inject the completion callback right after them.

use serde_json::{json, Value};
use tabbridge_types::request::parse_path;
use tabbridge_types::RequestContent;

use super::{CliError, CliResult};
use crate::cli::Resource;

impl Resource {
    fn namespace(self) -> &'static str {
        match self {
            Resource::Tabs => "tabs",
            Resource::Windows => "windows",
            Resource::Bookmarks => "bookmarks",
        }
    }

    fn list_method(self) -> &'static str {
        match self {
            Resource::Tabs => "query",
            Resource::Windows => "getAll",
            Resource::Bookmarks => "getTree",
        }
    }

    /// Tab and window ids are integers; bookmark ids are strings.
    fn parse_id(self, id: &str) -> CliResult<Value> {
        match self {
            Resource::Bookmarks => Ok(Value::String(id.to_string())),
            Resource::Tabs | Resource::Windows => id
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| CliError::Usage(format!("{} id must be an integer, got '{id}'", self.namespace()))),
        }
    }
}

fn call(resource: Resource, method: &str, params: Vec<Value>) -> RequestContent {
    let path = parse_path(&format!("{}.{method}", resource.namespace()));
    let slot = params.len();
    RequestContent::query_with_callback(path, params, slot)
}

/// Parse a JSON object argument.
pub fn parse_object(what: &str, text: &str) -> CliResult<Value> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| CliError::Usage(format!("{what} is not valid JSON: {e}")))?;
    if !value.is_object() {
        return Err(CliError::Usage(format!("{what} must be a JSON object")));
    }
    Ok(value)
}

pub fn list(resource: Resource, filter: Option<&str>) -> CliResult<RequestContent> {
    let params = match (resource, filter) {
        (Resource::Bookmarks, Some(_)) => {
            return Err(CliError::Usage("bookmarks cannot be filtered".to_string()))
        }
        (Resource::Bookmarks, None) => vec![],
        (_, Some(filter)) => vec![parse_object("filter", filter)?],
        (_, None) => vec![json!({})],
    };
    Ok(call(resource, resource.list_method(), params))
}

pub fn create(resource: Resource, properties: &str) -> CliResult<RequestContent> {
    let properties = parse_object("properties", properties)?;
    Ok(call(resource, "create", vec![properties]))
}

pub fn update(resource: Resource, id: &str, properties: &str) -> CliResult<RequestContent> {
    let id = resource.parse_id(id)?;
    let properties = parse_object("properties", properties)?;
    Ok(call(resource, "update", vec![id, properties]))
}

pub fn remove(resource: Resource, id: &str) -> CliResult<RequestContent> {
    let id = resource.parse_id(id)?;
    Ok(call(resource, "remove", vec![id]))
}
