//! One-shot requests: connect, send, print the result, disconnect.

use serde_json::Value;
use tabbridge_types::config::{BridgeConfig, ClientConfig};
use tabbridge_types::request::{format_path, parse_path};
use tabbridge_types::value::{Argument, CompletionHandler, Invocation};
use tabbridge_types::{BridgeError, RequestContent, Target};
use tabbridge_wire::credentials::{default_key_root, read_key};
use tabbridge_wire::{BridgeClient, CallConvention};
use tokio::sync::oneshot;
use tracing::debug;

use super::{CliError, CliResult};
use crate::cli::Cli;
use crate::config::{default_port, url_port};
use crate::ui;

/// Client settings after applying command-line overrides.
pub struct Connection {
    config: ClientConfig,
}

impl Connection {
    pub fn from_cli(cli: &Cli, config: &BridgeConfig) -> Self {
        let mut client = config.client.clone();
        if let Some(url) = &cli.url {
            client.url = url.clone();
        }
        if let Some(user) = &cli.user {
            client.username = user.clone();
        }
        if let Some(key) = &cli.key {
            client.key = Some(key.clone());
        }
        if client.key.is_none() {
            let root = config.broker.key_dir.clone().or_else(default_key_root);
            let port = url_port(&client.url).unwrap_or_else(default_port);
            client.key = match root.map(|root| read_key(&root, port, &client.username)) {
                Some(Ok(key)) => Some(key.to_string()),
                Some(Err(e)) => {
                    debug!(error = %e, "No key file, registering without a key");
                    None
                }
                None => None,
            };
        }
        Self { config: client }
    }

    async fn open(&self) -> CliResult<BridgeClient> {
        Ok(BridgeClient::connect(&self.config).await?)
    }
}

/// Parse a command-line argument as JSON, treating bare words as strings.
fn parse_arg(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn parse_params(text: Option<&str>) -> CliResult<Value> {
    let Some(text) = text else {
        return Ok(Value::Array(Vec::new()));
    };
    let value: Value = serde_json::from_str(text)
        .map_err(|e| CliError::Usage(format!("params are not valid JSON: {e}")))?;
    match value {
        Value::Array(_) | Value::Object(_) => Ok(value),
        _ => Err(CliError::Usage("params must be a JSON array or object".to_string())),
    }
}

async fn finish<T>(client: BridgeClient, result: CliResult<T>) -> CliResult<T> {
    client.close().await;
    result
}

pub async fn cmd_agents(connection: &Connection, compact: bool) -> CliResult<()> {
    let client = connection.open().await?;
    let agents = client
        .query(Target::server(), parse_path("agents"), Vec::new())
        .await
        .map_err(CliError::from);
    let agents = finish(client, agents).await?;
    if compact {
        ui::json(&agents, true);
        return Ok(());
    }
    let list = agents.as_array().cloned().unwrap_or_default();
    if list.is_empty() {
        ui::kv_warn("Agents", "none connected");
        ui::hint("start a browser with the TabBridge extension installed");
        return Ok(());
    }
    ui::section(&format!("{} agent(s) connected", list.len()));
    for agent in &list {
        println!(
            "{:<10}{:<20}{}",
            agent["kind"].as_str().unwrap_or("?"),
            agent["identifier"].as_str().unwrap_or("-"),
            agent["session"].as_str().unwrap_or("?"),
        );
    }
    Ok(())
}

pub async fn cmd_query(
    connection: &Connection,
    target: Target,
    path: &str,
    params: Option<&str>,
    callback_index: Option<usize>,
    compact: bool,
) -> CliResult<()> {
    let content = RequestContent::Query {
        path: parse_path(path),
        params: parse_params(params)?,
        callback_index,
    };
    cmd_resource(connection, target, content, compact).await
}

pub async fn cmd_resource(
    connection: &Connection,
    target: Target,
    content: RequestContent,
    compact: bool,
) -> CliResult<()> {
    let client = connection.open().await?;
    debug!(%target, path = %format_path(content.path()), "Sending request");
    let result = client.request(target, content).await.map_err(CliError::from);
    let value = finish(client, result).await?;
    ui::json(&value, compact);
    Ok(())
}

pub async fn cmd_introspect(
    connection: &Connection,
    target: Target,
    path: Option<&str>,
    compact: bool,
) -> CliResult<()> {
    let client = connection.open().await?;
    let path = path.map(parse_path).unwrap_or_default();
    let shape = client.introspect(target, path).await.map_err(CliError::from);
    let shape = finish(client, shape).await?;
    let value = serde_json::to_value(shape).map_err(BridgeError::from)?;
    ui::json(&value, compact);
    Ok(())
}

/// Call a function through a proxy of the target's surface.
pub async fn cmd_call(
    connection: &Connection,
    target: Target,
    path: &str,
    args: &[String],
    callback: bool,
    compact: bool,
) -> CliResult<()> {
    let client = connection.open().await?;
    let result = call_through_proxy(&client, target, path, args, callback).await;
    let value = finish(client, result).await?;
    ui::json(&value, compact);
    Ok(())
}

async fn call_through_proxy(
    client: &BridgeClient,
    target: Target,
    path: &str,
    args: &[String],
    callback: bool,
) -> CliResult<Value> {
    let path = parse_path(path);
    let values: Vec<Value> = args.iter().map(|a| parse_arg(a)).collect();
    if !callback {
        let proxy = client.proxy(target, CallConvention::Awaitable).await?;
        return Ok(proxy.perform(&path, values).await?);
    }

    let proxy = client.proxy(target, CallConvention::Callback).await?;
    let Some(node) = proxy.get(&path) else {
        return Err(BridgeError::RemoteExecution(format!("path not found: {}", format_path(&path))).into());
    };
    let Some(stub) = node.as_callable() else {
        return Err(BridgeError::RemoteExecution(format!("{} is not a function", format_path(&path))).into());
    };
    let (tx, rx) = oneshot::channel();
    let done: CompletionHandler = Box::new(move |result| {
        let _ = tx.send(result);
    });
    let mut argv: Vec<Argument> = values.into_iter().map(Argument::Value).collect();
    argv.push(Argument::Completion(done));
    match stub.call(argv) {
        Ok(Invocation::Ready(_)) => {}
        Ok(Invocation::Deferred(_)) => {
            return Err(BridgeError::Protocol("callback stub returned a deferred result".to_string()).into())
        }
        Err(msg) => return Err(BridgeError::RemoteExecution(msg).into()),
    }
    match rx.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(msg)) => Err(BridgeError::Application(msg).into()),
        Err(_) => Err(BridgeError::Disconnected.into()),
    }
}
