//! Configuration types for the broker, client and agent.
//!
//! Every struct uses `#[serde(default)]` so a partial `config.toml` is valid.

use crate::error::{BridgeError, BridgeResult};
use crate::target::AgentKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default broker listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7979";

/// Default username used by the CLI and generated key files.
pub const DEFAULT_USERNAME: &str = "default";

/// Top-level `config.toml` layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub broker: BrokerConfig,
    pub client: ClientConfig,
    pub agent: AgentConfig,
}

/// Broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address to bind, `host:port`.
    pub listen_addr: String,
    /// Accept every client registration without checking credentials.
    pub open_mode: bool,
    /// Static username → key table, merged with generated key files.
    pub credentials: BTreeMap<String, String>,
    /// Usernames that get a key file under the key directory.
    pub users: Vec<String>,
    /// Directory holding key files. Defaults to `~/.tabbridge/keys`.
    pub key_dir: Option<PathBuf>,
    /// When set, agent identifiers must appear in this list.
    pub allowed_identifiers: Option<Vec<String>>,
    /// Agent kinds accepted at registration.
    pub supported_kinds: Vec<AgentKind>,
    /// Directory for the per-port lock file. Defaults to the system temp dir.
    pub lock_dir: Option<PathBuf>,
    /// Frames larger than this are a protocol violation.
    pub max_frame_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            open_mode: false,
            credentials: BTreeMap::new(),
            users: vec![DEFAULT_USERNAME.to_string()],
            key_dir: None,
            allowed_identifiers: None,
            supported_kinds: AgentKind::ALL.to_vec(),
            lock_dir: None,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl BrokerConfig {
    pub fn socket_addr(&self) -> BridgeResult<SocketAddr> {
        self.listen_addr.parse().map_err(|e| {
            BridgeError::Config(format!("invalid listen_addr '{}': {e}", self.listen_addr))
        })
    }

    /// Whether `identifier` passes the allow-list (always true without one).
    pub fn identifier_allowed(&self, identifier: Option<&str>) -> bool {
        match (&self.allowed_identifiers, identifier) {
            (None, _) => true,
            (Some(list), Some(id)) => list.iter().any(|allowed| allowed == id),
            (Some(_), None) => false,
        }
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Client (requester) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker URL, `ws://host:port`.
    pub url: String,
    pub username: String,
    /// Shared secret. When unset the CLI reads the key file for `username`.
    pub key: Option<String>,
    /// Give up connecting after this long.
    pub connect_timeout_ms: u64,
    /// Pause between connection attempts.
    pub retry_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: format!("ws://{DEFAULT_LISTEN_ADDR}"),
            username: DEFAULT_USERNAME.to_string(),
            key: None,
            connect_timeout_ms: 5_000,
            retry_interval_ms: 250,
        }
    }
}

/// Agent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub url: String,
    pub kind: AgentKind,
    pub identifier: Option<String>,
    /// Fixed backoff between reconnect attempts.
    pub reconnect_delay_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: format!("ws://{DEFAULT_LISTEN_ADDR}"),
            kind: AgentKind::Chrome,
            identifier: None,
            reconnect_delay_ms: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: BridgeConfig = toml::from_str(
            r#"
            [broker]
            listen_addr = "127.0.0.1:9000"
            allowed_identifiers = ["work"]

            [agent]
            kind = "firefox"
            "#,
        )
        .unwrap();
        assert_eq!(config.broker.socket_addr().unwrap().port(), 9000);
        assert!(!config.broker.open_mode);
        assert_eq!(config.broker.supported_kinds, AgentKind::ALL.to_vec());
        assert_eq!(config.agent.kind, AgentKind::Firefox);
        assert_eq!(config.client.connect_timeout_ms, 5_000);
    }

    #[test]
    fn test_allow_list() {
        let mut config = BrokerConfig::default();
        assert!(config.identifier_allowed(None));
        config.allowed_identifiers = Some(vec!["work".to_string()]);
        assert!(config.identifier_allowed(Some("work")));
        assert!(!config.identifier_allowed(Some("home")));
        assert!(!config.identifier_allowed(None));
    }

    #[test]
    fn test_bad_listen_addr() {
        let config = BrokerConfig {
            listen_addr: "nope".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.socket_addr(), Err(BridgeError::Config(_))));
    }
}
