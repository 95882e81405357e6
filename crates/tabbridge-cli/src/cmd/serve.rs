//! `tabbridge serve`: run the broker until interrupted.

use tabbridge_types::config::BrokerConfig;
use tabbridge_types::BridgeError;
use tabbridge_wire::credentials::{default_key_root, key_path};
use tabbridge_wire::{Authenticator, Broker, KeyStore};
use tracing::info;

use super::CliResult;
use crate::ui;

/// Apply `serve` flags on top of the configured broker settings.
pub fn overlay(
    mut config: BrokerConfig,
    listen: Option<String>,
    open: bool,
    allow_identifier: Vec<String>,
) -> BrokerConfig {
    if let Some(listen) = listen {
        config.listen_addr = listen;
    }
    if open {
        config.open_mode = true;
    }
    if !allow_identifier.is_empty() {
        config.allowed_identifiers = Some(allow_identifier);
    }
    config
}

pub async fn cmd_serve(
    config: BrokerConfig,
    listen: Option<String>,
    open: bool,
    allow_identifier: Vec<String>,
) -> CliResult<()> {
    let config = overlay(config, listen, open, allow_identifier);
    let port = config.socket_addr()?.port();

    // Held for the broker's lifetime; dropping it removes freshly generated keys.
    let key_root = config
        .key_dir
        .clone()
        .or_else(default_key_root)
        .ok_or_else(|| BridgeError::Config("cannot determine a key directory".to_string()))?;
    let keys = if config.open_mode {
        None
    } else {
        Some(KeyStore::open(&key_root, port, &config.users)?)
    };
    let mut authenticator = Authenticator::from_config(&config);
    if let Some(keys) = &keys {
        authenticator = authenticator.with_keys(keys);
    }

    let broker = Broker::new(config, authenticator);
    let addr = broker.listen().await?;

    ui::success(&format!("Broker listening on ws://{addr}"));
    if keys.is_some() {
        for user in &broker.config().users {
            ui::kv("Key file", &key_path(&key_root, port, user).display().to_string());
        }
    } else {
        ui::kv_warn("Auth", "open mode, any client is accepted");
    }
    ui::hint("press Ctrl+C to stop");
    ui::blank();

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Could not wait for Ctrl+C, shutting down");
    }
    let handle = broker.handle();
    info!(
        agents = handle.agent_count(),
        clients = handle.client_count(),
        "Shutting down broker"
    );
    broker.close().await;
    drop(keys);
    ui::success("Broker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_flags() {
        let config = overlay(
            BrokerConfig::default(),
            Some("127.0.0.1:9001".to_string()),
            true,
            vec!["work".to_string()],
        );
        assert_eq!(config.listen_addr, "127.0.0.1:9001");
        assert!(config.open_mode);
        assert_eq!(config.allowed_identifiers, Some(vec!["work".to_string()]));
    }

    #[test]
    fn test_overlay_keeps_config_without_flags() {
        let mut base = BrokerConfig::default();
        base.allowed_identifiers = Some(vec!["home".to_string()]);
        let config = overlay(base, None, false, Vec::new());
        assert!(!config.open_mode);
        assert_eq!(config.allowed_identifiers, Some(vec!["home".to_string()]));
    }
}
