//! Config file loading and command-line overlays.

use std::path::{Path, PathBuf};

use tabbridge_types::config::{BridgeConfig, DEFAULT_LISTEN_ADDR};
use tracing::{debug, info, warn};

/// `~/.tabbridge`, or `./.tabbridge` without a home directory.
pub fn tabbridge_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tabbridge")
}

pub fn default_config_path() -> PathBuf {
    tabbridge_home().join("config.toml")
}

/// Load the config file, falling back to defaults when it is missing or
/// unreadable.
pub fn load_config(path: Option<&Path>) -> BridgeConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        debug!(path = %config_path.display(), "Config file not found, using defaults");
        return BridgeConfig::default();
    }
    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<BridgeConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                BridgeConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            BridgeConfig::default()
        }
    }
}

/// Port named by a `ws://host:port/...` URL, if any.
pub fn url_port(url: &str) -> Option<u16> {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = rest.split('/').next()?;
    let (_, port) = authority.rsplit_once(':')?;
    port.parse().ok()
}

/// Port used for key files when the URL does not name one.
pub fn default_port() -> u16 {
    url_port(DEFAULT_LISTEN_ADDR).unwrap_or(7979)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[client]\nurl = \"ws://127.0.0.1:9100\"\nusername = \"ops\"\n\n[broker]\nopen_mode = true"
        )
        .unwrap();
        let config = load_config(Some(file.path()));
        assert_eq!(config.client.url, "ws://127.0.0.1:9100");
        assert_eq!(config.client.username, "ops");
        assert!(config.broker.open_mode);
    }

    #[test]
    fn test_invalid_config_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[client\nurl = ").unwrap();
        let config = load_config(Some(file.path()));
        assert_eq!(config.client.url, BridgeConfig::default().client.url);
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml")));
        assert!(!config.broker.open_mode);
    }

    #[test]
    fn test_url_port() {
        assert_eq!(url_port("ws://127.0.0.1:9000"), Some(9000));
        assert_eq!(url_port("ws://localhost:81/path"), Some(81));
        assert_eq!(url_port("ws://localhost/path"), None);
        assert_eq!(url_port("127.0.0.1:7979"), Some(7979));
        assert_eq!(default_port(), 7979);
    }
}
