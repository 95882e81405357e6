//! Client credentials: per-port key files and the broker's authenticator.
//!
//! Keys live at `<root>/<port>/<username>.key`, one 32-byte random secret per
//! file, hex-encoded. Files generated by a [`KeyStore`] are removed again when
//! it is dropped; files that already existed are left alone.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rand::RngCore;
use subtle::ConstantTimeEq;
use tabbridge_types::config::BrokerConfig;
use tabbridge_types::{BridgeError, BridgeResult};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Default key root: `~/.tabbridge/keys`.
pub fn default_key_root() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".tabbridge").join("keys"))
}

/// Path of the key file for `username` on `port`.
pub fn key_path(root: &Path, port: u16, username: &str) -> PathBuf {
    root.join(port.to_string()).join(format!("{username}.key"))
}

/// Read an existing key file.
pub fn read_key(root: &Path, port: u16, username: &str) -> BridgeResult<Zeroizing<String>> {
    let path = key_path(root, port, username);
    let contents = std::fs::read_to_string(&path).map_err(|e| {
        BridgeError::Authentication(format!("cannot read key file {}: {e}", path.display()))
    })?;
    Ok(Zeroizing::new(contents.trim().to_string()))
}

fn generate_key() -> Zeroizing<String> {
    let mut bytes = Zeroizing::new([0u8; 32]);
    rand::thread_rng().fill_bytes(&mut bytes[..]);
    Zeroizing::new(hex::encode(&bytes[..]))
}

/// Restrict file permissions to owner-only (0600) on Unix.
#[cfg(unix)]
fn restrict_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &Path) {}

/// Restrict directory permissions to owner-only (0700) on Unix.
#[cfg(unix)]
fn restrict_dir_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
}

#[cfg(not(unix))]
fn restrict_dir_permissions(_path: &Path) {}

/// Loaded (or freshly generated) client keys for one broker port.
pub struct KeyStore {
    keys: BTreeMap<String, Zeroizing<String>>,
    generated: Vec<PathBuf>,
}

impl KeyStore {
    /// Load the key for each of `users`, generating missing ones.
    pub fn open(root: &Path, port: u16, users: &[String]) -> BridgeResult<Self> {
        let dir = root.join(port.to_string());
        std::fs::create_dir_all(&dir)?;
        restrict_dir_permissions(&dir);

        let mut store = Self {
            keys: BTreeMap::new(),
            generated: Vec::new(),
        };
        for username in users {
            if username.is_empty() || username.contains(['/', '\\', '.']) {
                return Err(BridgeError::Config(format!("invalid username '{username}'")));
            }
            let path = key_path(root, port, username);
            if path.exists() {
                let key = read_key(root, port, username)?;
                debug!(user = %username, path = %path.display(), "Loaded client key");
                store.keys.insert(username.clone(), key);
            } else {
                let key = generate_key();
                std::fs::write(&path, key.as_bytes())?;
                restrict_file_permissions(&path);
                info!(user = %username, path = %path.display(), "Generated client key");
                store.generated.push(path);
                store.keys.insert(username.clone(), key);
            }
        }
        Ok(store)
    }

    pub fn keys(&self) -> &BTreeMap<String, Zeroizing<String>> {
        &self.keys
    }

    /// Paths written by this store; removed on drop.
    pub fn generated_files(&self) -> &[PathBuf] {
        &self.generated
    }
}

impl Drop for KeyStore {
    fn drop(&mut self) {
        for path in &self.generated {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove generated key file");
            }
        }
    }
}

/// Decides whether a client registration is accepted.
pub enum Authenticator {
    /// Every client is accepted.
    Open,
    /// Only listed username/key pairs are accepted.
    Table(BTreeMap<String, Zeroizing<String>>),
}

impl Authenticator {
    /// Open when `open_mode` is set; otherwise the static credential table.
    pub fn from_config(config: &BrokerConfig) -> Self {
        if config.open_mode {
            return Authenticator::Open;
        }
        Authenticator::Table(
            config
                .credentials
                .iter()
                .map(|(user, key)| (user.clone(), Zeroizing::new(key.clone())))
                .collect(),
        )
    }

    /// Merge a key store's keys into the table. No effect in open mode.
    pub fn with_keys(mut self, store: &KeyStore) -> Self {
        if let Authenticator::Table(table) = &mut self {
            for (user, key) in store.keys() {
                table.insert(user.clone(), key.clone());
            }
        }
        self
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Authenticator::Open)
    }

    pub fn verify(&self, username: &str, key: &str) -> bool {
        match self {
            Authenticator::Open => true,
            Authenticator::Table(table) => match table.get(username) {
                Some(expected) => expected.as_bytes().ct_eq(key.as_bytes()).into(),
                None => false,
            },
        }
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Authenticator::Open => f.write_str("Authenticator::Open"),
            Authenticator::Table(t) => write!(f, "Authenticator::Table({} users)", t.len()),
        }
    }
}
