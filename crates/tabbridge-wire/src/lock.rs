//! Cross-process advisory lock claiming a broker port.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tabbridge_types::{BridgeError, BridgeResult};
use tracing::debug;

/// Exclusive claim on `<dir>/tabbridge-<port>.lock`, held until dropped.
#[derive(Debug)]
pub struct PortLock {
    _file: File,
    path: PathBuf,
    port: u16,
}

/// Lock file path for `port` under `dir`.
pub fn lock_path(dir: &Path, port: u16) -> PathBuf {
    dir.join(format!("tabbridge-{port}.lock"))
}

impl PortLock {
    /// Try to take the lock without blocking.
    pub fn acquire(dir: &Path, port: u16) -> BridgeResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = lock_path(dir, port);
        let mut file = Self::open_exclusive(&path, port)?;
        let _ = writeln!(file, "{}", std::process::id());
        debug!(port, path = %path.display(), "Acquired port lock");
        Ok(Self {
            _file: file,
            path,
            port,
        })
    }

    #[cfg(unix)]
    fn open_exclusive(path: &Path, port: u16) -> BridgeResult<File> {
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            return Err(BridgeError::Lock(format!(
                "port {port} is already claimed by another broker ({err})"
            )));
        }
        file.set_len(0)?;
        Ok(file)
    }

    #[cfg(not(unix))]
    fn open_exclusive(path: &Path, port: u16) -> BridgeResult<File> {
        OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => BridgeError::Lock(format!(
                    "port {port} is already claimed by another broker"
                )),
                _ => BridgeError::Io(e),
            })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PortLock {
    fn drop(&mut self) {
        // The flock is released when the file closes. The file itself stays on
        // unix so a racing acquirer never locks an unlinked inode.
        #[cfg(not(unix))]
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove port lock file");
        }
        debug!(port = self.port, "Released port lock");
    }
}
