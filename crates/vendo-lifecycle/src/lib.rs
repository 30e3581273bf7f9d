//! Daemon lifecycle management: singleton enforcement, PID file, and
//! control-socket cleanup for the vendo gateway daemon.
//!
//! Exactly one instance of the daemon may run against a given state
//! directory, since it is the sole writer of the SessionStore and the sole
//! owner of the physical coin slot.

use std::path::{Path, PathBuf};
use thiserror::Error;
use vendo_config::Paths;

/// Errors from lifecycle management.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("another vendo daemon is already running against this state directory")]
    AlreadyRunning,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PID file error: {0}")]
    PidFile(String),
}

/// Result of probing whether the daemon is already running.
#[derive(Debug, PartialEq, Eq)]
pub enum SingletonCheck {
    /// No daemon running, safe to start.
    Available,
    /// A stale socket was found and cleaned up.
    StaleSocketCleaned,
    /// Another daemon is already running.
    AlreadyRunning,
}

/// Check whether the daemon is already running by probing the control
/// socket. Connecting successfully means a live daemon is listening;
/// finding the file but failing to connect means a stale socket from a
/// crashed process, which is removed.
pub fn check_singleton(socket_path: &Path) -> SingletonCheck {
    if !socket_path.exists() {
        return SingletonCheck::Available;
    }

    match std::os::unix::net::UnixStream::connect(socket_path) {
        Ok(_stream) => SingletonCheck::AlreadyRunning,
        Err(_) => {
            let _ = std::fs::remove_file(socket_path);
            SingletonCheck::StaleSocketCleaned
        }
    }
}

/// Write the current process PID to the given path.
pub fn write_pid_file(pid_path: &Path) -> Result<u32, LifecycleError> {
    let pid = std::process::id();
    std::fs::write(pid_path, pid.to_string())?;
    Ok(pid)
}

/// Read a PID from the given file, if present.
pub fn read_pid_file(pid_path: &Path) -> Result<Option<u32>, LifecycleError> {
    if !pid_path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(pid_path)?;
    let pid = content
        .trim()
        .parse::<u32>()
        .map_err(|e| LifecycleError::PidFile(format!("invalid PID: {e}")))?;
    Ok(Some(pid))
}

/// Remove the PID file if it exists.
pub fn cleanup_pid_file(pid_path: &Path) -> Result<(), LifecycleError> {
    if pid_path.exists() {
        std::fs::remove_file(pid_path)?;
    }
    Ok(())
}

/// Remove the control socket file if it exists.
pub fn cleanup_socket_file(socket_path: &Path) -> Result<(), LifecycleError> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    Ok(())
}

/// Handle bundling the running daemon's singleton files.
#[derive(Debug, Clone)]
pub struct DaemonInfo {
    pub pid: Option<u32>,
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
}

impl DaemonInfo {
    /// Derive a `DaemonInfo` from the daemon's resolved state paths.
    pub fn from_paths(paths: &Paths) -> Self {
        Self {
            pid: None,
            socket_path: paths.socket_file(),
            pid_path: paths.pid_file(),
        }
    }

    /// Reload the PID from disk.
    pub fn load_pid(&mut self) -> Result<(), LifecycleError> {
        self.pid = read_pid_file(&self.pid_path)?;
        Ok(())
    }

    /// True if a live daemon answers the control socket.
    pub fn is_running(&self) -> bool {
        check_singleton(&self.socket_path) == SingletonCheck::AlreadyRunning
    }

    /// Acquire the singleton slot for this process, claiming the PID file.
    /// Fails with [`LifecycleError::AlreadyRunning`] if another daemon is
    /// already listening on the control socket.
    pub fn acquire(&self) -> Result<u32, LifecycleError> {
        match check_singleton(&self.socket_path) {
            SingletonCheck::AlreadyRunning => Err(LifecycleError::AlreadyRunning),
            SingletonCheck::Available | SingletonCheck::StaleSocketCleaned => {
                write_pid_file(&self.pid_path)
            }
        }
    }

    /// Remove the socket and PID file for a graceful shutdown.
    pub fn cleanup(&self) -> Result<(), LifecycleError> {
        cleanup_socket_file(&self.socket_path)?;
        cleanup_pid_file(&self.pid_path)?;
        Ok(())
    }
}
