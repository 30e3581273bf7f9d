//! File system paths for the vendo gateway daemon.

use crate::{ConfigError, ConfigResult};
use std::path::PathBuf;

/// Manages file system paths for the daemon's on-disk state.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory for all daemon runtime files (default `~/.vendo`).
    base_dir: PathBuf,
}

impl Paths {
    /// Resolve paths using the user's home directory (`~/.vendo`), or the
    /// `VENDO_STATE_DIR` environment variable when set.
    pub fn new() -> ConfigResult<Self> {
        if let Ok(dir) = std::env::var("VENDO_STATE_DIR") {
            return Ok(Self::with_base_dir(PathBuf::from(dir)));
        }

        let home = dirs::home_dir()
            .ok_or_else(|| ConfigError::Path("could not determine home directory".to_string()))?;

        Ok(Self::with_base_dir(home.join(".vendo")))
    }

    /// Create a new `Paths` instance with an explicit base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// The base directory all other paths are rooted under.
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Path to the JSON configuration file.
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Path to the SQLite database file backing the session store.
    pub fn database_file(&self) -> PathBuf {
        self.base_dir.join("vendo.sqlite")
    }

    /// Path to the control socket used for singleton enforcement and the
    /// `stop`/`status` CLI subcommands.
    pub fn socket_file(&self) -> PathBuf {
        self.base_dir.join("vendo.sock")
    }

    /// Path to the PID file written on daemon startup.
    pub fn pid_file(&self) -> PathBuf {
        self.base_dir.join("vendo.pid")
    }

    /// Directory holding structured log output.
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Path to the JSON-lines daemon log file.
    pub fn daemon_log_file(&self) -> PathBuf {
        self.logs_dir().join("daemon.jsonl")
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> ConfigResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new().expect("failed to determine a home directory for daemon state")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn with_base_dir_derives_all_paths() {
        let base = PathBuf::from("/tmp/test-vendo");
        let paths = Paths::with_base_dir(base.clone());

        assert_eq!(paths.base_dir(), &base);
        assert_eq!(paths.config_file(), base.join("config.json"));
        assert_eq!(paths.database_file(), base.join("vendo.sqlite"));
        assert_eq!(paths.socket_file(), base.join("vendo.sock"));
        assert_eq!(paths.pid_file(), base.join("vendo.pid"));
        assert_eq!(paths.logs_dir(), base.join("logs"));
        assert_eq!(paths.daemon_log_file(), base.join("logs/daemon.jsonl"));
    }

    #[test]
    fn ensure_dirs_creates_directories_idempotently() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("vendo");
        let paths = Paths::with_base_dir(base.clone());

        assert!(!base.exists());
        paths.ensure_dirs().unwrap();
        paths.ensure_dirs().unwrap();

        assert!(paths.base_dir().exists());
        assert!(paths.logs_dir().is_dir());
    }

    #[test]
    fn daemon_log_file_lives_under_logs_dir() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        assert!(paths.daemon_log_file().starts_with(paths.logs_dir()));
    }
}
