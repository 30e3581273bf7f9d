//! Frozen startup configuration for the vendo gateway daemon.

use crate::{ConfigResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Tunables the engine reads at construction time. Individual values may
/// later be overridden per-key through the `config` table without a
/// redeploy (see `vendo_database::queries::config`); this struct is only
/// the frozen seed read once at process startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Shared secret remote sub-devices must present on heartbeat/pulse.
    #[serde(default = "default_sub_vendo_key")]
    pub sub_vendo_key: String,

    /// Coin-insert pulse-idle deadline, in seconds (spec: 30s).
    #[serde(default = "default_pulse_idle_seconds")]
    pub pulse_idle_seconds: u64,

    /// Coin-insert absolute deadline, in seconds (spec: 60s).
    #[serde(default = "default_absolute_deadline_seconds")]
    pub absolute_deadline_seconds: u64,

    /// Pulse count per coin-insert window above which the aggregator
    /// treats the session as suspicious and bans it without committing.
    #[serde(default = "default_ban_limit_pulses_per_window")]
    pub ban_limit_pulses_per_window: u32,

    /// Idle timeout before `IdleMonitor` pauses a connected user, in seconds.
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,

    /// Interval between `Ticker` byte-counter samples, in seconds.
    #[serde(default = "default_traffic_sample_interval_seconds")]
    pub traffic_sample_interval_seconds: u64,

    /// Interval between `Ticker` authorized-MAC reconciliation passes.
    #[serde(default = "default_mac_reconcile_interval_seconds")]
    pub mac_reconcile_interval_seconds: u64,

    /// Interval between `IdleMonitor` passes, in seconds.
    #[serde(default = "default_idle_monitor_interval_seconds")]
    pub idle_monitor_interval_seconds: u64,

    /// Consecutive failed attempts before `FailAttemptGate` bans a MAC.
    #[serde(default = "default_fail_ban_limit")]
    pub fail_ban_limit: u32,

    /// Ban duration once `fail_ban_limit` is reached, in seconds.
    #[serde(default = "default_fail_ban_duration_seconds")]
    pub fail_ban_duration_seconds: u64,

    /// Deadline for neighbor-table / liveness PacketPolicy probes, in ms.
    #[serde(default = "default_probe_deadline_ms")]
    pub probe_deadline_ms: u64,

    /// Deadline for PacketPolicy table-rewrite calls, in ms.
    #[serde(default = "default_rewrite_deadline_ms")]
    pub rewrite_deadline_ms: u64,

    /// Staleness window after which a source is considered offline.
    #[serde(default = "default_source_online_window_seconds")]
    pub source_online_window_seconds: u64,

    /// Path to the external enforcement helper binary the `ShellPacketPolicy`
    /// adapter shells out to (an nftables or ipset front-end).
    #[serde(default = "default_enforcement_binary")]
    pub enforcement_binary: String,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_sub_vendo_key() -> String {
    "change-me".to_string()
}
fn default_pulse_idle_seconds() -> u64 {
    30
}
fn default_absolute_deadline_seconds() -> u64 {
    60
}
fn default_ban_limit_pulses_per_window() -> u32 {
    200
}
fn default_idle_timeout_seconds() -> u64 {
    120
}
fn default_traffic_sample_interval_seconds() -> u64 {
    5
}
fn default_mac_reconcile_interval_seconds() -> u64 {
    60
}
fn default_idle_monitor_interval_seconds() -> u64 {
    5
}
fn default_fail_ban_limit() -> u32 {
    5
}
fn default_fail_ban_duration_seconds() -> u64 {
    300
}
fn default_probe_deadline_ms() -> u64 {
    2_000
}
fn default_rewrite_deadline_ms() -> u64 {
    5_000
}
fn default_source_online_window_seconds() -> u64 {
    70
}
fn default_enforcement_binary() -> String {
    "/usr/lib/vendo/vendo-enforce".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            sub_vendo_key: default_sub_vendo_key(),
            pulse_idle_seconds: default_pulse_idle_seconds(),
            absolute_deadline_seconds: default_absolute_deadline_seconds(),
            ban_limit_pulses_per_window: default_ban_limit_pulses_per_window(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
            traffic_sample_interval_seconds: default_traffic_sample_interval_seconds(),
            mac_reconcile_interval_seconds: default_mac_reconcile_interval_seconds(),
            idle_monitor_interval_seconds: default_idle_monitor_interval_seconds(),
            fail_ban_limit: default_fail_ban_limit(),
            fail_ban_duration_seconds: default_fail_ban_duration_seconds(),
            probe_deadline_ms: default_probe_deadline_ms(),
            rewrite_deadline_ms: default_rewrite_deadline_ms(),
            source_online_window_seconds: default_source_online_window_seconds(),
            enforcement_binary: default_enforcement_binary(),
        }
    }
}

impl Config {
    /// Build a config from defaults, then apply environment overrides.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from `paths.config_file()`, falling back to
    /// defaults when the file does not exist yet. Environment variables
    /// always win over the file.
    pub fn load(paths: &Paths) -> ConfigResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to `paths.config_file()`.
    pub fn save(&self, paths: &Paths) -> ConfigResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    fn load_from_env(&mut self) {
        if let Ok(level) = std::env::var("VENDO_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(key) = std::env::var("VENDO_SUB_VENDO_KEY") {
            self.sub_vendo_key = key;
        }
        if let Ok(raw) = std::env::var("VENDO_BAN_LIMIT_PULSES_PER_WINDOW") {
            if let Ok(value) = raw.parse() {
                self.ban_limit_pulses_per_window = value;
            }
        }
        if let Ok(raw) = std::env::var("VENDO_IDLE_TIMEOUT_SECONDS") {
            if let Ok(value) = raw.parse() {
                self.idle_timeout_seconds = value;
            }
        }
        if let Ok(binary) = std::env::var("VENDO_ENFORCEMENT_BINARY") {
            self.enforcement_binary = binary;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.pulse_idle_seconds, 30);
        assert_eq!(config.absolute_deadline_seconds, 60);
        assert_eq!(config.idle_timeout_seconds, 120);
        assert_eq!(config.traffic_sample_interval_seconds, 5);
        assert_eq!(config.mac_reconcile_interval_seconds, 60);
        assert_eq!(config.source_online_window_seconds, 70);
    }

    #[test]
    fn load_from_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"log_level": "debug", "idle_timeout_seconds": 45}"#).unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.idle_timeout_seconds, 45);
        // Unspecified fields still take spec defaults.
        assert_eq!(config.ban_limit_pulses_per_window, 200);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = Config::default();
        config.log_level = "trace".to_string();
        config.save(&paths).unwrap();

        let loaded = Config::load(&paths).unwrap();
        assert_eq!(loaded.log_level, "trace");
    }

    #[test]
    fn load_nonexistent_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.ban_limit_pulses_per_window, 200);
    }
}
