//! Logging initialization for the vendo gateway daemon.
//!
//! Structured tracing output: JSON lines to the daemon log file plus,
//! always, human-readable lines on stderr (useful for `start --foreground`).
//! Level is driven by `RUST_LOG` when set, else by the configured default.

use std::path::Path;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Initialize the logging system for the daemon.
///
/// `level` is the fallback filter used when `RUST_LOG` is unset.
/// `log_file` receives JSON-lines output; stderr always gets human-readable
/// output.
pub fn init_logging(level: &str, log_file: &Path) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stderr_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    let file_appender = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .ok();

    let registry = Registry::default().with(filter).with(stderr_layer);

    match file_appender {
        Some(file) => {
            let file_layer = fmt::layer()
                .json()
                .with_target(true)
                .with_writer(std::sync::Mutex::new(file));
            registry.with(file_layer).init();
        }
        None => {
            registry.init();
        }
    }
}

/// Parse a log level string into a [`tracing::Level`], defaulting to INFO
/// on anything unrecognized.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level_all_variants() {
        assert_eq!(parse_level("trace"), tracing::Level::TRACE);
        assert_eq!(parse_level("DEBUG"), tracing::Level::DEBUG);
        assert_eq!(parse_level("Info"), tracing::Level::INFO);
        assert_eq!(parse_level("warning"), tracing::Level::WARN);
        assert_eq!(parse_level("error"), tracing::Level::ERROR);
    }

    #[test]
    fn parse_level_unknown_defaults_to_info() {
        assert_eq!(parse_level("nonsense"), tracing::Level::INFO);
    }
}
