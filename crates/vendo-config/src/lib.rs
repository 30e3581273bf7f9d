//! Configuration, filesystem paths, and logging bootstrap shared by every
//! crate in the vendo gateway daemon.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{Config, DEFAULT_LOG_LEVEL};
pub use error::{ConfigError, ConfigResult};
pub use logging::{init_logging, parse_level};
pub use paths::Paths;
