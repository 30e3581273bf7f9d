//! Error types for the packet-enforcement plane.

use thiserror::Error;

/// Error type for `PacketPolicy` operations.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The underlying enforcement command failed to spawn.
    #[error("failed to spawn enforcement command: {0}")]
    SpawnFailed(#[from] std::io::Error),

    /// The enforcement command exited with a nonzero status.
    #[error("enforcement command exited with status {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },

    /// The command did not complete before its deadline.
    #[error("enforcement command timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The counter snapshot output could not be parsed.
    #[error("failed to parse counter output: {0}")]
    ParseFailed(String),
}

/// Result type alias using [`PolicyError`].
pub type PolicyResult<T> = Result<T, PolicyError>;
