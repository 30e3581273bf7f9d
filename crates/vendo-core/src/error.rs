//! The engine's unified error vocabulary (§7).

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Every public engine operation returns this one error enum, collapsing
/// `DatabaseError`/`PolicyError`/internal failures onto the §7 error-kind
/// vocabulary so callers (the binary, a future portal-server adapter)
/// match on a single type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The coin slot is held by a different owner.
    #[error("coin slot busy")]
    Busy,

    /// The caller's MAC is locked out until the given time.
    #[error("banned until {0}")]
    Banned(DateTime<Utc>),

    /// No combination of rate lines covers the requested amount.
    #[error("no rate covers amount {0}")]
    NoRateForAmount(i64),

    /// Attempted to claim an identifier already owned by another active record.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An external dependency (PacketPolicy) failed or timed out; retryable.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Malformed input, bad shared secret, or unknown source.
    #[error("invalid: {0}")]
    Invalid(String),

    /// No such user/source/code.
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<vendo_database::DatabaseError> for EngineError {
    fn from(e: vendo_database::DatabaseError) -> Self {
        match e {
            vendo_database::DatabaseError::NotFound(s) => EngineError::NotFound(s),
            vendo_database::DatabaseError::Conflict(s) => EngineError::Conflict(s),
            other => EngineError::Transient(other.to_string()),
        }
    }
}

impl From<vendo_policy::PolicyError> for EngineError {
    fn from(e: vendo_policy::PolicyError) -> Self {
        match e {
            vendo_policy::PolicyError::ParseFailed(s) => EngineError::Invalid(s),
            other => EngineError::Transient(other.to_string()),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
