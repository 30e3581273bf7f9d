//! Row types for the session store schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A credit-holding user record, keyed by an opaque `user_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub user_id: String,
    pub mac: String,
    pub client_id: Option<String>,
    pub ip: Option<String>,
    pub user_code: String,
    pub credit_seconds: i64,
    pub total_seconds_ever: i64,
    pub rate_down_kbps: i64,
    pub rate_up_kbps: i64,
    pub paused: bool,
    pub connected: bool,
    pub last_traffic_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub session_expiry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to insert a brand-new user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub user_id: String,
    pub mac: String,
    pub client_id: Option<String>,
    pub user_code: String,
    pub credit_seconds: i64,
    pub rate_down_kbps: i64,
    pub rate_up_kbps: i64,
}

/// An append-only ledger entry for a committed coin or voucher credit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sale {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub amount: i64,
    pub mac: String,
    pub source: String,
    /// Seconds of credit this sale granted. Recorded for traceability;
    /// free-time grants are the only rows where this is the authoritative
    /// figure (paid sales recompute minutes from the rate table).
    pub seconds: i64,
}

/// A coin origin: the local hardware slot or a remote sub-device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRow {
    pub id: String,
    pub kind: SourceKind,
    pub display_name: String,
    pub pulse_value_pesos: i64,
    pub rate_down_kbps: Option<i64>,
    pub rate_up_kbps: Option<i64>,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Whether a [`SourceRow`] is the on-appliance slot or a remote sub-device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Local,
    Remote,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "local" => Self::Local,
            _ => Self::Remote,
        }
    }
}

/// A line in the price table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateRow {
    pub id: i64,
    pub amount: i64,
    pub minutes: i64,
    pub rate_up_kbps: i64,
    pub rate_down_kbps: i64,
}

/// Per-MAC counter of consecutive failed redeem/start attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub mac: String,
    pub count: i64,
    pub banned_until: Option<DateTime<Utc>>,
}
