//! The packet-enforcement plane contract (`PacketPolicy`) and its adapters.
//!
//! `Ticker`, `CreditApplier` and `IdleMonitor` all talk to the network
//! enforcement layer exclusively through this trait. The real adapter
//! shells out to an external firewall/traffic-control toolchain; tests use
//! the in-memory fake instead.

mod error;
mod fake;
mod shell;

pub use error::{PolicyError, PolicyResult};
pub use fake::FakePacketPolicy;
pub use shell::{ShellPacketPolicy, ShellPolicyConfig};

use async_trait::async_trait;
use std::collections::HashMap;

/// A single sampled byte counter plus how long it has sat idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counter {
    pub bytes: u64,
    pub idle_seconds: i64,
}

/// A traffic snapshot from `sample_counters`: uploads are keyed by IP,
/// downloads by the shaping class-id (1-254) derived from the IP's last
/// octet, since the enforcement plane accounts the two directions in
/// different key spaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficSample {
    pub uploads: HashMap<String, Counter>,
    pub downloads: HashMap<u8, Counter>,
}

/// Derive the download class-id (1-254) from an IPv4 address's last octet.
/// Returns `None` for addresses with no usable octet or a reserved 0/255.
pub fn class_id_for_ip(ip: &str) -> Option<u8> {
    let octet: u8 = ip.rsplit('.').next()?.parse().ok()?;
    (1..=254).contains(&octet).then_some(octet)
}

/// Abstraction over whatever authorizes/shapes/accounts for LAN traffic.
///
/// Every method is bounded by an internal deadline in the concrete adapter;
/// callers should treat a slow enforcement backend the same as a failed one
/// and retry on the next tick rather than block indefinitely.
#[async_trait]
pub trait PacketPolicy: Send + Sync {
    /// Allow `mac` onto the network.
    async fn authorize(&self, mac: &str) -> PolicyResult<()>;

    /// Remove `mac`'s authorization.
    async fn deauthorize(&self, mac: &str) -> PolicyResult<()>;

    /// Apply a bandwidth cap to `ip`.
    async fn set_limit(&self, ip: &str, down_kbps: i64, up_kbps: i64) -> PolicyResult<()>;

    /// Remove any bandwidth cap on `ip`.
    async fn remove_limit(&self, ip: &str) -> PolicyResult<()>;

    /// Snapshot current byte counters: uploads by IP, downloads by class-id.
    async fn sample_counters(&self) -> PolicyResult<TrafficSample>;

    /// List MACs the enforcement plane currently considers authorized.
    async fn list_authorized_macs(&self) -> PolicyResult<Vec<String>>;

    /// Whether `ip` has any live flow in the last sampling window —
    /// consulted by `IdleMonitor` alongside the neighbor table.
    async fn has_live_flows(&self, ip: &str) -> PolicyResult<bool>;
}
