//! In-memory fake `PacketPolicy` for deterministic tests.

use crate::{class_id_for_ip, Counter, PacketPolicy, PolicyResult, TrafficSample};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct State {
    authorized: std::collections::HashSet<String>,
    limits: HashMap<String, (i64, i64)>,
    uploads: HashMap<String, Counter>,
    downloads: HashMap<u8, Counter>,
    live_flows: std::collections::HashSet<String>,
}

/// Records every call against an in-memory model instead of touching the
/// real network stack. Tests can pre-seed counters/live-flow state and
/// assert on the resulting authorized set.
#[derive(Default)]
pub struct FakePacketPolicy {
    state: Mutex<State>,
}

impl FakePacketPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_authorized(&self, mac: &str) -> bool {
        self.state.lock().unwrap().authorized.contains(mac)
    }

    pub fn limit_for(&self, ip: &str) -> Option<(i64, i64)> {
        self.state.lock().unwrap().limits.get(ip).copied()
    }

    /// Seed a counter value that `sample_counters` will report until
    /// overwritten. The download side is filed under the class-id derived
    /// from `ip`'s last octet, same as the real adapter.
    pub fn seed_counter(&self, ip: &str, upload_bytes: u64, download_bytes: u64) {
        let mut state = self.state.lock().unwrap();
        state.uploads.insert(ip.to_string(), Counter { bytes: upload_bytes, idle_seconds: 0 });
        if let Some(class_id) = class_id_for_ip(ip) {
            state.downloads.insert(class_id, Counter { bytes: download_bytes, idle_seconds: 0 });
        }
    }

    pub fn set_live_flows(&self, ip: &str, live: bool) {
        let mut state = self.state.lock().unwrap();
        if live {
            state.live_flows.insert(ip.to_string());
        } else {
            state.live_flows.remove(ip);
        }
    }
}

#[async_trait]
impl PacketPolicy for FakePacketPolicy {
    async fn authorize(&self, mac: &str) -> PolicyResult<()> {
        self.state.lock().unwrap().authorized.insert(mac.to_string());
        Ok(())
    }

    async fn deauthorize(&self, mac: &str) -> PolicyResult<()> {
        self.state.lock().unwrap().authorized.remove(mac);
        Ok(())
    }

    async fn set_limit(&self, ip: &str, down_kbps: i64, up_kbps: i64) -> PolicyResult<()> {
        self.state.lock().unwrap().limits.insert(ip.to_string(), (down_kbps, up_kbps));
        Ok(())
    }

    async fn remove_limit(&self, ip: &str) -> PolicyResult<()> {
        self.state.lock().unwrap().limits.remove(ip);
        Ok(())
    }

    async fn sample_counters(&self) -> PolicyResult<TrafficSample> {
        let state = self.state.lock().unwrap();
        Ok(TrafficSample { uploads: state.uploads.clone(), downloads: state.downloads.clone() })
    }

    async fn list_authorized_macs(&self) -> PolicyResult<Vec<String>> {
        Ok(self.state.lock().unwrap().authorized.iter().cloned().collect())
    }

    async fn has_live_flows(&self, ip: &str) -> PolicyResult<bool> {
        Ok(self.state.lock().unwrap().live_flows.contains(ip))
    }
}
