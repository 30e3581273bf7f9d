//! Ticker (§4.7): the 1 Hz reconciliation loop between `SessionStore` and
//! `PacketPolicy`.

use crate::error::EngineResult;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::{debug, warn};
use vendo_database::SessionStore;
use vendo_policy::{class_id_for_ip, PacketPolicy, TrafficSample};

#[derive(Debug, Clone, Copy)]
pub struct TickerConfig {
    pub traffic_sample_interval_seconds: i64,
    pub mac_reconcile_interval_seconds: i64,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            traffic_sample_interval_seconds: 5,
            mac_reconcile_interval_seconds: 60,
        }
    }
}

/// What a single `tick` call did, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub expired: Vec<String>,
    pub decremented: usize,
    pub sampled: bool,
    pub reconciled: bool,
    pub reauthorized: Vec<String>,
    pub stray_deauthorized: Vec<String>,
}

struct Clock {
    last_tick_at: Option<DateTime<Utc>>,
    since_sample: i64,
    since_reconcile: i64,
}

pub struct Ticker<'a> {
    store: &'a SessionStore,
    policy: &'a dyn PacketPolicy,
    config: TickerConfig,
    clock: Mutex<Clock>,
    byte_cache: Mutex<TrafficSample>,
}

impl<'a> Ticker<'a> {
    pub fn new(store: &'a SessionStore, policy: &'a dyn PacketPolicy, config: TickerConfig) -> Self {
        Self {
            store,
            policy,
            config,
            clock: Mutex::new(Clock { last_tick_at: None, since_sample: 0, since_reconcile: 0 }),
            byte_cache: Mutex::new(TrafficSample::default()),
        }
    }

    /// Run one reconciliation pass for `now`. `Δ = max(0, floor(now - last_tick))`,
    /// defaulting to 1 s on the very first call so a cold start behaves like
    /// a nominal tick rather than a no-op.
    pub async fn tick(&self, now: DateTime<Utc>) -> EngineResult<TickReport> {
        let (delta, due_sample, due_reconcile) = {
            let mut clock = self.clock.lock().unwrap();
            let delta = match clock.last_tick_at {
                Some(prev) => (now - prev).num_seconds().max(0),
                None => 1,
            };
            clock.last_tick_at = Some(now);
            clock.since_sample += delta;
            clock.since_reconcile += delta;

            let due_sample = clock.since_sample >= self.config.traffic_sample_interval_seconds;
            if due_sample {
                clock.since_sample = 0;
            }
            let due_reconcile = clock.since_reconcile >= self.config.mac_reconcile_interval_seconds;
            if due_reconcile {
                clock.since_reconcile = 0;
            }
            (delta, due_sample, due_reconcile)
        };

        let mut report = TickReport::default();

        for user in self.store.iterate_active()? {
            let new_balance = user.credit_seconds - delta;
            if new_balance <= 0 {
                self.store.expire(&user.user_id).await?;
                if let Err(err) = self.policy.deauthorize(&user.mac).await {
                    warn!(mac = %user.mac, error = %err, "deauthorize on expiry failed, ticker will retry");
                }
                if let Some(ip) = &user.ip {
                    if let Err(err) = self.policy.remove_limit(ip).await {
                        warn!(ip = %ip, error = %err, "remove_limit on expiry failed, ticker will retry");
                    }
                }
                report.expired.push(user.user_id);
            } else {
                self.store.decrement(&user.user_id, delta).await?;
                report.decremented += 1;
            }
        }

        if due_sample {
            self.sample_traffic().await?;
            report.sampled = true;
        }

        if due_reconcile {
            let (reauthorized, stray) = self.reconcile_macs().await?;
            report.reauthorized = reauthorized;
            report.stray_deauthorized = stray;
            report.reconciled = true;
        }

        Ok(report)
    }

    async fn sample_traffic(&self) -> EngineResult<()> {
        let fresh = self.policy.sample_counters().await?;

        let to_touch = {
            let cache = self.byte_cache.lock().unwrap();
            let mut to_touch = Vec::new();

            for user in self.store.iterate_connected()? {
                let Some(ip) = &user.ip else { continue };
                let class_id = class_id_for_ip(ip);

                let upload_current = fresh.uploads.get(ip).copied().unwrap_or_default();
                let upload_cached = cache.uploads.get(ip).copied().unwrap_or_default();
                let download_current = class_id.and_then(|c| fresh.downloads.get(&c)).copied().unwrap_or_default();
                let download_cached = class_id.and_then(|c| cache.downloads.get(&c)).copied().unwrap_or_default();

                let delta = if upload_current.bytes < upload_cached.bytes || download_current.bytes < download_cached.bytes {
                    // Counter reset: treat the current reading itself as the delta.
                    upload_current.bytes + download_current.bytes
                } else {
                    (upload_current.bytes - upload_cached.bytes) + (download_current.bytes - download_cached.bytes)
                };

                if delta > 0 {
                    to_touch.push(user.user_id);
                }
            }

            to_touch
        };

        for user_id in &to_touch {
            self.store.touch_traffic(user_id).await?;
        }

        *self.byte_cache.lock().unwrap() = fresh;
        Ok(())
    }

    async fn reconcile_macs(&self) -> EngineResult<(Vec<String>, Vec<String>)> {
        let policy_macs: HashSet<String> = self.policy.list_authorized_macs().await?.into_iter().collect();
        let active = self.store.iterate_active()?;
        let active_macs: HashSet<String> = active.iter().map(|u| u.mac.clone()).collect();

        let mut reauthorized = Vec::new();
        for user in &active {
            if !policy_macs.contains(&user.mac) {
                self.policy.authorize(&user.mac).await?;
                reauthorized.push(user.mac.clone());
            }
        }

        let mut stray = Vec::new();
        for mac in &policy_macs {
            if !active_macs.contains(mac) {
                self.policy.deauthorize(mac).await?;
                stray.push(mac.clone());
            }
        }

        if !reauthorized.is_empty() || !stray.is_empty() {
            debug!(reauthorized = reauthorized.len(), stray = stray.len(), "mac reconciliation drift corrected");
        }

        Ok((reauthorized, stray))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;
    use vendo_database::NewUser;
    use vendo_policy::FakePacketPolicy;

    async fn store() -> SessionStore {
        let dir = tempdir().unwrap();
        SessionStore::open(&dir.path().join("store.sqlite")).await.unwrap()
    }

    fn new_user(mac: &str, code: &str) -> NewUser {
        NewUser {
            user_id: format!("user-{code}"),
            mac: mac.to_string(),
            client_id: None,
            user_code: code.to_string(),
            credit_seconds: 0,
            rate_down_kbps: 0,
            rate_up_kbps: 0,
        }
    }

    fn t(offset_seconds: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc) + Duration::seconds(offset_seconds)
    }

    #[tokio::test]
    async fn expiry_reconciliation_matches_s6() {
        let store = store().await;
        let policy = FakePacketPolicy::new();
        let user = store.insert_user(new_user("aa:bb:cc:dd:ee:01", "CODE01")).await.unwrap();
        store.add_credit(&user.user_id, 3).await.unwrap();
        store.assign_ip(&user.user_id, "10.0.0.9").await.unwrap();
        policy.authorize(&user.mac).await.unwrap();
        policy.set_limit("10.0.0.9", 512, 256).await.unwrap();

        let ticker = Ticker::new(&store, &policy, TickerConfig::default());
        ticker.tick(t(0)).await.unwrap();
        let report = ticker.tick(t(5)).await.unwrap();

        assert!(report.expired.contains(&user.user_id));
        assert!(!policy.is_authorized(&user.mac));
        assert_eq!(policy.limit_for("10.0.0.9"), None);

        let after = store.find_by_id(&user.user_id).unwrap().unwrap();
        assert_eq!(after.credit_seconds, 0);
        assert!(!after.connected);
    }

    #[tokio::test]
    async fn non_expiring_user_decrements_by_delta() {
        let store = store().await;
        let policy = FakePacketPolicy::new();
        let user = store.insert_user(new_user("aa:bb:cc:dd:ee:02", "CODE02")).await.unwrap();
        store.add_credit(&user.user_id, 100).await.unwrap();

        let ticker = Ticker::new(&store, &policy, TickerConfig::default());
        ticker.tick(t(0)).await.unwrap();
        ticker.tick(t(10)).await.unwrap();

        let after = store.find_by_id(&user.user_id).unwrap().unwrap();
        assert_eq!(after.credit_seconds, 90);
    }

    #[tokio::test]
    async fn counter_reset_is_treated_as_fresh_delta_not_negative() {
        let store = store().await;
        let policy = FakePacketPolicy::new();
        let user = store.insert_user(new_user("aa:bb:cc:dd:ee:03", "CODE03")).await.unwrap();
        store.add_credit(&user.user_id, 100).await.unwrap();
        store.assign_ip(&user.user_id, "10.0.0.5").await.unwrap();

        let config = TickerConfig { traffic_sample_interval_seconds: 1, mac_reconcile_interval_seconds: 3600 };
        let ticker = Ticker::new(&store, &policy, config);

        policy.seed_counter("10.0.0.5", 90, 10);
        ticker.tick(t(0)).await.unwrap();
        let before = store.find_by_id(&user.user_id).unwrap().unwrap().last_traffic_at;

        // Counter "resets" to a smaller value than cached; must still count
        // as a nonzero delta rather than going negative and being ignored.
        policy.seed_counter("10.0.0.5", 2, 3);
        ticker.tick(t(2)).await.unwrap();
        let after = store.find_by_id(&user.user_id).unwrap().unwrap().last_traffic_at;
        assert!(after >= before);
    }

    #[tokio::test]
    async fn mac_reconciliation_authorizes_missing_and_drops_stray() {
        let store = store().await;
        let policy = FakePacketPolicy::new();
        let user = store.insert_user(new_user("aa:bb:cc:dd:ee:04", "CODE04")).await.unwrap();
        store.add_credit(&user.user_id, 100).await.unwrap();
        // Active in-store but never authorized at the policy layer.
        policy.authorize("aa:bb:cc:dd:ee:ff").await.unwrap(); // stray, no matching active user

        let config = TickerConfig { traffic_sample_interval_seconds: 3600, mac_reconcile_interval_seconds: 1 };
        let ticker = Ticker::new(&store, &policy, config);
        ticker.tick(t(0)).await.unwrap();
        let report = ticker.tick(t(2)).await.unwrap();

        assert!(report.reconciled);
        assert!(report.reauthorized.contains(&user.mac));
        assert!(report.stray_deauthorized.contains(&"aa:bb:cc:dd:ee:ff".to_string()));
        assert!(policy.is_authorized(&user.mac));
        assert!(!policy.is_authorized("aa:bb:cc:dd:ee:ff"));
    }
}
