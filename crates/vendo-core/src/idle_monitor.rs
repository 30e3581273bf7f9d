//! IdleMonitor (§4.8): pauses connected users whose traffic and liveness
//! signals have both gone stale.

use chrono::{DateTime, Utc};
use tracing::{error, warn};
use vendo_database::SessionStore;
use vendo_policy::PacketPolicy;

#[derive(Debug, Clone, Copy)]
pub struct IdleMonitorConfig {
    pub idle_timeout_seconds: i64,
}

impl Default for IdleMonitorConfig {
    fn default() -> Self {
        Self { idle_timeout_seconds: 120 }
    }
}

pub struct IdleMonitor<'a> {
    store: &'a SessionStore,
    policy: &'a dyn PacketPolicy,
    config: IdleMonitorConfig,
}

impl<'a> IdleMonitor<'a> {
    pub fn new(store: &'a SessionStore, policy: &'a dyn PacketPolicy, config: IdleMonitorConfig) -> Self {
        Self { store, policy, config }
    }

    /// Returns the user_ids paused this sweep. Never propagates an error:
    /// a failed lookup or a failed `has_live_flows` probe defers the user
    /// to the next sweep rather than risking a spurious pause.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let connected = match self.store.iterate_connected() {
            Ok(users) => users,
            Err(err) => {
                error!(error = %err, "idle monitor could not read connected users, deferring sweep");
                return Vec::new();
            }
        };

        let mut paused = Vec::new();
        for user in connected {
            let stale_traffic = (now - user.last_traffic_at).num_seconds() >= self.config.idle_timeout_seconds;
            if !stale_traffic {
                continue;
            }

            // No assigned IP yet means no liveness signal to probe; defer to
            // the next sweep rather than risk a spurious pause, same as a
            // failed probe below.
            let live = match &user.ip {
                Some(ip) => self.policy.has_live_flows(ip).await.unwrap_or_else(|err| {
                    warn!(mac = %user.mac, error = %err, "live-flow probe failed, treating as live this sweep");
                    true
                }),
                None => true,
            };
            if live {
                continue;
            }

            if let Err(err) = self.store.pause(&user.user_id).await {
                error!(user_id = %user.user_id, error = %err, "failed to mark user paused, will retry next sweep");
                continue;
            }
            if let Err(err) = self.policy.deauthorize(&user.mac).await {
                warn!(mac = %user.mac, error = %err, "deauthorize on idle-pause failed, ticker will retry");
            }
            if let Some(ip) = &user.ip {
                if let Err(err) = self.policy.remove_limit(ip).await {
                    warn!(ip = %ip, error = %err, "remove_limit on idle-pause failed, ticker will retry");
                }
            }
            paused.push(user.user_id);
        }

        paused
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
        DateTime::parse_from_rfc3339("2026-01-01T00:10:00Z").unwrap().with_timezone(&Utc) + Duration::seconds(offset_seconds)
    }

    #[tokio::test]
    async fn stale_traffic_and_no_live_flows_pauses() {
        let store = store().await;
        let policy = FakePacketPolicy::new();
        let user = store.insert_user(new_user("aa:bb:cc:dd:ee:01", "CODE01")).await.unwrap();
        store.add_credit(&user.user_id, 600).await.unwrap();
        store.assign_ip(&user.user_id, "10.0.0.5").await.unwrap();
        policy.authorize(&user.mac).await.unwrap();
        policy.set_live_flows("10.0.0.5", false);

        let monitor = IdleMonitor::new(&store, &policy, IdleMonitorConfig { idle_timeout_seconds: 120 });
        let paused = monitor.sweep(t(121)).await;

        assert_eq!(paused, vec![user.user_id.clone()]);
        assert!(!policy.is_authorized(&user.mac));
        let after = store.find_by_id(&user.user_id).unwrap().unwrap();
        assert!(after.paused);
        assert!(!after.connected);
    }

    #[tokio::test]
    async fn live_flows_prevent_pause_despite_stale_traffic() {
        let store = store().await;
        let policy = FakePacketPolicy::new();
        let user = store.insert_user(new_user("aa:bb:cc:dd:ee:02", "CODE02")).await.unwrap();
        store.add_credit(&user.user_id, 600).await.unwrap();
        store.assign_ip(&user.user_id, "10.0.0.6").await.unwrap();
        policy.set_live_flows("10.0.0.6", true);

        let monitor = IdleMonitor::new(&store, &policy, IdleMonitorConfig { idle_timeout_seconds: 120 });
        let paused = monitor.sweep(t(121)).await;

        assert!(paused.is_empty());
        let after = store.find_by_id(&user.user_id).unwrap().unwrap();
        assert!(!after.paused);
    }

    #[tokio::test]
    async fn missing_ip_skips_the_probe_and_defers_pause() {
        let store = store().await;
        let policy = FakePacketPolicy::new();
        let user = store.insert_user(new_user("aa:bb:cc:dd:ee:05", "CODE05")).await.unwrap();
        store.add_credit(&user.user_id, 600).await.unwrap();

        let monitor = IdleMonitor::new(&store, &policy, IdleMonitorConfig { idle_timeout_seconds: 120 });
        let paused = monitor.sweep(t(121)).await;

        assert!(paused.is_empty());
    }

    #[tokio::test]
    async fn fresh_traffic_never_probes_liveness() {
        let store = store().await;
        let policy = FakePacketPolicy::new();
        let user = store.insert_user(new_user("aa:bb:cc:dd:ee:03", "CODE03")).await.unwrap();
        store.add_credit(&user.user_id, 600).await.unwrap();

        let monitor = IdleMonitor::new(&store, &policy, IdleMonitorConfig { idle_timeout_seconds: 120 });
        let paused = monitor.sweep(t(30)).await;
        assert!(paused.is_empty());
    }
}
