//! Engine (§4.10): the composition root wiring every component and
//! exposing the Portal API contract (§6).

use crate::coin_aggregator::{CoinAggregator, CoinSessionView, CommitRequest, PulseOutcome, StartOutcome, VendoMode};
use crate::credit_applier::{CreditApplier, CreditResult};
use crate::error::{EngineError, EngineResult};
use crate::fail_gate::{FailAttemptGate, FailAttemptGateConfig};
use crate::identity::IdentityResolver;
use crate::idle_monitor::{IdleMonitor, IdleMonitorConfig};
use crate::rate_planner::{self, RateLine};
use crate::source_registry::{SourceRegistry, LOCAL_SOURCE_ID};
use crate::ticker::{Ticker, TickerConfig};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vendo_config::Config;
use vendo_database::{SourceRow, User};
use vendo_policy::PacketPolicy;

/// The most recent free-time grant for a user, surfaced by `status()`.
#[derive(Debug, Clone, PartialEq)]
pub struct FreeTimeView {
    pub seconds_granted: i64,
    pub source: String,
    pub granted_at: DateTime<Utc>,
}

/// Snapshot returned by the `status` portal operation.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusView {
    pub user_id: Option<String>,
    pub credit_seconds: i64,
    pub paused: bool,
    pub connected: bool,
    pub user_code: Option<String>,
    pub pending_amount: Option<i64>,
    pub pending_minutes: Option<i64>,
    pub vendo_mode: VendoMode,
    pub sources: Vec<SourceRow>,
    pub coin_session: Option<CoinSessionView>,
    pub free_time: Option<FreeTimeView>,
}

/// Key used to look an existing session back up, for `restoreSession`.
pub enum RestoreKey {
    Code(String),
    ClientId(String),
}

/// Owns every durable and long-lived collaborator and exposes the Portal
/// API contract. No component reaches another through global state; every
/// cross-component reference is threaded explicitly here.
pub struct Engine {
    store: vendo_database::SessionStore,
    policy: Box<dyn PacketPolicy>,
    aggregator: CoinAggregator,
    sub_vendo_key: String,
    ticker_config: TickerConfig,
    idle_config: IdleMonitorConfig,
    idle_interval: StdDuration,
    fail_gate_config: FailAttemptGateConfig,
}

impl Engine {
    /// Wire the engine from a frozen `Config` and already-opened
    /// collaborators, then bring enforcement in line with the store: ensure
    /// the local coin slot is registered and re-authorize every active
    /// user (the store may have survived a restart the enforcement plane
    /// did not).
    pub async fn bootstrap(
        config: &Config,
        store: vendo_database::SessionStore,
        policy: Box<dyn PacketPolicy>,
    ) -> EngineResult<Self> {
        let engine = Self {
            store,
            policy,
            aggregator: CoinAggregator::new(config.ban_limit_pulses_per_window as i64),
            sub_vendo_key: config.sub_vendo_key.clone(),
            ticker_config: TickerConfig {
                traffic_sample_interval_seconds: config.traffic_sample_interval_seconds as i64,
                mac_reconcile_interval_seconds: config.mac_reconcile_interval_seconds as i64,
            },
            idle_config: IdleMonitorConfig { idle_timeout_seconds: config.idle_timeout_seconds as i64 },
            idle_interval: StdDuration::from_secs(config.idle_monitor_interval_seconds),
            fail_gate_config: FailAttemptGateConfig {
                ban_limit: config.fail_ban_limit as i64,
                ban_duration_seconds: config.fail_ban_duration_seconds as i64,
            },
        };

        engine.source_registry().ensure_local_source().await?;

        for user in engine.store.iterate_active()? {
            if let Err(err) = engine.policy.authorize(&user.mac).await {
                warn!(mac = %user.mac, error = %err, "startup re-authorize failed, ticker will retry");
            }
            if let Some(ip) = &user.ip {
                if let Err(err) = engine.policy.set_limit(ip, user.rate_down_kbps, user.rate_up_kbps).await {
                    warn!(ip = %ip, error = %err, "startup set_limit failed, ticker will retry");
                }
            }
        }
        info!("engine bootstrapped");

        Ok(engine)
    }

    fn identity(&self) -> IdentityResolver<'_> {
        IdentityResolver::new(&self.store, self.policy.as_ref())
    }

    fn source_registry(&self) -> SourceRegistry<'_> {
        SourceRegistry::new(&self.store, self.sub_vendo_key.clone())
    }

    fn credit_applier(&self) -> CreditApplier<'_> {
        CreditApplier::new(&self.store, self.policy.as_ref())
    }

    fn fail_gate(&self) -> FailAttemptGate<'_> {
        FailAttemptGate::new(&self.store, self.fail_gate_config)
    }

    /// Rate lines visible to `source_id`, falling back to the full table
    /// when the source defines no visibility subset.
    fn rate_lines_for_source(&self, source_id: &str) -> EngineResult<Vec<RateLine>> {
        let all = self.store.list_rates()?;
        let visible_ids = self.store.visible_rate_ids(source_id)?;
        let lines = if visible_ids.is_empty() {
            all.iter().map(RateLine::from).collect()
        } else {
            all.iter().filter(|r| visible_ids.contains(&r.id)).map(RateLine::from).collect()
        };
        Ok(lines)
    }

    fn source_override(&self, source: &SourceRow) -> Option<(i64, i64)> {
        match (source.rate_up_kbps, source.rate_down_kbps) {
            (Some(up), Some(down)) => Some((up, down)),
            _ => None,
        }
    }

    fn dominant_source(per_source_amount: &BTreeMap<String, i64>) -> Option<&str> {
        per_source_amount
            .iter()
            .max_by_key(|(_, amount)| *amount)
            .map(|(source, _)| source.as_str())
    }

    // ---- Portal API contract ----

    pub async fn status(&self, client_id: Option<&str>, mac: Option<&str>) -> EngineResult<StatusView> {
        let user = self.identity().resolve(client_id, mac).await?;
        let (pending_amount, pending_minutes, coin_session) = match (&user, mac) {
            (Some(u), Some(m)) if identity_matches(u, m) => {
                let pending = self.aggregator.pending_amount();
                let minutes = pending.and_then(|amount| {
                    let lines = self.rate_lines_for_source(LOCAL_SOURCE_ID).ok()?;
                    Some(rate_planner::plan(&lines, amount).minutes)
                });
                (pending, minutes, self.aggregator.current_session())
            }
            _ => (None, None, None),
        };

        let free_time = match &user {
            Some(u) => self.store.last_free_time_grant(&u.mac)?.map(|sale| FreeTimeView {
                seconds_granted: sale.seconds,
                source: sale.source,
                granted_at: sale.ts,
            }),
            None => None,
        };

        Ok(StatusView {
            user_id: user.as_ref().map(|u| u.user_id.clone()),
            credit_seconds: user.as_ref().map(|u| u.credit_seconds).unwrap_or(0),
            paused: user.as_ref().map(|u| u.paused).unwrap_or(false),
            connected: user.as_ref().map(|u| u.connected).unwrap_or(false),
            user_code: user.map(|u| u.user_code),
            pending_amount,
            pending_minutes,
            vendo_mode: self.aggregator.mode(),
            sources: self.source_registry().list()?,
            coin_session,
            free_time,
        })
    }

    pub fn start_coin_insert(
        &self,
        owner_mac: &str,
        owner_client_id: Option<&str>,
        mode: VendoMode,
        target: Option<&str>,
        now: DateTime<Utc>,
    ) -> EngineResult<StartOutcome> {
        self.fail_gate().check(owner_mac, now)?;
        Ok(self.aggregator.start_insert(owner_mac, owner_client_id, mode, target, now))
    }

    /// Deliver one coin/pulse event. Returns `Ok(None)` if the pulse was
    /// dropped (idle, wrong target, or the session was banned).
    pub fn pulse(&self, source: &str, count: i64, now: DateTime<Utc>) -> EngineResult<PulseOutcome> {
        let pulse_value = self
            .source_registry()
            .get(source)?
            .map(|s| s.pulse_value_pesos)
            .unwrap_or(1);
        Ok(self.aggregator.pulse(source, count, pulse_value, now))
    }

    pub async fn finalize_coin_insert(&self) -> EngineResult<CreditResult> {
        match self.aggregator.done() {
            Some(request) => self.commit(request).await,
            None => Ok(CreditResult { seconds_added: 0, user_code: String::new(), amount: 0 }),
        }
    }

    /// Called by the background deadline poller; commits a session whose
    /// pulse-idle or absolute deadline has elapsed.
    pub async fn poll_coin_deadline(&self, now: DateTime<Utc>) -> EngineResult<Option<CreditResult>> {
        match self.aggregator.poll_deadline(now) {
            Some(request) => Ok(Some(self.commit(request).await?)),
            None => Ok(None),
        }
    }

    async fn commit(&self, request: CommitRequest) -> EngineResult<CreditResult> {
        let dominant = Self::dominant_source(&request.per_source_amount).unwrap_or(LOCAL_SOURCE_ID).to_string();
        let lines = self.rate_lines_for_source(&dominant)?;
        let source_override = self.source_registry().get(&dominant)?.and_then(|s| self.source_override(&s));

        let result = self
            .credit_applier()
            .apply(
                &request.owner_mac,
                request.owner_client_id.as_deref(),
                &request.per_source_amount,
                &lines,
                source_override,
            )
            .await;

        match result {
            Ok(credit) => {
                self.aggregator.commit_complete();
                Ok(credit)
            }
            Err(err) => {
                // Per §4.3: retain the pending record (aggregator stays in
                // Committing) until an operator resolves it or an explicit
                // abort happens; the Sale rows already written are not lost.
                warn!(mac = %request.owner_mac, error = %err, "coin commit failed, leaving aggregator in Committing for operator resolution");
                Err(err)
            }
        }
    }

    pub fn abort_pending_commit(&self) {
        self.aggregator.abort_commit();
    }

    pub async fn pause_session(&self, mac: &str) -> EngineResult<()> {
        let user = self.store.find_by_mac(mac)?.ok_or_else(|| EngineError::NotFound(mac.to_string()))?;
        self.store.pause(&user.user_id).await?;
        self.policy.deauthorize(&user.mac).await?;
        if let Some(ip) = &user.ip {
            self.policy.remove_limit(ip).await?;
        }
        Ok(())
    }

    pub async fn resume_session(&self, mac: &str) -> EngineResult<()> {
        let user = self.store.find_by_mac(mac)?.ok_or_else(|| EngineError::NotFound(mac.to_string()))?;
        self.store.resume(&user.user_id).await?;
        self.policy.authorize(&user.mac).await?;
        if let Some(ip) = &user.ip {
            self.policy.set_limit(ip, user.rate_down_kbps, user.rate_up_kbps).await?;
        }
        Ok(())
    }

    /// Vouchers are minted externally (out of scope); the core only
    /// validates and consumes them. A voucher is a `config` row keyed
    /// `voucher:{code}` whose value is the minute count; consuming it
    /// overwrites the value with `"used"`.
    pub async fn redeem_voucher(&self, mac: &str, code: &str, now: DateTime<Utc>) -> EngineResult<CreditResult> {
        self.fail_gate().check(mac, now)?;

        let key = format!("voucher:{code}");
        let minutes = match self.store.get_config(&key)?.and_then(|v| v.parse::<i64>().ok()) {
            Some(minutes) if minutes > 0 => minutes,
            _ => {
                self.fail_gate().record_failure(mac, now).await?;
                return Err(EngineError::Invalid("unknown or already-used voucher code".to_string()));
            }
        };

        self.store.set_config(&key, "used").await?;
        self.fail_gate().record_success(mac).await?;
        self.credit_applier().grant_free_time(mac, minutes * 60, "voucher").await
    }

    pub async fn restore_session(&self, key: RestoreKey) -> EngineResult<User> {
        let found = match key {
            RestoreKey::Code(code) => self.store.find_by_code(&code)?,
            RestoreKey::ClientId(client_id) => self.store.find_by_cookie(&client_id)?,
        };
        found.ok_or_else(|| EngineError::NotFound("no matching session".to_string()))
    }
}

/// `true` if `user`'s current MAC matches `mac`, used by `status` to decide
/// whether the aggregator's pending session (which is keyed by MAC, not by
/// user) belongs to the caller.
pub(crate) fn identity_matches(user: &User, mac: &str) -> bool {
    user.mac.eq_ignore_ascii_case(mac)
}

/// Spawn the 1 Hz `Ticker` reconciliation loop.
pub fn spawn_ticker(engine: Arc<Engine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(StdDuration::from_secs(1));
        loop {
            interval.tick().await;
            let ticker = Ticker::new(&engine.store, engine.policy.as_ref(), engine.ticker_config);
            if let Err(err) = ticker.tick(Utc::now()).await {
                warn!(error = %err, "ticker pass failed");
            }
        }
    })
}

/// Spawn the `IdleMonitor` sweep loop.
pub fn spawn_idle_monitor(engine: Arc<Engine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(engine.idle_interval);
        loop {
            interval.tick().await;
            let monitor = IdleMonitor::new(&engine.store, engine.policy.as_ref(), engine.idle_config);
            monitor.sweep(Utc::now()).await;
        }
    })
}

/// Spawn the CoinAggregator deadline poller (pulse-idle and absolute
/// deadlines must fire even without further pulses).
pub fn spawn_coin_deadline_poller(engine: Arc<Engine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(StdDuration::from_secs(1));
        loop {
            interval.tick().await;
            match engine.poll_coin_deadline(Utc::now()).await {
                Ok(Some(credit)) => info!(amount = credit.amount, seconds = credit.seconds_added, "coin session committed on deadline"),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "deadline-triggered coin commit failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use vendo_policy::FakePacketPolicy;

    async fn engine() -> Engine {
        let dir = tempdir().unwrap();
        let store = vendo_database::SessionStore::open(&dir.path().join("store.sqlite")).await.unwrap();
        store.upsert_rate(1, 1, 256, 512).await.unwrap();
        store.upsert_rate(5, 7, 512, 1024).await.unwrap();
        store.upsert_rate(10, 15, 1024, 2048).await.unwrap();
        let config = Config::default();
        Engine::bootstrap(&config, store, Box::new(FakePacketPolicy::new())).await.unwrap()
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn bootstrap_registers_local_source() {
        let engine = engine().await;
        let status = engine.status(None, None).await.unwrap();
        assert!(status.sources.iter().any(|s| s.id == LOCAL_SOURCE_ID));
    }

    #[tokio::test]
    async fn end_to_end_single_local_insert_matches_s1() {
        let engine = engine().await;
        let mac = "aa:bb:cc:dd:ee:01";

        engine.start_coin_insert(mac, Some("C1"), VendoMode::Auto, None, now()).unwrap();
        engine.pulse(LOCAL_SOURCE_ID, 3, now()).unwrap();
        let result = engine.finalize_coin_insert().await.unwrap();

        assert_eq!(result.seconds_added, 180);
        let status = engine.status(Some("C1"), Some(mac)).await.unwrap();
        assert_eq!(status.credit_seconds, 180);
    }

    #[tokio::test]
    async fn status_surfaces_vendo_mode_and_open_coin_session() {
        let engine = engine().await;
        let mac = "aa:bb:cc:dd:ee:05";

        let idle_status = engine.status(None, None).await.unwrap();
        assert_eq!(idle_status.vendo_mode, VendoMode::Auto);
        assert!(idle_status.coin_session.is_none());

        engine.start_coin_insert(mac, Some("C5"), VendoMode::Manual, Some("remote:a"), now()).unwrap();
        engine.pulse("remote:a", 2, now()).unwrap();

        let status = engine.status(Some("C5"), Some(mac)).await.unwrap();
        assert_eq!(status.vendo_mode, VendoMode::Manual);
        let session = status.coin_session.unwrap();
        assert_eq!(session.owner_mac, mac);
        assert_eq!(session.target_source.as_deref(), Some("remote:a"));
        assert_eq!(session.pending_amount, 2);
    }

    #[tokio::test]
    async fn status_surfaces_the_most_recent_free_time_grant() {
        let engine = engine().await;
        let mac = "aa:bb:cc:dd:ee:06";
        engine.credit_applier().grant_free_time(mac, 600, "free-time-lobby").await.unwrap();

        let status = engine.status(None, Some(mac)).await.unwrap();
        let free_time = status.free_time.unwrap();
        assert_eq!(free_time.seconds_granted, 600);
        assert_eq!(free_time.source, "free-time-lobby");
    }

    #[tokio::test]
    async fn busy_when_another_owner_holds_the_slot() {
        let engine = engine().await;
        engine.start_coin_insert("aa:bb:cc:dd:ee:01", None, VendoMode::Auto, None, now()).unwrap();
        let outcome = engine.start_coin_insert("aa:bb:cc:dd:ee:02", None, VendoMode::Auto, None, now()).unwrap();
        assert_eq!(outcome, StartOutcome::Busy);
    }

    #[tokio::test]
    async fn redeem_voucher_applies_minutes_and_marks_consumed() {
        let engine = engine().await;
        engine.store.set_config("voucher:FREE10", "10").await.unwrap();

        let result = engine.redeem_voucher("aa:bb:cc:dd:ee:03", "FREE10", now()).await.unwrap();
        assert_eq!(result.seconds_added, 600);

        let reuse = engine.redeem_voucher("aa:bb:cc:dd:ee:03", "FREE10", now()).await;
        assert!(matches!(reuse, Err(EngineError::Invalid(_))));
    }

    #[tokio::test]
    async fn restore_session_by_code_finds_user() {
        let engine = engine().await;
        let mac = "aa:bb:cc:dd:ee:04";
        engine.start_coin_insert(mac, None, VendoMode::Auto, None, now()).unwrap();
        engine.pulse(LOCAL_SOURCE_ID, 1, now()).unwrap();
        let credited = engine.finalize_coin_insert().await.unwrap();

        let restored = engine.restore_session(RestoreKey::Code(credited.user_code.clone())).await.unwrap();
        assert_eq!(restored.mac, mac);
    }
}
