//! CreditApplier (§4.5): the one place that turns pesos (or a free-time
//! grant) into seconds of credit, atomically from the caller's view.

use crate::error::{EngineError, EngineResult};
use crate::rate_planner::{self, RateLine};
use crate::user_code;
use rand::Rng;
use std::collections::BTreeMap;
use vendo_database::{normalize_mac, NewUser, SessionStore};
use vendo_policy::PacketPolicy;

/// Outcome of a successful credit application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditResult {
    pub seconds_added: i64,
    pub user_code: String,
    pub amount: i64,
}

pub struct CreditApplier<'a> {
    store: &'a SessionStore,
    policy: &'a dyn PacketPolicy,
}

impl<'a> CreditApplier<'a> {
    pub fn new(store: &'a SessionStore, policy: &'a dyn PacketPolicy) -> Self {
        Self { store, policy }
    }

    /// Apply a paid credit. `per_source_amount` carries already-priced
    /// pesos per contributing source (see the CoinAggregator's pricing
    /// rule). `rate_lines` must already be narrowed to the dominant
    /// source's visible subset. `source_override` is the dominant source's
    /// bandwidth override, if it defines one.
    pub async fn apply(
        &self,
        mac: &str,
        client_id: Option<&str>,
        per_source_amount: &BTreeMap<String, i64>,
        rate_lines: &[RateLine],
        source_override: Option<(i64, i64)>,
    ) -> EngineResult<CreditResult> {
        let amount: i64 = per_source_amount.values().sum();
        if amount == 0 {
            return Ok(CreditResult { seconds_added: 0, user_code: String::new(), amount: 0 });
        }

        for (source, source_amount) in per_source_amount {
            self.store.insert_sale(*source_amount, mac, source, 0).await?;
        }

        let plan = rate_planner::plan(rate_lines, amount);
        if plan.is_zero() {
            return Err(EngineError::NoRateForAmount(amount));
        }
        let seconds = plan.minutes * 60;

        self.upsert_credit(mac, client_id, seconds, plan.up_kbps, plan.down_kbps, source_override, amount)
            .await
    }

    /// Grant a periodic free-time allowance, bypassing the planner. Still
    /// writes a zero-amount Sale row tagged with the granting source so
    /// operator reports can separate paid minutes from granted ones.
    pub async fn grant_free_time(
        &self,
        mac: &str,
        seconds: i64,
        granting_source: &str,
    ) -> EngineResult<CreditResult> {
        self.store.insert_sale(0, mac, granting_source, seconds).await?;
        self.upsert_credit(mac, None, seconds, 0, 0, None, 0).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn upsert_credit(
        &self,
        mac: &str,
        client_id: Option<&str>,
        seconds: i64,
        up_kbps: i64,
        down_kbps: i64,
        source_override: Option<(i64, i64)>,
        amount: i64,
    ) -> EngineResult<CreditResult> {
        let mac_norm = normalize_mac(mac);

        let (user_id, user_code) = match self.store.find_by_mac(&mac_norm)? {
            Some(existing) => (existing.user_id, existing.user_code),
            None => {
                let code = self.unique_user_code()?;
                let new_user = NewUser {
                    user_id: generate_user_id(),
                    mac: mac_norm.clone(),
                    client_id: client_id.map(str::to_string),
                    user_code: code.clone(),
                    credit_seconds: 0,
                    rate_down_kbps: 0,
                    rate_up_kbps: 0,
                };
                let inserted = self.store.insert_user(new_user).await?;
                (inserted.user_id, inserted.user_code)
            }
        };

        self.store.add_credit(&user_id, seconds).await?;
        if let Some(cid) = client_id {
            self.store.coalesce_client_id(&user_id, cid).await?;
        }

        if let Some((override_up, override_down)) = source_override {
            self.store.set_rates(&user_id, override_up, override_down).await?;
        } else if up_kbps > 0 || down_kbps > 0 {
            self.store.raise_rates(&user_id, up_kbps, down_kbps).await?;
        }

        // Atomicity note: the store mutation above has already committed.
        // PacketPolicy failures here are not rolled back; the Ticker
        // retries enforcement until the in-store state and the
        // enforcement plane agree.
        let _ = self.policy.authorize(&mac_norm).await;
        let user = self
            .store
            .find_by_id(&user_id)?
            .ok_or_else(|| EngineError::NotFound(user_id.clone()))?;
        if let Some(ip) = &user.ip {
            let _ = self.policy.set_limit(ip, user.rate_down_kbps, user.rate_up_kbps).await;
        }

        Ok(CreditResult { seconds_added: seconds, user_code, amount })
    }

    fn unique_user_code(&self) -> EngineResult<String> {
        for _ in 0..10 {
            let candidate = user_code::generate();
            if self.store.find_by_code(&candidate)?.is_none() {
                return Ok(candidate);
            }
        }
        Err(EngineError::Transient("could not allocate a unique user_code".to_string()))
    }
}

fn generate_user_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("usr-{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use vendo_policy::FakePacketPolicy;

    async fn store() -> SessionStore {
        let dir = tempdir().unwrap();
        SessionStore::open(&dir.path().join("store.sqlite")).await.unwrap()
    }

    fn lines() -> Vec<RateLine> {
        vec![
            RateLine { amount: 1, minutes: 1, up_kbps: 256, down_kbps: 512 },
            RateLine { amount: 5, minutes: 7, up_kbps: 512, down_kbps: 1024 },
            RateLine { amount: 10, minutes: 15, up_kbps: 1024, down_kbps: 2048 },
        ]
    }

    #[tokio::test]
    async fn applying_zero_amount_succeeds_with_zero_seconds() {
        let store = store().await;
        let policy = FakePacketPolicy::new();
        let applier = CreditApplier::new(&store, &policy);
        let result = applier
            .apply("aa:bb:cc:dd:ee:01", None, &BTreeMap::new(), &lines(), None)
            .await
            .unwrap();
        assert_eq!(result.seconds_added, 0);
    }

    #[tokio::test]
    async fn single_local_insert_creates_user_and_authorizes() {
        // S1
        let store = store().await;
        let policy = FakePacketPolicy::new();
        let applier = CreditApplier::new(&store, &policy);

        let mut amounts = BTreeMap::new();
        amounts.insert("hardware".to_string(), 3);
        let result = applier
            .apply("aa:bb:cc:dd:ee:01", Some("cookie-c1"), &amounts, &lines(), None)
            .await
            .unwrap();

        assert_eq!(result.seconds_added, 180);
        assert!(crate::user_code::is_well_formed(&result.user_code));
        assert!(policy.is_authorized("aa:bb:cc:dd:ee:01"));
        assert_eq!(store.total_sales_amount().unwrap(), 3);

        let user = store.find_by_mac("aa:bb:cc:dd:ee:01").unwrap().unwrap();
        assert_eq!(user.credit_seconds, 180);
        assert_eq!(user.client_id.as_deref(), Some("cookie-c1"));
    }

    #[tokio::test]
    async fn no_rate_for_amount_keeps_sale_row() {
        let store = store().await;
        let policy = FakePacketPolicy::new();
        let applier = CreditApplier::new(&store, &policy);

        let mut amounts = BTreeMap::new();
        amounts.insert("hardware".to_string(), 3);
        let result = applier
            .apply("aa:bb:cc:dd:ee:02", None, &amounts, &[RateLine { amount: 10, minutes: 15, up_kbps: 0, down_kbps: 0 }], None)
            .await;

        assert!(matches!(result, Err(EngineError::NoRateForAmount(3))));
        assert_eq!(store.total_sales_amount().unwrap(), 3);
    }

    #[tokio::test]
    async fn free_time_writes_zero_amount_sale_and_adds_seconds() {
        let store = store().await;
        let policy = FakePacketPolicy::new();
        let applier = CreditApplier::new(&store, &policy);

        let result = applier.grant_free_time("aa:bb:cc:dd:ee:03", 600, "free-time-lobby").await.unwrap();
        assert_eq!(result.seconds_added, 600);
        assert_eq!(store.total_sales_amount().unwrap(), 0);

        let user = store.find_by_mac("aa:bb:cc:dd:ee:03").unwrap().unwrap();
        assert_eq!(user.credit_seconds, 600);
    }

    #[tokio::test]
    async fn source_override_replaces_rates_outright() {
        let store = store().await;
        let policy = FakePacketPolicy::new();
        let applier = CreditApplier::new(&store, &policy);

        let mut amounts = BTreeMap::new();
        amounts.insert("remote:a".to_string(), 5);
        applier
            .apply("aa:bb:cc:dd:ee:04", None, &amounts, &lines(), Some((64, 128)))
            .await
            .unwrap();

        let user = store.find_by_mac("aa:bb:cc:dd:ee:04").unwrap().unwrap();
        assert_eq!(user.rate_up_kbps, 64);
        assert_eq!(user.rate_down_kbps, 128);
    }
}
