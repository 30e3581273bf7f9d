//! `SessionStore`: the durable record set for users, sales, sources, rates,
//! failures and runtime config, exposed as one semantic API over the
//! writer/reader-pool split in [`crate::executor`] and [`crate::pool`].

use crate::pool::{ReaderPool, ReaderPoolConfig};
use crate::executor::Writer;
use crate::{queries, DatabaseResult, FailureRecord, NewUser, RateRow, Sale, SourceKind, SourceRow, User};
use chrono::{DateTime, Utc};
use std::path::Path;

/// Durable persistence for the gateway. Cheap to clone; every clone shares
/// the same writer thread and reader pool.
#[derive(Clone)]
pub struct SessionStore {
    writer: Writer,
    readers: std::sync::Arc<ReaderPool>,
}

impl SessionStore {
    /// Open (and migrate) the store at `path`.
    pub async fn open(path: &Path) -> DatabaseResult<Self> {
        let writer = Writer::open(path).await?;
        let readers = ReaderPool::open(path, ReaderPoolConfig::default())?;
        Ok(Self {
            writer,
            readers: std::sync::Arc::new(readers),
        })
    }

    pub async fn close(self) -> DatabaseResult<()> {
        self.writer.close().await
    }

    fn read<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T>,
    {
        let conn = self.readers.get()?;
        f(&conn)
    }

    // ---- Users ----

    pub async fn insert_user(&self, new_user: NewUser) -> DatabaseResult<User> {
        self.writer.call(move |conn| queries::insert_user(conn, &new_user)).await
    }

    pub fn find_by_id(&self, user_id: &str) -> DatabaseResult<Option<User>> {
        self.read(|conn| queries::find_by_id(conn, user_id))
    }

    pub fn find_by_cookie(&self, client_id: &str) -> DatabaseResult<Option<User>> {
        self.read(|conn| queries::find_by_cookie(conn, client_id))
    }

    pub fn find_by_mac(&self, mac: &str) -> DatabaseResult<Option<User>> {
        self.read(|conn| queries::find_by_mac(conn, mac))
    }

    pub fn find_by_code(&self, user_code: &str) -> DatabaseResult<Option<User>> {
        self.read(|conn| queries::find_by_code(conn, user_code))
    }

    pub fn find_by_ip(&self, ip: &str) -> DatabaseResult<Option<User>> {
        self.read(|conn| queries::find_by_ip(conn, ip))
    }

    pub async fn claim_mac(&self, user_id: &str, new_mac: &str) -> DatabaseResult<()> {
        let (user_id, new_mac) = (user_id.to_string(), new_mac.to_string());
        self.writer.call(move |conn| queries::claim_mac(conn, &user_id, &new_mac)).await
    }

    pub async fn bind_cookie(&self, user_id: &str, client_id: &str) -> DatabaseResult<()> {
        let (user_id, client_id) = (user_id.to_string(), client_id.to_string());
        self.writer.call(move |conn| queries::bind_cookie(conn, &user_id, &client_id)).await
    }

    pub async fn assign_ip(&self, user_id: &str, ip: &str) -> DatabaseResult<()> {
        let (user_id, ip) = (user_id.to_string(), ip.to_string());
        self.writer.call(move |conn| queries::assign_ip(conn, &user_id, &ip)).await
    }

    /// Decrement credit by `seconds`, clamped at zero. Returns the new balance.
    pub async fn decrement(&self, user_id: &str, seconds: i64) -> DatabaseResult<i64> {
        let user_id = user_id.to_string();
        self.writer.call(move |conn| queries::decrement(conn, &user_id, seconds)).await
    }

    pub async fn add_credit(&self, user_id: &str, seconds: i64) -> DatabaseResult<i64> {
        let user_id = user_id.to_string();
        self.writer.call(move |conn| queries::add_credit(conn, &user_id, seconds)).await
    }

    pub async fn raise_rates(&self, user_id: &str, up_kbps: i64, down_kbps: i64) -> DatabaseResult<()> {
        let user_id = user_id.to_string();
        self.writer
            .call(move |conn| queries::raise_rates(conn, &user_id, up_kbps, down_kbps))
            .await
    }

    pub async fn set_rates(&self, user_id: &str, up_kbps: i64, down_kbps: i64) -> DatabaseResult<()> {
        let user_id = user_id.to_string();
        self.writer
            .call(move |conn| queries::set_rates(conn, &user_id, up_kbps, down_kbps))
            .await
    }

    pub async fn coalesce_client_id(&self, user_id: &str, client_id: &str) -> DatabaseResult<()> {
        let (user_id, client_id) = (user_id.to_string(), client_id.to_string());
        self.writer
            .call(move |conn| queries::coalesce_client_id(conn, &user_id, &client_id))
            .await
    }

    pub async fn touch_traffic(&self, user_id: &str) -> DatabaseResult<()> {
        let user_id = user_id.to_string();
        self.writer.call(move |conn| queries::touch_traffic(conn, &user_id)).await
    }

    pub async fn pause(&self, user_id: &str) -> DatabaseResult<()> {
        let user_id = user_id.to_string();
        self.writer.call(move |conn| queries::pause(conn, &user_id)).await
    }

    pub async fn resume(&self, user_id: &str) -> DatabaseResult<()> {
        let user_id = user_id.to_string();
        self.writer.call(move |conn| queries::resume(conn, &user_id)).await
    }

    pub async fn expire(&self, user_id: &str) -> DatabaseResult<()> {
        let user_id = user_id.to_string();
        self.writer.call(move |conn| queries::expire(conn, &user_id)).await
    }

    /// Snapshot of every user with positive credit and not paused.
    pub fn iterate_active(&self) -> DatabaseResult<Vec<User>> {
        self.read(queries::iterate_active)
    }

    /// Snapshot of every connected, unpaused user — the `IdleMonitor`'s domain.
    pub fn iterate_connected(&self) -> DatabaseResult<Vec<User>> {
        self.read(queries::iterate_connected)
    }

    pub fn active_macs(&self) -> DatabaseResult<Vec<String>> {
        self.read(queries::active_macs)
    }

    // ---- Sales ----

    pub async fn insert_sale(&self, amount: i64, mac: &str, source: &str, seconds: i64) -> DatabaseResult<Sale> {
        let (mac, source) = (mac.to_string(), source.to_string());
        self.writer
            .call(move |conn| queries::insert_sale(conn, amount, &mac, &source, seconds))
            .await
    }

    pub fn total_sales_amount(&self) -> DatabaseResult<i64> {
        self.read(queries::total_sales_amount)
    }

    pub fn sales_by_source_since(&self, since: DateTime<Utc>) -> DatabaseResult<Vec<(String, i64)>> {
        self.read(move |conn| queries::sales_by_source_since(conn, since))
    }

    pub fn last_free_time_grant(&self, mac: &str) -> DatabaseResult<Option<Sale>> {
        self.read(move |conn| queries::last_free_time_grant(conn, mac))
    }

    // ---- Sources ----

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_source(
        &self,
        id: &str,
        kind: SourceKind,
        display_name: &str,
        pulse_value_pesos: i64,
        rate_down_kbps: Option<i64>,
        rate_up_kbps: Option<i64>,
    ) -> DatabaseResult<SourceRow> {
        let (id, display_name) = (id.to_string(), display_name.to_string());
        self.writer
            .call(move |conn| {
                queries::upsert_source(
                    conn,
                    &id,
                    kind,
                    &display_name,
                    pulse_value_pesos,
                    rate_down_kbps,
                    rate_up_kbps,
                )
            })
            .await
    }

    pub async fn touch_source(&self, id: &str) -> DatabaseResult<()> {
        let id = id.to_string();
        self.writer.call(move |conn| queries::touch_source(conn, &id)).await
    }

    pub fn get_source(&self, id: &str) -> DatabaseResult<Option<SourceRow>> {
        self.read(|conn| queries::get_source(conn, id))
    }

    pub fn list_sources(&self) -> DatabaseResult<Vec<SourceRow>> {
        self.read(queries::list_sources)
    }

    pub fn visible_rate_ids(&self, source_id: &str) -> DatabaseResult<Vec<i64>> {
        self.read(|conn| queries::visible_rate_ids(conn, source_id))
    }

    pub async fn set_visible_rate_ids(&self, source_id: &str, rate_ids: Vec<i64>) -> DatabaseResult<()> {
        let source_id = source_id.to_string();
        self.writer
            .call(move |conn| queries::set_visible_rate_ids(conn, &source_id, &rate_ids))
            .await
    }

    // ---- Rates ----

    pub fn list_rates(&self) -> DatabaseResult<Vec<RateRow>> {
        self.read(queries::list_rates)
    }

    pub async fn upsert_rate(
        &self,
        amount: i64,
        minutes: i64,
        rate_up_kbps: i64,
        rate_down_kbps: i64,
    ) -> DatabaseResult<RateRow> {
        self.writer
            .call(move |conn| queries::upsert_rate(conn, amount, minutes, rate_up_kbps, rate_down_kbps))
            .await
    }

    // ---- Failures ----

    pub fn get_failure(&self, mac: &str) -> DatabaseResult<Option<FailureRecord>> {
        self.read(|conn| queries::get_failure(conn, mac))
    }

    pub async fn record_failure(&self, mac: &str) -> DatabaseResult<FailureRecord> {
        let mac = mac.to_string();
        self.writer.call(move |conn| queries::record_failure(conn, &mac)).await
    }

    pub async fn set_banned_until(&self, mac: &str, until: DateTime<Utc>) -> DatabaseResult<()> {
        let mac = mac.to_string();
        self.writer.call(move |conn| queries::set_banned_until(conn, &mac, until)).await
    }

    pub async fn clear_failure(&self, mac: &str) -> DatabaseResult<()> {
        let mac = mac.to_string();
        self.writer.call(move |conn| queries::clear_failure(conn, &mac)).await
    }

    // ---- Config ----

    pub fn get_config(&self, key: &str) -> DatabaseResult<Option<String>> {
        self.read(|conn| queries::get_config(conn, key))
    }

    pub async fn set_config(&self, key: &str, value: &str) -> DatabaseResult<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.writer.call(move |conn| queries::set_config(conn, &key, &value)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_user(mac: &str, code: &str) -> NewUser {
        NewUser {
            user_id: format!("user-{mac}"),
            mac: mac.to_string(),
            client_id: None,
            user_code: code.to_string(),
            credit_seconds: 0,
            rate_down_kbps: 0,
            rate_up_kbps: 0,
        }
    }

    #[tokio::test]
    async fn insert_and_find_roundtrip() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(&dir.path().join("store.sqlite")).await.unwrap();
        let user = store.insert_user(new_user("AA:BB:CC:DD:EE:FF", "ABC123")).await.unwrap();
        assert_eq!(user.mac, "aa:bb:cc:dd:ee:ff");

        let found = store.find_by_mac("aa:bb:cc:dd:ee:ff").unwrap().unwrap();
        assert_eq!(found.user_id, user.user_id);
        let found = store.find_by_code("ABC123").unwrap().unwrap();
        assert_eq!(found.user_id, user.user_id);
    }

    #[tokio::test]
    async fn decrement_clamps_at_zero() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(&dir.path().join("store.sqlite")).await.unwrap();
        let user = store.insert_user(new_user("aa:bb:cc:dd:ee:01", "CODE01")).await.unwrap();
        store.add_credit(&user.user_id, 30).await.unwrap();
        let balance = store.decrement(&user.user_id, 100).await.unwrap();
        assert_eq!(balance, 0);
    }

    #[tokio::test]
    async fn assign_ip_enforces_single_owner() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(&dir.path().join("store.sqlite")).await.unwrap();
        let a = store.insert_user(new_user("aa:bb:cc:dd:ee:01", "CODEA1")).await.unwrap();
        let b = store.insert_user(new_user("aa:bb:cc:dd:ee:02", "CODEB2")).await.unwrap();
        store.add_credit(&a.user_id, 60).await.unwrap();
        store.add_credit(&b.user_id, 60).await.unwrap();

        store.assign_ip(&a.user_id, "10.0.0.5").await.unwrap();
        store.assign_ip(&b.user_id, "10.0.0.5").await.unwrap();

        let a_after = store.find_by_id(&a.user_id).unwrap().unwrap();
        let b_after = store.find_by_id(&b.user_id).unwrap().unwrap();
        assert_eq!(a_after.ip, None);
        assert_eq!(b_after.ip.as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn claim_mac_deletes_stale_record_on_target_mac() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(&dir.path().join("store.sqlite")).await.unwrap();
        let owner = store.insert_user(new_user("aa:bb:cc:dd:ee:01", "OWNER1")).await.unwrap();
        let stale = store.insert_user(new_user("aa:bb:cc:dd:ee:02", "STALE2")).await.unwrap();

        store.claim_mac(&owner.user_id, "aa:bb:cc:dd:ee:02").await.unwrap();

        assert!(store.find_by_id(&stale.user_id).unwrap().is_none());
        let owner_after = store.find_by_id(&owner.user_id).unwrap().unwrap();
        assert_eq!(owner_after.mac, "aa:bb:cc:dd:ee:02");
    }

    #[tokio::test]
    async fn iterate_active_excludes_paused_and_zero_credit() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(&dir.path().join("store.sqlite")).await.unwrap();
        let active = store.insert_user(new_user("aa:bb:cc:dd:ee:01", "ACTIVE")).await.unwrap();
        let paused = store.insert_user(new_user("aa:bb:cc:dd:ee:02", "PAUSED")).await.unwrap();
        let empty = store.insert_user(new_user("aa:bb:cc:dd:ee:03", "EMPTY0")).await.unwrap();
        store.add_credit(&active.user_id, 60).await.unwrap();
        store.add_credit(&paused.user_id, 60).await.unwrap();
        store.pause(&paused.user_id).await.unwrap();

        let actives = store.iterate_active().unwrap();
        let ids: Vec<_> = actives.iter().map(|u| u.user_id.clone()).collect();
        assert!(ids.contains(&active.user_id));
        assert!(!ids.contains(&paused.user_id));
        assert!(!ids.contains(&empty.user_id));
    }

    #[tokio::test]
    async fn sale_ledger_and_config_overrides() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(&dir.path().join("store.sqlite")).await.unwrap();
        store.insert_sale(10, "aa:bb:cc:dd:ee:01", "hardware", 0).await.unwrap();
        store.insert_sale(5, "aa:bb:cc:dd:ee:02", "hardware", 0).await.unwrap();
        assert_eq!(store.total_sales_amount().unwrap(), 15);

        assert_eq!(store.get_config("idle_timeout_seconds").unwrap(), None);
        store.set_config("idle_timeout_seconds", "180").await.unwrap();
        assert_eq!(
            store.get_config("idle_timeout_seconds").unwrap(),
            Some("180".to_string())
        );
    }
}
