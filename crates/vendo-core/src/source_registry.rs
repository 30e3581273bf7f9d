//! SourceRegistry (§4.4): the local coin slot plus remote sub-devices.

use crate::error::{EngineError, EngineResult};
use chrono::Utc;
use vendo_database::{SessionStore, SourceKind, SourceRow};

pub const LOCAL_SOURCE_ID: &str = "hardware";
const ONLINE_WINDOW_SECONDS: i64 = 70;

/// Tracks source registration, heartbeat liveness and per-source pricing.
pub struct SourceRegistry<'a> {
    store: &'a SessionStore,
    sub_vendo_key: String,
}

impl<'a> SourceRegistry<'a> {
    pub fn new(store: &'a SessionStore, sub_vendo_key: impl Into<String>) -> Self {
        Self { store, sub_vendo_key: sub_vendo_key.into() }
    }

    /// Upsert a remote source after verifying its shared secret.
    pub async fn register_remote(
        &self,
        id: &str,
        display_name: &str,
        secret: &str,
        pulse_value_pesos: i64,
        rate_down_kbps: Option<i64>,
        rate_up_kbps: Option<i64>,
    ) -> EngineResult<SourceRow> {
        self.verify_secret(secret)?;
        if !(1..=100).contains(&pulse_value_pesos) {
            return Err(EngineError::Invalid("pulse_value_pesos out of range".to_string()));
        }
        let row = self
            .store
            .upsert_source(
                id,
                SourceKind::Remote,
                display_name,
                pulse_value_pesos,
                rate_down_kbps,
                rate_up_kbps,
            )
            .await?;
        Ok(row)
    }

    /// Record an authenticated heartbeat/pulse from a remote source.
    pub async fn heartbeat(&self, id: &str, secret: &str) -> EngineResult<()> {
        self.verify_secret(secret)?;
        self.store.touch_source(id).await?;
        Ok(())
    }

    fn verify_secret(&self, secret: &str) -> EngineResult<()> {
        if secret != self.sub_vendo_key {
            return Err(EngineError::Invalid("bad sub_vendo_key".to_string()));
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> EngineResult<Option<SourceRow>> {
        Ok(self.store.get_source(id)?)
    }

    pub fn list(&self) -> EngineResult<Vec<SourceRow>> {
        Ok(self.store.list_sources()?)
    }

    pub fn visible_rate_ids(&self, source_id: &str) -> EngineResult<Vec<i64>> {
        Ok(self.store.visible_rate_ids(source_id)?)
    }

    /// A source is online iff its last heartbeat landed within the window.
    pub fn is_online(source: &SourceRow) -> bool {
        (Utc::now() - source.last_active_at).num_seconds() < ONLINE_WINDOW_SECONDS
    }

    /// Ensure the always-present local hardware slot exists (normally
    /// seeded by the migration, but idempotent here too).
    pub async fn ensure_local_source(&self) -> EngineResult<SourceRow> {
        if let Some(existing) = self.get(LOCAL_SOURCE_ID)? {
            return Ok(existing);
        }
        Ok(self
            .store
            .upsert_source(LOCAL_SOURCE_ID, SourceKind::Local, "Coin/bill slot", 1, None, None)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn store() -> SessionStore {
        let dir = tempdir().unwrap();
        SessionStore::open(&dir.path().join("store.sqlite")).await.unwrap()
    }

    #[tokio::test]
    async fn register_remote_rejects_bad_secret() {
        let store = store().await;
        let registry = SourceRegistry::new(&store, "correct-secret");
        let result = registry
            .register_remote("remote:a", "Lobby", "wrong-secret", 1, None, None)
            .await;
        assert!(matches!(result, Err(EngineError::Invalid(_))));
    }

    #[tokio::test]
    async fn register_remote_then_heartbeat_updates_liveness() {
        let store = store().await;
        let registry = SourceRegistry::new(&store, "shared-secret");
        registry
            .register_remote("remote:a", "Lobby", "shared-secret", 2, None, None)
            .await
            .unwrap();

        let source = registry.get("remote:a").unwrap().unwrap();
        assert!(SourceRegistry::is_online(&source));
        assert_eq!(source.pulse_value_pesos, 2);

        registry.heartbeat("remote:a", "shared-secret").await.unwrap();
        let result = registry.heartbeat("remote:a", "wrong").await;
        assert!(matches!(result, Err(EngineError::Invalid(_))));
    }

    #[tokio::test]
    async fn pulse_value_out_of_range_is_rejected() {
        let store = store().await;
        let registry = SourceRegistry::new(&store, "secret");
        let result = registry.register_remote("remote:b", "B", "secret", 0, None, None).await;
        assert!(matches!(result, Err(EngineError::Invalid(_))));
        let result = registry.register_remote("remote:b", "B", "secret", 101, None, None).await;
        assert!(matches!(result, Err(EngineError::Invalid(_))));
    }

    #[tokio::test]
    async fn ensure_local_source_is_idempotent() {
        let store = store().await;
        let registry = SourceRegistry::new(&store, "secret");
        let first = registry.ensure_local_source().await.unwrap();
        let second = registry.ensure_local_source().await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(registry.list().unwrap().len(), 1);
    }
}
