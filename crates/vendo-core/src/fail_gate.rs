//! FailAttemptGate (§4.9): per-MAC lockout after repeated failures.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Duration, Utc};
use vendo_database::SessionStore;

#[derive(Debug, Clone, Copy)]
pub struct FailAttemptGateConfig {
    pub ban_limit: i64,
    pub ban_duration_seconds: i64,
}

impl Default for FailAttemptGateConfig {
    fn default() -> Self {
        Self { ban_limit: 5, ban_duration_seconds: 300 }
    }
}

pub struct FailAttemptGate<'a> {
    store: &'a SessionStore,
    config: FailAttemptGateConfig,
}

impl<'a> FailAttemptGate<'a> {
    pub fn new(store: &'a SessionStore, config: FailAttemptGateConfig) -> Self {
        Self { store, config }
    }

    /// Must be called before attempting a voucher redeem or `StartInsert`.
    /// Returns `Err(Banned(until))` while the lockout is active.
    pub fn check(&self, mac: &str, now: DateTime<Utc>) -> EngineResult<()> {
        if let Some(record) = self.store.get_failure(mac)? {
            if let Some(until) = record.banned_until {
                if until > now {
                    return Err(EngineError::Banned(until));
                }
            }
        }
        Ok(())
    }

    /// Record an unsuccessful attempt; stamps a ban once `ban_limit` is reached.
    pub async fn record_failure(&self, mac: &str, now: DateTime<Utc>) -> EngineResult<()> {
        let record = self.store.record_failure(mac).await?;
        if record.count >= self.config.ban_limit {
            let until = now + Duration::seconds(self.config.ban_duration_seconds);
            self.store.set_banned_until(mac, until).await?;
        }
        Ok(())
    }

    /// Any success clears both the counter and any ban.
    pub async fn record_success(&self, mac: &str) -> EngineResult<()> {
        self.store.clear_failure(mac).await?;
        Ok(())
    }
}
