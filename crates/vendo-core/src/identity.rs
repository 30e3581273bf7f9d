//! IdentityResolver (§4.1): reconciles `(client_id?, mac?, ip?)` onto a
//! canonical `user_id`.

use crate::error::{EngineError, EngineResult};
use vendo_database::{normalize_mac, SessionStore, User};
use vendo_policy::PacketPolicy;

/// Resolves the identity of an inbound portal request, applying the
/// cookie-vs-MAC conflict policy and mutating the store when a MAC roams.
pub struct IdentityResolver<'a> {
    store: &'a SessionStore,
    policy: &'a dyn PacketPolicy,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(store: &'a SessionStore, policy: &'a dyn PacketPolicy) -> Self {
        Self { store, policy }
    }

    /// Resolve without creating a new User. Returns `Ok(None)` when nothing
    /// matches — callers performing a crediting action create the User
    /// themselves (see `CreditApplier`).
    pub async fn resolve(&self, client_id: Option<&str>, mac: Option<&str>) -> EngineResult<Option<User>> {
        if let Some(cid) = client_id {
            if let Some(candidate) = self.store.find_by_cookie(cid)? {
                return self.reconcile_cookie_candidate(candidate, mac).await;
            }
        }

        if let Some(m) = mac {
            let norm = normalize_mac(m);
            if let Some(found) = self.store.find_by_mac(&norm)? {
                if found.client_id.is_none() {
                    if let Some(cid) = client_id {
                        self.store.bind_cookie(&found.user_id, cid).await?;
                        return Ok(self.store.find_by_id(&found.user_id)?);
                    }
                }
                return Ok(Some(found));
            }
        }

        Ok(None)
    }

    /// Resolve for a crediting action, which requires a MAC to attribute
    /// the credit to.
    pub async fn resolve_for_credit(
        &self,
        client_id: Option<&str>,
        mac: Option<&str>,
    ) -> EngineResult<Option<User>> {
        if mac.is_none() {
            return Err(EngineError::Invalid("missing_mac".to_string()));
        }
        self.resolve(client_id, mac).await
    }

    async fn reconcile_cookie_candidate(
        &self,
        candidate: User,
        mac: Option<&str>,
    ) -> EngineResult<Option<User>> {
        let Some(observed_mac) = mac else {
            return Ok(Some(candidate));
        };
        let observed = normalize_mac(observed_mac);
        if observed == candidate.mac {
            return Ok(Some(candidate));
        }

        if let Some(owner) = self.store.find_by_mac(&observed)? {
            if owner.credit_seconds > 0 && owner.user_id != candidate.user_id {
                // Trust the device's current radio identity over the cookie.
                return Ok(Some(owner));
            }
        }

        // Claim the MAC for the cookie's user: deauthorize the old MAC,
        // delete any stale record on the new one, rewrite this user's MAC.
        let _ = self.policy.deauthorize(&candidate.mac).await;
        self.store.claim_mac(&candidate.user_id, &observed).await?;
        let _ = self.policy.authorize(&observed).await;

        Ok(self.store.find_by_id(&candidate.user_id)?)
    }
}
