//! Signer key resolution
//!
//! Maps a `keyId` to the actor that owns it: `acct:` ids go through account
//! discovery, remote URIs through the actor store and then a remote fetch,
//! and ids in the local namespace resolve to nothing. Every network call is
//! made inside the circuit breaker named by the caller.

use std::sync::Arc;

use super::actor::{Actor, ActorStore};
use super::circuit_breaker::CircuitBreaker;
use super::domain::{DomainGate, key_id_domain};
use super::fetch::{AccountResolver, RemoteKeyFetcher};
use crate::error::{AppError, VerificationError};
use crate::metrics::{KEY_REFRESHES_TOTAL, KEY_RESOLUTIONS_TOTAL};

/// How an actor's key was refreshed after a failed verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStrategy {
    /// Refetch the whole actor record
    Full,
    /// Refetch only the key fields
    KeyOnly,
}

impl RefreshStrategy {
    /// Full refresh when the cached record may be out of date.
    pub fn for_actor(actor: &Actor) -> Self {
        if actor.possibly_stale {
            RefreshStrategy::Full
        } else {
            RefreshStrategy::KeyOnly
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            RefreshStrategy::Full => "full",
            RefreshStrategy::KeyOnly => "key_only",
        }
    }
}

pub struct KeyResolver {
    store: Arc<dyn ActorStore>,
    accounts: Arc<dyn AccountResolver>,
    fetcher: Arc<dyn RemoteKeyFetcher>,
    domain_gate: Arc<dyn DomainGate>,
    breaker: Arc<CircuitBreaker>,
    /// `{protocol}://{domain}` of this instance
    local_base_url: String,
}

impl KeyResolver {
    pub fn new(
        store: Arc<dyn ActorStore>,
        accounts: Arc<dyn AccountResolver>,
        fetcher: Arc<dyn RemoteKeyFetcher>,
        domain_gate: Arc<dyn DomainGate>,
        breaker: Arc<CircuitBreaker>,
        local_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            accounts,
            fetcher,
            domain_gate,
            breaker,
            local_base_url: local_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Whether `uri` lives in this instance's namespace.
    pub fn is_local_uri(&self, uri: &str) -> bool {
        match uri.strip_prefix(&self.local_base_url) {
            Some(rest) => rest.is_empty() || rest.starts_with(['/', '#', '?']),
            None => false,
        }
    }

    /// Resolve the actor owning `key_id`.
    ///
    /// # Returns
    /// `None` when the key is unknown, the origin is unreachable, or the
    /// breaker for `breaker_name` is open.
    ///
    /// # Errors
    /// `DomainBlocked` when the keyId or the resolved actor is on a blocked
    /// domain, `KeyResolution` for unusable remote documents or an actor
    /// that does not own the key, and internal errors unchanged.
    pub async fn resolve(
        &self,
        key_id: &str,
        breaker_name: &str,
    ) -> Result<Option<Actor>, AppError> {
        let domain = key_id_domain(key_id);
        if self.domain_gate.is_blocked(&domain) {
            KEY_RESOLUTIONS_TOTAL.with_label_values(&["blocked"]).inc();
            return Err(VerificationError::DomainBlocked(domain).into());
        }

        if let Some(handle) = key_id.strip_prefix("acct:") {
            KEY_RESOLUTIONS_TOTAL.with_label_values(&["webfinger"]).inc();
            let actor = self
                .breaker
                .run(breaker_name, || self.accounts.resolve(handle))
                .await?;
            return actor.map(|actor| self.admit(actor)).transpose();
        }

        if self.is_local_uri(key_id) {
            KEY_RESOLUTIONS_TOTAL.with_label_values(&["local"]).inc();
            return Ok(None);
        }

        if let Some(actor) = self.store.find_by_uri(key_id).await? {
            KEY_RESOLUTIONS_TOTAL.with_label_values(&["cache"]).inc();
            return self.admit_owner(actor, key_id).map(Some);
        }

        KEY_RESOLUTIONS_TOTAL.with_label_values(&["fetch"]).inc();
        let actor = self
            .breaker
            .run(breaker_name, || self.fetcher.fetch_key(key_id, true))
            .await?;
        actor.map(|actor| self.admit_owner(actor, key_id)).transpose()
    }

    /// Apply the domain gate to the actor's own domain.
    fn admit(&self, actor: Actor) -> Result<Actor, AppError> {
        if let Some(domain) = actor.domain.as_deref() {
            if self.domain_gate.is_blocked(domain) {
                KEY_RESOLUTIONS_TOTAL.with_label_values(&["blocked"]).inc();
                return Err(VerificationError::DomainBlocked(domain.to_string()).into());
            }
        }
        Ok(actor)
    }

    fn admit_owner(&self, actor: Actor, key_id: &str) -> Result<Actor, AppError> {
        if !actor.owns_key(key_id) {
            tracing::warn!(
                key_id = %key_id,
                actor = %actor.uri,
                actor_key_id = %actor.key_id,
                "Resolved actor does not own the signing key"
            );
            return Err(VerificationError::KeyResolution(format!(
                "Actor {} does not own key {}",
                actor.uri, key_id
            ))
            .into());
        }
        self.admit(actor)
    }

    /// Refetch the key of an actor whose signature did not verify.
    ///
    /// Local actors are never refreshed.
    pub async fn refresh(
        &self,
        actor: &Actor,
        breaker_name: &str,
    ) -> Result<Option<Actor>, AppError> {
        if actor.is_local() {
            return Ok(None);
        }

        let strategy = RefreshStrategy::for_actor(actor);
        let refreshed = match strategy {
            RefreshStrategy::Full => {
                self.breaker
                    .run(breaker_name, || self.fetcher.refresh_actor(actor))
                    .await
            }
            RefreshStrategy::KeyOnly => {
                self.breaker
                    .run(breaker_name, || self.fetcher.fetch_actor_key(&actor.uri))
                    .await
            }
        };

        let result = match &refreshed {
            Ok(Some(_)) => "refreshed",
            Ok(None) => "unavailable",
            Err(_) => "error",
        };
        KEY_REFRESHES_TOTAL
            .with_label_values(&[strategy.as_str(), result])
            .inc();
        tracing::debug!(
            actor = %actor.log_identifier(),
            strategy = strategy.as_str(),
            result,
            "Refreshed signer key"
        );

        Ok(refreshed?)
    }
}
