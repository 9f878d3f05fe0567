//! Actors and the actor key cache
//!
//! The verifier only needs key material, identity and a staleness hint from
//! an account record, so `Actor` is exactly that. `InMemoryActorStore` keeps
//! fetched actors so repeat deliveries from a peer skip the network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::AppError;

/// A federated identity with an RSA public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    /// Canonical actor URI
    pub uri: String,
    /// preferredUsername
    pub username: String,
    /// Remote host, `None` for local actors
    pub domain: Option<String>,
    /// Id of the advertised public key (usually `{uri}#main-key`)
    pub key_id: String,
    /// PEM-encoded RSA public key
    pub public_key_pem: String,
    /// The stored key may predate a remote key rotation
    pub possibly_stale: bool,
    pub local: bool,
    /// When the record was last fetched from its origin
    pub fetched_at: DateTime<Utc>,
}

impl Actor {
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Whether a signature made under `key_id` can be checked with this
    /// actor's key: the id names the key itself or the actor document.
    pub fn owns_key(&self, key_id: &str) -> bool {
        self.key_id == key_id || self.uri == key_id
    }

    /// `username@domain`, or just `username` for local actors.
    pub fn log_identifier(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{}@{}", self.username, domain),
            None => self.username.clone(),
        }
    }
}

/// Read/write access to known actors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActorStore: Send + Sync {
    /// Find an actor by its URI or by the id of its public key.
    async fn find_by_uri(&self, uri: &str) -> Result<Option<Actor>, AppError>;

    /// Find an actor by handle. `domain` is `None` for local accounts.
    async fn find_by_handle(
        &self,
        username: &str,
        domain: Option<String>,
    ) -> Result<Option<Actor>, AppError>;

    /// Insert or replace an actor record.
    ///
    /// Fails with `Validation` when the record's key id is already held by
    /// a different actor.
    async fn upsert(&self, actor: Actor) -> Result<(), AppError>;
}

/// Actor cache
///
/// Thread-safe map of actor URI to record, plus a key id index.
pub struct InMemoryActorStore {
    /// actor uri -> actor
    actors: Arc<RwLock<HashMap<String, Actor>>>,
    /// key id -> actor uri
    key_index: Arc<RwLock<HashMap<String, String>>>,
    /// Age after which records are flagged possibly stale
    stale_after: Duration,
    /// Age after which records are pruned
    ttl: Duration,
}

impl InMemoryActorStore {
    /// Create new actor store
    ///
    /// # Arguments
    /// * `stale_after` - Age at which an actor's key is treated as possibly stale (default: 1 day)
    /// * `ttl` - Age at which an entry is pruned (default: 7 days)
    pub fn new(stale_after: Option<Duration>, ttl: Option<Duration>) -> Self {
        Self {
            actors: Arc::new(RwLock::new(HashMap::new())),
            key_index: Arc::new(RwLock::new(HashMap::new())),
            stale_after: stale_after.unwrap_or(Duration::from_secs(86_400)),
            ttl: ttl.unwrap_or(Duration::from_secs(7 * 86_400)),
        }
    }

    fn age(actor: &Actor) -> Duration {
        (Utc::now() - actor.fetched_at).to_std().unwrap_or_default()
    }

    fn with_staleness(&self, mut actor: Actor) -> Actor {
        if !actor.local && Self::age(&actor) >= self.stale_after {
            actor.possibly_stale = true;
        }
        actor
    }

    /// Remove an actor and its key index entry
    pub async fn invalidate(&self, uri: &str) {
        let removed = self.actors.write().await.remove(uri);
        if let Some(actor) = removed {
            self.key_index.write().await.remove(&actor.key_id);
            tracing::debug!(actor = %uri, "Invalidated cached actor");
        }
    }

    /// Get store statistics
    pub async fn stats(&self) -> ActorStoreStats {
        let actors = self.actors.read().await;
        let total = actors.len();
        let stale = actors
            .values()
            .filter(|actor| !actor.local && Self::age(actor) >= self.stale_after)
            .count();

        ActorStoreStats {
            total_entries: total,
            stale_entries: stale,
        }
    }

    /// Prune expired entries
    ///
    /// Local actors are never pruned. Should be called periodically.
    pub async fn prune_expired(&self) {
        let mut actors = self.actors.write().await;
        let mut key_index = self.key_index.write().await;
        let before = actors.len();
        actors.retain(|_, actor| actor.local || Self::age(actor) < self.ttl);
        key_index.retain(|_, uri| actors.contains_key(uri));
        let removed = before - actors.len();

        crate::metrics::ACTOR_CACHE_SIZE.set(actors.len() as i64);
        if removed > 0 {
            tracing::info!("Pruned {} expired actor cache entries", removed);
        }
    }
}

#[async_trait]
impl ActorStore for InMemoryActorStore {
    async fn find_by_uri(&self, uri: &str) -> Result<Option<Actor>, AppError> {
        let actors = self.actors.read().await;
        let found = match actors.get(uri) {
            Some(actor) => Some(actor.clone()),
            None => {
                let key_index = self.key_index.read().await;
                key_index
                    .get(uri)
                    .and_then(|actor_uri| actors.get(actor_uri))
                    .cloned()
            }
        };

        match &found {
            Some(_) => tracing::debug!("Actor cache hit for {}", uri),
            None => tracing::debug!("Actor cache miss for {}", uri),
        }
        Ok(found.map(|actor| self.with_staleness(actor)))
    }

    async fn find_by_handle(
        &self,
        username: &str,
        domain: Option<String>,
    ) -> Result<Option<Actor>, AppError> {
        let actors = self.actors.read().await;
        let found = actors
            .values()
            .find(|actor| {
                actor.username.eq_ignore_ascii_case(username)
                    && match (&actor.domain, &domain) {
                        (None, None) => true,
                        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                        _ => false,
                    }
            })
            .cloned();

        Ok(found.map(|actor| self.with_staleness(actor)))
    }

    async fn upsert(&self, actor: Actor) -> Result<(), AppError> {
        let mut actors = self.actors.write().await;
        let mut key_index = self.key_index.write().await;

        if let Some(holder) = key_index.get(&actor.key_id) {
            if holder != &actor.uri && actors.contains_key(holder) {
                tracing::warn!(
                    actor = %actor.uri,
                    key_id = %actor.key_id,
                    holder = %holder,
                    "Refusing to reassign key held by another actor"
                );
                return Err(AppError::Validation(format!(
                    "Key {} already belongs to {}",
                    actor.key_id, holder
                )));
            }
        }

        if let Some(previous) = actors.get(&actor.uri) {
            if previous.key_id != actor.key_id {
                key_index.remove(&previous.key_id);
            }
        }
        key_index.insert(actor.key_id.clone(), actor.uri.clone());
        tracing::debug!(actor = %actor.uri, key_id = %actor.key_id, "Cached actor");
        actors.insert(actor.uri.clone(), actor);

        crate::metrics::ACTOR_CACHE_SIZE.set(actors.len() as i64);
        Ok(())
    }
}

/// Actor store statistics
#[derive(Debug, Clone)]
pub struct ActorStoreStats {
    /// Total number of entries
    pub total_entries: usize,
    /// Remote entries old enough to be flagged possibly stale
    pub stale_entries: usize,
}
