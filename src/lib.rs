//! Keygate - inbound HTTP Signature verification for ActivityPub federation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - POST /inbox, POST /users/:username/inbox                 │
//! │  - /health, /metrics                                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Signature Verifier                        │
//! │  - Header parsing, signed-string rebuild, RSA-SHA256        │
//! │  - One key refresh on mismatch                              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Key Resolution                          │
//! │  - Actor cache                                              │
//! │  - Remote key fetch / WebFinger behind a circuit breaker    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: HTTP Signatures, key resolution and remote fetching
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus metrics

pub mod api;
pub mod config;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;

use federation::{
    AccountResolver, ActivityPubClient, CircuitBreaker, DomainPolicy, FetchSigner,
    HttpKeyFetcher, InMemoryActorStore, KeyResolver, RemoteKeyFetcher, SignatureVerifier,
    WebFingerResolver,
};

/// Maximum accepted size of an inbox delivery
pub const MAX_INBOX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Known actors and their keys
    pub actor_store: Arc<InMemoryActorStore>,

    /// Breaker for fetches made on behalf of remote peers
    pub breaker: Arc<CircuitBreaker>,

    pub verifier: Arc<SignatureVerifier>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Build the outbound HTTP client
    /// 2. Load the instance signing key, if configured
    /// 3. Wire the actor store, fetchers and verifier
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built or the signing key
    /// cannot be read
    pub fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let http_client = reqwest::Client::builder()
            .user_agent(config.http.user_agent.clone())
            .timeout(std::time::Duration::from_secs(config.http.timeout_seconds))
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;

        let signer = match (
            &config.federation.instance_key_id,
            &config.federation.instance_private_key_path,
        ) {
            (Some(key_id), Some(path)) => {
                let signer = FetchSigner::load(key_id, path)?;
                tracing::info!(key_id = %key_id, "Outbound fetches will be signed");
                Some(signer)
            }
            _ => None,
        };

        let client = Arc::new(
            ActivityPubClient::new(http_client)
                .allow_private_networks(config.federation.allow_private_networks)
                .with_signer(signer),
        );
        let actor_store = Arc::new(InMemoryActorStore::new(
            Some(config.federation.actor_stale_after()),
            Some(config.federation.actor_cache_ttl()),
        ));
        let fetcher = Arc::new(HttpKeyFetcher::new(client.clone(), actor_store.clone()));
        let accounts = Arc::new(WebFingerResolver::new(
            client,
            actor_store.clone(),
            config.server.domain.clone(),
        ));

        let state = Self::from_parts(config, actor_store, accounts, fetcher);
        tracing::info!("Application state initialized successfully");
        Ok(state)
    }

    /// Assemble state around caller-provided fetch services.
    pub fn from_parts(
        config: config::AppConfig,
        actor_store: Arc<InMemoryActorStore>,
        accounts: Arc<dyn AccountResolver>,
        fetcher: Arc<dyn RemoteKeyFetcher>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::from_config(&config.circuit_breaker));
        let domain_policy = Arc::new(DomainPolicy::from_config(&config.federation));
        let resolver = Arc::new(KeyResolver::new(
            actor_store.clone(),
            accounts,
            fetcher,
            domain_policy,
            breaker.clone(),
            config.server.base_url(),
        ));
        let verifier = Arc::new(SignatureVerifier::new(
            resolver,
            config.federation.signature_window(),
        ));

        Self {
            config: Arc::new(config),
            actor_store,
            breaker,
            verifier,
        }
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`; the inbox needs
/// the peer address.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::inbox_router())
        .merge(api::metrics_router())
        .layer(RequestBodyLimitLayer::new(MAX_INBOX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
