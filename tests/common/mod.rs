//! Common test utilities for E2E tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::async_trait;
use chrono::Utc;
use http::{HeaderMap, HeaderValue};
use keygate::federation::{
    AccountResolver, Actor, FetchError, InMemoryActorStore, RemoteKeyFetcher, build_signed_string,
    format_http_date, generate_digest, sign_string,
};
use keygate::{AppState, config};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

pub const REMOTE_ACTOR: &str = "https://remote.example/users/alice";
pub const REMOTE_KEY_ID: &str = "https://remote.example/users/alice#main-key";

/// Create test configuration
pub fn test_config() -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Let OS assign port
            domain: "test.example.com".to_string(),
            protocol: "https".to_string(),
        },
        federation: config::FederationConfig {
            signature_window_seconds: 43_200,
            blocked_domains: vec!["blocked.example".to_string()],
            allowed_domains: None,
            allow_private_networks: true,
            actor_stale_after_seconds: 86_400,
            actor_cache_ttl_seconds: 604_800,
            instance_key_id: None,
            instance_private_key_path: None,
        },
        circuit_breaker: config::CircuitBreakerConfig {
            failure_threshold: 1,
            cool_off_seconds: 300,
            failure_window_seconds: 300,
            call_timeout_seconds: 5,
            max_tracked_keys: 1_000,
        },
        http: config::HttpClientConfig {
            user_agent: "Keygate/test".to_string(),
            timeout_seconds: 5,
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// RSA keypair in PEM form
#[derive(Clone)]
pub struct Keypair {
    pub private_pem: String,
    pub public_pem: String,
}

impl Keypair {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let private_key = rsa::RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public_key = rsa::RsaPublicKey::from(&private_key);
        Self {
            private_pem: private_key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string(),
            public_pem: public_key.to_public_key_pem(LineEnding::LF).unwrap(),
        }
    }
}

/// Remote actor record carrying `public_pem`
pub fn remote_actor(public_pem: &str) -> Actor {
    Actor {
        uri: REMOTE_ACTOR.to_string(),
        username: "alice".to_string(),
        domain: Some("remote.example".to_string()),
        key_id: REMOTE_KEY_ID.to_string(),
        public_key_pem: public_pem.to_string(),
        possibly_stale: false,
        local: false,
        fetched_at: Utc::now(),
    }
}

/// ActivityPub actor document for `uri` advertising `public_pem`
pub fn actor_document(uri: &str, username: &str, public_pem: &str) -> Value {
    json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": uri,
        "type": "Person",
        "preferredUsername": username,
        "inbox": format!("{}/inbox", uri),
        "publicKey": {
            "id": format!("{}#main-key", uri),
            "owner": uri,
            "publicKeyPem": public_pem
        }
    })
}

/// Sign a POST delivery covering `(request-target) host date digest`.
pub fn sign_delivery(
    keypair: &Keypair,
    key_id: &str,
    host: &str,
    path: &str,
    body: &[u8],
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("host", HeaderValue::from_str(host).unwrap());
    headers.insert(
        "date",
        HeaderValue::from_str(&format_http_date(Utc::now())).unwrap(),
    );
    headers.insert(
        "digest",
        HeaderValue::from_str(&generate_digest(body)).unwrap(),
    );
    headers.insert(
        "content-type",
        HeaderValue::from_static("application/activity+json"),
    );

    let signed_headers: Vec<String> = ["(request-target)", "host", "date", "digest"]
        .iter()
        .map(|name| name.to_string())
        .collect();
    let signed_string = build_signed_string(&signed_headers, "POST", path, &headers, body);
    let signature = sign_string(&keypair.private_pem, &signed_string).unwrap();

    headers.insert(
        "signature",
        HeaderValue::from_str(&format!(
            "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
            key_id,
            signed_headers.join(" "),
            signature
        ))
        .unwrap(),
    );
    headers
}

/// `RemoteKeyFetcher` serving fixed actors and counting calls
#[derive(Default)]
pub struct CountingKeyFetcher {
    actors: RwLock<HashMap<String, Actor>>,
    /// When set, every call fails with this status
    pub failing_status: RwLock<Option<u16>>,
    pub fetch_key_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub key_refresh_calls: AtomicUsize,
}

impl CountingKeyFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `actor` from now on (models a remote key rotation).
    pub async fn serve(&self, actor: Actor) {
        self.actors.write().await.insert(actor.uri.clone(), actor);
    }

    pub async fn fail_with(&self, status: u16) {
        *self.failing_status.write().await = Some(status);
    }

    async fn lookup(&self, uri: &str) -> Result<Option<Actor>, FetchError> {
        if let Some(status) = *self.failing_status.read().await {
            return Err(FetchError::UnexpectedStatus(status));
        }
        let actor_uri = uri.split('#').next().unwrap_or(uri);
        Ok(self.actors.read().await.get(actor_uri).cloned())
    }

    pub fn total_calls(&self) -> usize {
        self.fetch_key_calls.load(Ordering::SeqCst)
            + self.refresh_calls.load(Ordering::SeqCst)
            + self.key_refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteKeyFetcher for CountingKeyFetcher {
    async fn fetch_key(
        &self,
        key_id: &str,
        _id_required: bool,
    ) -> Result<Option<Actor>, FetchError> {
        self.fetch_key_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup(key_id).await
    }

    async fn refresh_actor(&self, actor: &Actor) -> Result<Option<Actor>, FetchError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup(&actor.uri).await
    }

    async fn fetch_actor_key(&self, actor_uri: &str) -> Result<Option<Actor>, FetchError> {
        self.key_refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup(actor_uri).await
    }
}

/// `AccountResolver` serving fixed handles and counting calls
#[derive(Default)]
pub struct CountingAccountResolver {
    accounts: RwLock<HashMap<String, Actor>>,
    pub calls: AtomicUsize,
}

impl CountingAccountResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn serve(&self, handle: &str, actor: Actor) {
        self.accounts.write().await.insert(handle.to_string(), actor);
    }
}

#[async_trait]
impl AccountResolver for CountingAccountResolver {
    async fn resolve(&self, handle: &str) -> Result<Option<Actor>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.accounts.read().await.get(handle).cloned())
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub fetcher: Arc<CountingKeyFetcher>,
    pub accounts: Arc<CountingAccountResolver>,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance backed by counting fakes
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: config::AppConfig) -> Self {
        let fetcher = Arc::new(CountingKeyFetcher::new());
        let accounts = Arc::new(CountingAccountResolver::new());
        let actor_store = Arc::new(InMemoryActorStore::new(
            Some(config.federation.actor_stale_after()),
            Some(config.federation.actor_cache_ttl()),
        ));

        let state = AppState::from_parts(
            config,
            actor_store,
            accounts.clone(),
            fetcher.clone(),
        );

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = keygate::build_router(state.clone());

        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            addr,
            state,
            fetcher,
            accounts,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Host header value clients send to this server
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    /// POST a delivery signed by `keypair` under `key_id`
    pub async fn deliver(
        &self,
        path: &str,
        keypair: &Keypair,
        key_id: &str,
        activity: &Value,
    ) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        let headers = sign_delivery(keypair, key_id, &self.host(), path, &body);

        self.client
            .post(self.url(path))
            .headers(headers)
            .body(body)
            .send()
            .await
            .unwrap()
    }
}

/// Remote ActivityPub origin serving documents from a mutable map
#[derive(Clone, Default)]
pub struct FakeRemote {
    pub base_url: String,
    documents: Arc<RwLock<HashMap<String, (u16, Value)>>>,
    pub hits: Arc<AtomicUsize>,
}

impl FakeRemote {
    pub async fn start() -> Self {
        use axum::{
            Json, Router,
            extract::{Request, State},
            http::StatusCode,
            response::IntoResponse,
        };

        async fn serve_document(
            State(remote): State<FakeRemote>,
            request: Request,
        ) -> axum::response::Response {
            remote.hits.fetch_add(1, Ordering::SeqCst);
            let path = request.uri().path().to_string();
            match remote.documents.read().await.get(&path) {
                Some((status, document)) => {
                    (StatusCode::from_u16(*status).unwrap(), Json(document.clone())).into_response()
                }
                None => StatusCode::NOT_FOUND.into_response(),
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let remote = FakeRemote {
            base_url: format!("http://{}", addr),
            ..Default::default()
        };

        let app = Router::new()
            .fallback(serve_document)
            .with_state(remote.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        remote
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `host:port` this origin answers on, as it appears in handles
    pub fn host(&self) -> String {
        self.base_url.trim_start_matches("http://").to_string()
    }

    /// Serve a WebFinger answer linking `actor_uri` as the ActivityPub actor
    pub async fn put_webfinger(&self, subject: &str, actor_uri: &str) {
        self.put(
            "/.well-known/webfinger",
            json!({
                "subject": subject,
                "links": [
                    {"rel": "self", "type": "application/activity+json", "href": actor_uri}
                ]
            }),
        )
        .await;
    }

    /// Serve `document` with `200` at `path`
    pub async fn put(&self, path: &str, document: Value) {
        self.put_with_status(path, 200, document).await;
    }

    pub async fn put_with_status(&self, path: &str, status: u16, document: Value) {
        self.documents
            .write()
            .await
            .insert(path.to_string(), (status, document));
    }

    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}
