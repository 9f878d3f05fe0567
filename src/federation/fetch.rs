//! Remote actor and key fetching
//!
//! `ActivityPubClient` is the single place outbound GETs happen. It guards
//! against requests into private networks, optionally signs fetches with the
//! instance key (authorized fetch), and classifies failures so the circuit
//! breaker can tell a down origin from a broken document.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use axum::async_trait;
use chrono::Utc;
use http::header::ACCEPT;
use serde_json::Value;
use thiserror::Error;

use super::actor::{Actor, ActorStore};
use super::domain::extract_domain;
use super::signature::{sign_request, strip_fragment};
use crate::error::{AppError, VerificationError};
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

/// Media type requested for ActivityPub documents.
pub const ACTIVITY_JSON: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

const ACTOR_TYPES: [&str; 5] = ["Person", "Service", "Application", "Group", "Organization"];

/// Failure of an outbound fetch
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport or TLS failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Outbound request timed out")]
    Timeout,

    /// DNS resolution failed or returned nothing
    #[error("Host unreachable: {0}")]
    Unreachable(String),

    #[error("Unexpected response status {0}")]
    UnexpectedStatus(u16),

    /// The remote answered with something unusable
    #[error("{0}")]
    InvalidDocument(String),

    #[error("Requests to private network addresses are disallowed (tried {0})")]
    PrivateNetwork(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl FetchError {
    /// Whether this failure says the origin is unreachable right now.
    pub fn is_breaker_failure(&self) -> bool {
        match self {
            FetchError::Http(error) => !error.is_builder() && !error.is_decode(),
            FetchError::Timeout | FetchError::Unreachable(_) => true,
            FetchError::UnexpectedStatus(status) => *status >= 500,
            FetchError::InvalidDocument(_)
            | FetchError::PrivateNetwork(_)
            | FetchError::Internal(_) => false,
        }
    }
}

impl From<FetchError> for AppError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::InvalidDocument(_) | FetchError::PrivateNetwork(_) => {
                AppError::Signature(VerificationError::KeyResolution(error.to_string()))
            }
            FetchError::Http(error) => AppError::HttpClient(error),
            FetchError::Internal(error) => AppError::Internal(error),
            FetchError::Timeout | FetchError::Unreachable(_) | FetchError::UnexpectedStatus(_) => {
                AppError::Federation(error.to_string())
            }
        }
    }
}

/// Dereferences remote keys and actors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteKeyFetcher: Send + Sync {
    /// Fetch the actor owning `key_id`. With `id_required` the served
    /// document must carry the id it was requested under.
    async fn fetch_key(&self, key_id: &str, id_required: bool)
    -> Result<Option<Actor>, FetchError>;

    /// Refetch the whole actor record.
    async fn refresh_actor(&self, actor: &Actor) -> Result<Option<Actor>, FetchError>;

    /// Refetch only the key material of an actor.
    async fn fetch_actor_key(&self, actor_uri: &str) -> Result<Option<Actor>, FetchError>;
}

/// WebFinger-style account discovery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountResolver: Send + Sync {
    /// Resolve `user@domain` to an actor.
    async fn resolve(&self, handle: &str) -> Result<Option<Actor>, FetchError>;
}

/// Key used to sign outbound fetches
#[derive(Clone)]
pub struct FetchSigner {
    pub key_id: String,
    pub private_key_pem: String,
}

impl FetchSigner {
    /// Load the instance private key from a PKCS#8 PEM file.
    pub fn load(key_id: &str, private_key_path: &Path) -> Result<Self, AppError> {
        let private_key_pem = std::fs::read_to_string(private_key_path).map_err(|e| {
            AppError::Config(format!(
                "Failed to read instance private key {}: {}",
                private_key_path.display(),
                e
            ))
        })?;

        Ok(Self {
            key_id: key_id.to_string(),
            private_key_pem,
        })
    }
}

impl std::fmt::Debug for FetchSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), FetchError> {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();

    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| FetchError::Unreachable(format!("{}: {}", host, e)))?;

    let mut resolved_any = false;
    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(FetchError::PrivateNetwork(host.to_string()));
        }
    }

    if !resolved_any {
        return Err(FetchError::Unreachable(format!("No DNS records for {}", host)));
    }

    Ok(())
}

/// Outbound HTTP client for ActivityPub documents
pub struct ActivityPubClient {
    http: reqwest::Client,
    allow_private_networks: bool,
    signer: Option<FetchSigner>,
}

impl ActivityPubClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            allow_private_networks: false,
            signer: None,
        }
    }

    pub fn allow_private_networks(mut self, allow: bool) -> Self {
        self.allow_private_networks = allow;
        self
    }

    pub fn with_signer(mut self, signer: Option<FetchSigner>) -> Self {
        self.signer = signer;
        self
    }

    /// Validate a fetch target
    ///
    /// Rejects non-HTTP(S) URLs and hosts that are, or resolve to, private
    /// addresses. The fragment is dropped.
    async fn check_target(&self, url: &str) -> Result<url::Url, FetchError> {
        let parsed = url::Url::parse(strip_fragment(url))
            .map_err(|e| FetchError::InvalidDocument(format!("Invalid URL {}: {}", url, e)))?;

        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(FetchError::InvalidDocument(format!(
                    "Unsupported URL scheme: {}",
                    scheme
                )));
            }
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| FetchError::InvalidDocument(format!("Missing host in URL {}", url)))?
            .to_ascii_lowercase();

        if self.allow_private_networks {
            return Ok(parsed);
        }

        if is_disallowed_host(&host) {
            return Err(FetchError::PrivateNetwork(host));
        }

        let port = parsed.port_or_known_default().unwrap_or(443);
        validate_resolved_host_ips(&host, port).await?;

        Ok(parsed)
    }

    /// GET a JSON document.
    ///
    /// # Returns
    /// `None` for 4xx answers (gone, not found, unauthorized fetch).
    ///
    /// # Errors
    /// 5xx answers are `UnexpectedStatus`; bodies that are not JSON are
    /// `InvalidDocument`.
    pub async fn get_json(&self, url: &str, accept: &str) -> Result<Option<Value>, FetchError> {
        let target = self.check_target(url).await?;
        let _timer = FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .start_timer();

        let mut request = self.http.get(target.as_str()).header(ACCEPT, accept);
        if let Some(signer) = &self.signer {
            let signed = sign_request(
                "GET",
                target.as_str(),
                None,
                &signer.private_key_pem,
                &signer.key_id,
            )
            .map_err(|e| FetchError::Internal(e.into()))?;
            request = request
                .header("date", signed.date)
                .header("signature", signed.signature);
        }

        let response = request.send().await?;
        let status = response.status();
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["outbound", status.as_str()])
            .inc();

        if status.is_server_error() {
            return Err(FetchError::UnexpectedStatus(status.as_u16()));
        }
        if !status.is_success() {
            tracing::debug!(url = %target, status = %status, "Remote document unavailable");
            return Ok(None);
        }

        let body = response.bytes().await?;
        let document = serde_json::from_slice(&body).map_err(|e| {
            FetchError::InvalidDocument(format!("Failed to parse document from {}: {}", target, e))
        })?;

        Ok(Some(document))
    }
}

fn has_type(document: &Value, candidates: &[&str]) -> bool {
    match document.get("type") {
        Some(Value::String(kind)) => candidates.contains(&kind.as_str()),
        Some(Value::Array(kinds)) => kinds
            .iter()
            .filter_map(Value::as_str)
            .any(|kind| candidates.contains(&kind)),
        _ => false,
    }
}

/// Whether a document describes an actor.
pub fn is_actor_document(document: &Value) -> bool {
    has_type(document, &ACTOR_TYPES) || document.get("inbox").is_some()
}

/// Whether a document is a bare public key (`owner` + `publicKeyPem`).
pub fn is_key_document(document: &Value) -> bool {
    document.get("publicKeyPem").is_some() && document.get("owner").is_some()
}

/// Whether two URLs share scheme, host and port.
pub fn same_origin(a: &str, b: &str) -> bool {
    match (url::Url::parse(a), url::Url::parse(b)) {
        (Ok(a), Ok(b)) => a.origin() == b.origin(),
        _ => false,
    }
}

/// Extract the fields the verifier needs from an actor document.
///
/// The advertised key must live on the actor's own origin.
pub fn parse_actor_document(document: &Value) -> Result<Actor, FetchError> {
    let uri = document
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| FetchError::InvalidDocument("Missing id in actor".to_string()))?;

    let username = document
        .get("preferredUsername")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            FetchError::InvalidDocument(format!("Missing preferredUsername in actor {}", uri))
        })?;

    let owned_by_actor = |key: &&Value| {
        key.get("publicKeyPem").is_some()
            && key
                .get("owner")
                .and_then(Value::as_str)
                .is_none_or(|owner| owner == uri)
    };
    let public_key = match document.get("publicKey") {
        Some(Value::Array(keys)) => keys.iter().find(owned_by_actor),
        Some(key) => Some(key).filter(owned_by_actor),
        None => None,
    }
    .ok_or_else(|| FetchError::InvalidDocument(format!("Missing publicKey in actor {}", uri)))?;

    let key_id = public_key
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| FetchError::InvalidDocument("Missing publicKey.id in actor".to_string()))?;
    if !same_origin(key_id, uri) {
        return Err(FetchError::InvalidDocument(format!(
            "Actor {} advertises key {} from another origin",
            uri, key_id
        )));
    }
    let public_key_pem = public_key
        .get("publicKeyPem")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            FetchError::InvalidDocument("Missing publicKeyPem in actor".to_string())
        })?;

    Ok(Actor {
        uri: uri.to_string(),
        username: username.to_string(),
        domain: Some(extract_domain(uri)),
        key_id: key_id.to_string(),
        public_key_pem: public_key_pem.to_string(),
        possibly_stale: false,
        local: false,
        fetched_at: Utc::now(),
    })
}

/// Map actor store failures; a refused write means the document was unusable.
pub(crate) fn store_error(error: AppError) -> FetchError {
    match error {
        AppError::Validation(message) => FetchError::InvalidDocument(message),
        other => FetchError::Internal(anyhow::Error::new(other)),
    }
}

/// `RemoteKeyFetcher` over HTTP that caches results in an `ActorStore`.
pub struct HttpKeyFetcher {
    client: Arc<ActivityPubClient>,
    store: Arc<dyn ActorStore>,
}

impl HttpKeyFetcher {
    pub fn new(client: Arc<ActivityPubClient>, store: Arc<dyn ActorStore>) -> Self {
        Self { client, store }
    }

    async fn fetch_actor_document(&self, actor_uri: &str) -> Result<Option<Actor>, FetchError> {
        let Some(document) = self.client.get_json(actor_uri, ACTIVITY_JSON).await? else {
            return Ok(None);
        };

        let actor = parse_actor_document(&document)?;
        if actor.uri != strip_fragment(actor_uri) {
            return Err(FetchError::InvalidDocument(format!(
                "Actor document id {} does not match {}",
                actor.uri, actor_uri
            )));
        }

        Ok(Some(actor))
    }
}

#[async_trait]
impl RemoteKeyFetcher for HttpKeyFetcher {
    async fn fetch_key(
        &self,
        key_id: &str,
        id_required: bool,
    ) -> Result<Option<Actor>, FetchError> {
        let document_uri = strip_fragment(key_id);
        let Some(document) = self.client.get_json(document_uri, ACTIVITY_JSON).await? else {
            return Ok(None);
        };

        if id_required {
            let served_id = document.get("id").and_then(Value::as_str).map(strip_fragment);
            if served_id != Some(document_uri) {
                return Err(FetchError::InvalidDocument(format!(
                    "Fetched document id does not match {}",
                    key_id
                )));
            }
        }

        let actor = if is_actor_document(&document) {
            let actor = parse_actor_document(&document)?;
            if key_id.contains('#') && actor.key_id != key_id {
                return Err(FetchError::InvalidDocument(
                    "Signature keyId does not match actor public key id".to_string(),
                ));
            }
            // a bare actor URI only vouches for keys declared in its own document
            if actor.key_id != key_id && strip_fragment(&actor.key_id) != actor.uri {
                return Err(FetchError::InvalidDocument(format!(
                    "Actor {} advertises key {} outside its own document",
                    actor.uri, actor.key_id
                )));
            }
            actor
        } else if is_key_document(&document) {
            let owner = document
                .get("owner")
                .and_then(Value::as_str)
                .ok_or_else(|| FetchError::InvalidDocument("Missing key owner".to_string()))?;
            let Some(actor) = self.fetch_actor_document(owner).await? else {
                return Ok(None);
            };

            let advertised = document.get("id").and_then(Value::as_str).unwrap_or(key_id);
            if actor.key_id != advertised {
                return Err(FetchError::InvalidDocument(format!(
                    "Key owner {} does not advertise key {}",
                    actor.uri, advertised
                )));
            }
            actor
        } else {
            return Err(FetchError::InvalidDocument(format!(
                "Document at {} is neither an actor nor a public key",
                key_id
            )));
        };

        self.store.upsert(actor.clone()).await.map_err(store_error)?;
        tracing::debug!(key_id = %key_id, actor = %actor.uri, "Fetched remote key");
        Ok(Some(actor))
    }

    async fn refresh_actor(&self, actor: &Actor) -> Result<Option<Actor>, FetchError> {
        let Some(refreshed) = self.fetch_actor_document(&actor.uri).await? else {
            return Ok(None);
        };

        self.store
            .upsert(refreshed.clone())
            .await
            .map_err(store_error)?;
        tracing::debug!(actor = %actor.uri, "Refreshed remote actor");
        Ok(Some(refreshed))
    }

    async fn fetch_actor_key(&self, actor_uri: &str) -> Result<Option<Actor>, FetchError> {
        let Some(fetched) = self.fetch_actor_document(actor_uri).await? else {
            return Ok(None);
        };

        let updated = match self.store.find_by_uri(actor_uri).await.map_err(store_error)? {
            Some(mut existing) => {
                existing.key_id = fetched.key_id;
                existing.public_key_pem = fetched.public_key_pem;
                existing
            }
            None => fetched,
        };

        self.store
            .upsert(updated.clone())
            .await
            .map_err(store_error)?;
        tracing::debug!(actor = %actor_uri, key_id = %updated.key_id, "Refetched actor key");
        Ok(Some(updated))
    }
}
