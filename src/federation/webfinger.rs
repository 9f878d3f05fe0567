//! WebFinger protocol implementation
//!
//! Used to discover ActivityPub actor URIs from `user@domain` addresses,
//! which is how `acct:` keyIds are resolved.

use std::sync::Arc;

use axum::async_trait;
use serde::{Deserialize, Serialize};

use super::actor::{Actor, ActorStore};
use super::fetch::{
    ACTIVITY_JSON, AccountResolver, ActivityPubClient, FetchError, parse_actor_document,
    store_error,
};
use super::signature::strip_fragment;

const JRD_JSON: &str = "application/jrd+json, application/json";

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl WebFingerResponse {
    /// href of the ActivityPub `self` link, if advertised.
    pub fn actor_uri(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|link| {
                link.rel == "self"
                    && link.link_type.as_deref().is_some_and(|kind| {
                        kind.starts_with("application/activity+json")
                            || kind.starts_with("application/ld+json")
                    })
            })
            .and_then(|link| link.href.as_deref())
    }
}

/// Split `user@domain` (optionally prefixed with `acct:` or `@`).
pub fn split_handle(handle: &str) -> Option<(&str, &str)> {
    let handle = handle.trim();
    let handle = handle.strip_prefix("acct:").unwrap_or(handle);
    let handle = handle.strip_prefix('@').unwrap_or(handle);
    let (username, domain) = handle.rsplit_once('@')?;
    if username.is_empty() || domain.is_empty() {
        return None;
    }
    Some((username, domain))
}

/// WebFinger lookup URL for an account on `domain`.
pub fn webfinger_url(scheme: &str, username: &str, domain: &str) -> String {
    let resource = format!("acct:{}@{}", username, domain);
    format!(
        "{}://{}/.well-known/webfinger?resource={}",
        scheme,
        domain,
        urlencoding::encode(&resource)
    )
}

/// Resolves accounts through WebFinger and caches them in the actor store.
///
/// An actor is only accepted when the document at the `self` link carries
/// that link as its id, and when it lives on another domain than the handle,
/// that domain's own WebFinger must point back at it.
pub struct WebFingerResolver {
    client: Arc<ActivityPubClient>,
    store: Arc<dyn ActorStore>,
    local_domain: String,
    /// Scheme used to reach remote WebFinger endpoints
    scheme: String,
}

impl WebFingerResolver {
    pub fn new(
        client: Arc<ActivityPubClient>,
        store: Arc<dyn ActorStore>,
        local_domain: impl Into<String>,
    ) -> Self {
        Self {
            client,
            store,
            local_domain: local_domain.into(),
            scheme: "https".to_string(),
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    async fn lookup(
        &self,
        username: &str,
        domain: &str,
    ) -> Result<Option<WebFingerResponse>, FetchError> {
        let Some(document) = self
            .client
            .get_json(&webfinger_url(&self.scheme, username, domain), JRD_JSON)
            .await?
        else {
            return Ok(None);
        };

        serde_json::from_value(document).map(Some).map_err(|e| {
            FetchError::InvalidDocument(format!(
                "Invalid WebFinger response for {}@{}: {}",
                username, domain, e
            ))
        })
    }

    /// Confirm that `actor`'s own domain maps its handle back to it.
    async fn confirm_canonical(&self, actor: &Actor) -> Result<bool, FetchError> {
        let Some(domain) = actor.domain.as_deref() else {
            return Ok(false);
        };
        let confirmed = self
            .lookup(&actor.username, domain)
            .await?
            .is_some_and(|jrd| jrd.actor_uri() == Some(actor.uri.as_str()));
        Ok(confirmed)
    }
}

#[async_trait]
impl AccountResolver for WebFingerResolver {
    async fn resolve(&self, handle: &str) -> Result<Option<Actor>, FetchError> {
        let (username, domain) = split_handle(handle)
            .ok_or_else(|| FetchError::InvalidDocument(format!("Invalid account handle: {}", handle)))?;

        if domain.eq_ignore_ascii_case(&self.local_domain) {
            return self
                .store
                .find_by_handle(username, None)
                .await
                .map_err(store_error);
        }

        if let Some(actor) = self
            .store
            .find_by_handle(username, Some(domain.to_ascii_lowercase()))
            .await
            .map_err(store_error)?
        {
            if !actor.possibly_stale {
                return Ok(Some(actor));
            }
        }

        let Some(jrd) = self.lookup(username, domain).await? else {
            return Ok(None);
        };
        let actor_uri = jrd.actor_uri().ok_or_else(|| {
            FetchError::InvalidDocument(format!("No ActivityPub actor link for {}", handle))
        })?;

        let Some(document) = self.client.get_json(actor_uri, ACTIVITY_JSON).await? else {
            return Ok(None);
        };
        let actor = parse_actor_document(&document)?;
        if actor.uri != strip_fragment(actor_uri) {
            return Err(FetchError::InvalidDocument(format!(
                "WebFinger for {} links {} but the document is {}",
                handle, actor_uri, actor.uri
            )));
        }
        if !actor.username.eq_ignore_ascii_case(username) {
            return Err(FetchError::InvalidDocument(format!(
                "WebFinger for {} points at {}",
                handle,
                actor.log_identifier()
            )));
        }

        let same_domain = actor
            .domain
            .as_deref()
            .is_some_and(|actor_domain| actor_domain.eq_ignore_ascii_case(domain));
        if !same_domain && !self.confirm_canonical(&actor).await? {
            return Err(FetchError::InvalidDocument(format!(
                "{} does not confirm {} as {}",
                actor.domain.as_deref().unwrap_or("unknown domain"),
                actor.uri,
                handle
            )));
        }

        self.store
            .upsert(actor.clone())
            .await
            .map_err(store_error)?;
        tracing::debug!(handle = %handle, actor = %actor.uri, "Resolved account via WebFinger");
        Ok(Some(actor))
    }
}
