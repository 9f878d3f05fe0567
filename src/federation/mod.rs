//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures (parsing, signed strings, RSA-SHA256)
//! - Signer key resolution (actor cache, remote fetch, WebFinger)
//! - Domain allow/block policy
//! - Circuit breaking for outbound calls
//! - Inbound request verification

mod actor;
mod circuit_breaker;
mod domain;
mod fetch;
mod key_resolver;
mod signature;
mod verifier;
mod webfinger;

pub use actor::{Actor, ActorStore, ActorStoreStats, InMemoryActorStore};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerStats, CircuitState, source_breaker_name,
};
pub use domain::{DomainGate, DomainPolicy, extract_domain, key_id_domain};
pub use fetch::{
    ACTIVITY_JSON, AccountResolver, ActivityPubClient, FetchError, FetchSigner, HttpKeyFetcher,
    RemoteKeyFetcher, is_actor_document, is_key_document, parse_actor_document, same_origin,
};
pub use key_resolver::{KeyResolver, RefreshStrategy};
pub use signature::{
    REQUEST_TARGET, SignatureHeaders, SignatureParameters, build_signed_string,
    canonical_header_name, extract_signature_key_id, format_http_date, generate_digest,
    key_id_matches_actor, parse_http_date, parse_signature_params, sign_request, sign_string,
    verify_rsa_sha256,
};
pub use verifier::{
    Clock, SignatureVerifier, SignedRequest, SignedRequestContext, SystemClock,
    VerificationOutcome,
};
pub use webfinger::{
    WebFingerLink, WebFingerResponse, WebFingerResolver, split_handle, webfinger_url,
};
