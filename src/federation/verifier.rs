//! Inbound signature verification
//!
//! `SignatureVerifier::verify` walks a signed request through the checks in
//! order (header present, date window, parameters well formed, algorithm
//! supported, key resolved, signature matches) and refetches the signer's
//! key once when the cryptographic check fails. `SignedRequestContext` wraps
//! one inbound request and memoizes the outcome.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use tokio::sync::OnceCell;

use super::actor::Actor;
use super::circuit_breaker::source_breaker_name;
use super::key_resolver::KeyResolver;
use super::signature::{
    SignatureParameters, build_signed_string, parse_http_date, parse_signature_params,
    verify_rsa_sha256,
};
use crate::error::{AppError, VerificationError};
use crate::metrics::SIGNATURE_VERIFICATIONS_TOTAL;

const SUPPORTED_ALGORITHMS: [&str; 2] = ["rsa-sha256", "hs2019"];

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// The parts of an inbound request a signature can cover.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub method: String,
    /// Path plus query, as received
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl SignedRequest {
    pub fn is_signed(&self) -> bool {
        self.headers.contains_key("signature")
    }

    fn signature_parameters(&self) -> Option<SignatureParameters> {
        let raw = self.headers.get("signature")?;
        Some(parse_signature_params(&String::from_utf8_lossy(
            raw.as_bytes(),
        )))
    }
}

/// Result of verifying one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Authenticated(Actor),
    Rejected(VerificationError),
}

impl VerificationOutcome {
    pub fn actor(&self) -> Option<&Actor> {
        match self {
            VerificationOutcome::Authenticated(actor) => Some(actor),
            VerificationOutcome::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&VerificationError> {
        match self {
            VerificationOutcome::Authenticated(_) => None,
            VerificationOutcome::Rejected(reason) => Some(reason),
        }
    }
}

pub struct SignatureVerifier {
    resolver: Arc<KeyResolver>,
    clock: Arc<dyn Clock>,
    window: chrono::Duration,
}

impl SignatureVerifier {
    /// Create a verifier accepting dates within `window` of now.
    pub fn new(resolver: Arc<KeyResolver>, window: Duration) -> Self {
        Self {
            resolver,
            clock: Arc::new(SystemClock),
            window: chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::hours(12)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Verify a signed request.
    ///
    /// Rejections are `Ok(Rejected(..))`. `Err` is reserved for failures
    /// that are not the signer's fault (store errors, bugs).
    pub async fn verify(
        &self,
        request: &SignedRequest,
        breaker_name: &str,
    ) -> Result<VerificationOutcome, AppError> {
        match self.authenticate(request, breaker_name).await {
            Ok(actor) => {
                SIGNATURE_VERIFICATIONS_TOTAL
                    .with_label_values(&["authenticated"])
                    .inc();
                tracing::debug!(actor = %actor.log_identifier(), "Verified signed request");
                Ok(VerificationOutcome::Authenticated(actor))
            }
            Err(AppError::Signature(reason)) => {
                SIGNATURE_VERIFICATIONS_TOTAL
                    .with_label_values(&[reason.kind()])
                    .inc();
                tracing::info!(
                    key_id = ?request
                        .signature_parameters()
                        .and_then(|params| params.key_id().map(ToOwned::to_owned)),
                    breaker = %breaker_name,
                    reason = %reason,
                    "Rejected signed request"
                );
                Ok(VerificationOutcome::Rejected(reason))
            }
            Err(error) => {
                SIGNATURE_VERIFICATIONS_TOTAL
                    .with_label_values(&["error"])
                    .inc();
                tracing::error!(breaker = %breaker_name, %error, "Signature verification failed");
                Err(error)
            }
        }
    }

    async fn authenticate(
        &self,
        request: &SignedRequest,
        breaker_name: &str,
    ) -> Result<Actor, AppError> {
        let params = request
            .signature_parameters()
            .ok_or(VerificationError::NotSigned)?;

        self.check_date(&request.headers)?;

        let (Some(key_id), Some(signature)) = (params.key_id(), params.signature()) else {
            return Err(VerificationError::MalformedSignature.into());
        };

        if let Some(algorithm) = params.algorithm() {
            if !SUPPORTED_ALGORITHMS.contains(&algorithm.to_ascii_lowercase().as_str()) {
                return Err(VerificationError::UnsupportedAlgorithm(algorithm.to_string()).into());
            }
        }

        let actor = self
            .resolver
            .resolve(key_id, breaker_name)
            .await?
            .ok_or_else(|| VerificationError::KeyNotFound(key_id.to_string()))?;

        let signed_string = build_signed_string(
            &params.signed_headers(),
            &request.method,
            &request.path,
            &request.headers,
            &request.body,
        );

        if verify_rsa_sha256(&actor.public_key_pem, &signed_string, signature) {
            return Ok(actor);
        }

        tracing::debug!(
            actor = %actor.log_identifier(),
            key_id = %key_id,
            "Signature did not match cached key, refreshing"
        );
        let actor = self
            .resolver
            .refresh(&actor, breaker_name)
            .await?
            .ok_or_else(|| VerificationError::KeyNotFound(key_id.to_string()))?;

        if verify_rsa_sha256(&actor.public_key_pem, &signed_string, signature) {
            return Ok(actor);
        }

        Err(VerificationError::CryptoMismatch {
            actor: actor.log_identifier(),
            uri: actor.uri,
        }
        .into())
    }

    /// A missing `Date` passes; an unparsable one does not.
    fn check_date(&self, headers: &HeaderMap) -> Result<(), VerificationError> {
        let Some(raw) = headers.get("date") else {
            return Ok(());
        };

        let date = raw
            .to_str()
            .ok()
            .and_then(parse_http_date)
            .ok_or(VerificationError::ClockSkew)?;

        if (self.clock.now() - date).abs() > self.window {
            return Err(VerificationError::ClockSkew);
        }
        Ok(())
    }
}

/// One inbound request plus its memoized verification outcome.
pub struct SignedRequestContext {
    request: SignedRequest,
    remote_ip: Option<IpAddr>,
    outcome: OnceCell<VerificationOutcome>,
}

impl SignedRequestContext {
    pub fn new(request: SignedRequest, remote_ip: Option<IpAddr>) -> Self {
        Self {
            request,
            remote_ip,
            outcome: OnceCell::new(),
        }
    }

    pub fn request(&self) -> &SignedRequest {
        &self.request
    }

    /// Breaker guarding fetches made on behalf of this request's peer.
    pub fn breaker_name(&self) -> String {
        match self.remote_ip {
            Some(ip) => source_breaker_name(ip),
            None => source_breaker_name("unknown"),
        }
    }

    /// Verify once and return the same outcome on every later call.
    pub async fn signed_request_actor(
        &self,
        verifier: &SignatureVerifier,
    ) -> Result<&VerificationOutcome, AppError> {
        self.outcome
            .get_or_try_init(|| async {
                let breaker_name = self.breaker_name();
                verifier.verify(&self.request, &breaker_name).await
            })
            .await
    }
}
