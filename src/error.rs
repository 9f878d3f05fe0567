//! Error types for Keygate
//!
//! Application errors are converted to `AppError`, which implements
//! `IntoResponse` for HTTP error responses. Signature rejections are a
//! distinct, cloneable taxonomy (`VerificationError`) because the verifier
//! memoizes them per request.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Reasons an inbound signed request is rejected.
///
/// Every variant maps to a plain-text reason and an HTTP status. Network
/// failures and open circuits never show up here on their own: they are
/// folded into [`VerificationError::KeyNotFound`] so an unreachable origin
/// fails closed exactly like a missing key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("Request not signed")]
    NotSigned,

    #[error("Signed request date outside acceptable time window")]
    ClockSkew,

    #[error("Incompatible request signature")]
    MalformedSignature,

    #[error("Unsupported signature algorithm: {0} (only rsa-sha256 and hs2019 are supported)")]
    UnsupportedAlgorithm(String),

    #[error("Domain {0} is not allowed to federate with this instance")]
    DomainBlocked(String),

    #[error("Public key not found for key {0}")]
    KeyNotFound(String),

    /// The remote served something unusable for key resolution
    #[error("{0}")]
    KeyResolution(String),

    #[error(
        "Verification failed for {actor} {uri} using rsa-sha256 (RSASSA-PKCS1-v1_5 with SHA-256)"
    )]
    CryptoMismatch { actor: String, uri: String },
}

impl VerificationError {
    /// HTTP status the caller should answer with.
    pub fn status(&self) -> StatusCode {
        match self {
            VerificationError::DomainBlocked(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            VerificationError::NotSigned => "not_signed",
            VerificationError::ClockSkew => "clock_skew",
            VerificationError::MalformedSignature => "malformed_signature",
            VerificationError::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            VerificationError::DomainBlocked(_) => "domain_blocked",
            VerificationError::KeyNotFound(_) => "key_not_found",
            VerificationError::KeyResolution(_) => "key_resolution",
            VerificationError::CryptoMismatch { .. } => "crypto_mismatch",
        }
    }
}

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Signed request rejected (401 or 403)
    #[error(transparent)]
    Signature(#[from] VerificationError),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Federation error (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Signature rejections answer with their own status and a plain-text
    /// reason; everything else gets a JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;
        use crate::metrics::ERRORS_TOTAL;

        if let AppError::Signature(rejection) = &self {
            ERRORS_TOTAL
                .with_label_values(&[rejection.kind(), "inbox"])
                .inc();
            return (rejection.status(), rejection.to_string()).into_response();
        }

        let (status, error_message, error_type) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string(), "not_found"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string(), "unauthorized"),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
            AppError::Federation(msg) => (StatusCode::BAD_GATEWAY, msg.clone(), "federation"),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, self.to_string(), "http_client"),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "config"),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
            ),
            AppError::Signature(rejection) => {
                (rejection.status(), rejection.to_string(), rejection.kind())
            }
        };

        ERRORS_TOTAL
            .with_label_values(&[error_type, "unknown"])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
