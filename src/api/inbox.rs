//! ActivityPub inbox endpoints
//!
//! Authenticates deliveries with HTTP Signatures and acknowledges them.
//! Processing the activity itself happens elsewhere.

use std::net::SocketAddr;

use axum::{
    Router,
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    routing::post,
};
use serde_json::Value;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{
    SignedRequest, SignedRequestContext, VerificationOutcome, key_id_matches_actor,
};
use crate::metrics::{
    FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS,
    HTTP_REQUESTS_TOTAL,
};

/// Create inbox router
///
/// Routes:
/// - POST /inbox - Shared inbox
/// - POST /users/:username/inbox - Personal inbox
pub fn inbox_router() -> Router<AppState> {
    Router::new()
        .route("/inbox", post(shared_inbox))
        .route("/users/:username/inbox", post(user_inbox))
}

/// POST /inbox
async fn shared_inbox(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let request = signed_request(method, &uri, headers, body);
    receive(&state, "/inbox", request, remote).await
}

/// POST /users/:username/inbox
async fn user_inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    tracing::debug!(username = %username, "Delivery to personal inbox");
    let request = signed_request(method, &uri, headers, body);
    receive(&state, "/users/:username/inbox", request, remote).await
}

fn signed_request(method: Method, uri: &Uri, headers: HeaderMap, body: Bytes) -> SignedRequest {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    SignedRequest {
        method: method.as_str().to_string(),
        path,
        headers,
        body,
    }
}

/// `actor` of an activity, either a bare id or an embedded object.
fn activity_actor(activity: &Value) -> Option<&str> {
    let actor = activity.get("actor")?;
    actor
        .as_str()
        .or_else(|| actor.get("id").and_then(Value::as_str))
}

/// Verify a delivery and check the activity was sent by its signer.
async fn receive(
    state: &AppState,
    endpoint: &str,
    request: SignedRequest,
    remote: SocketAddr,
) -> Result<StatusCode, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", endpoint])
        .start_timer();
    let _fed_timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let context = SignedRequestContext::new(request, Some(remote.ip()));
    let signer = match context.signed_request_actor(&state.verifier).await? {
        VerificationOutcome::Authenticated(actor) => actor,
        VerificationOutcome::Rejected(reason) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", reason.kind()])
                .inc();
            HTTP_REQUESTS_TOTAL
                .with_label_values(&["POST", endpoint, reason.status().as_str()])
                .inc();
            return Err(reason.clone().into());
        }
    };

    let activity: Value = serde_json::from_slice(&context.request().body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;
    let actor_id = activity_actor(&activity)
        .ok_or_else(|| AppError::Validation("Missing actor field".to_string()))?;

    if !key_id_matches_actor(&signer.uri, actor_id) {
        tracing::info!(
            signer = %signer.uri,
            actor = %actor_id,
            "Activity actor does not match signer"
        );
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", "actor_mismatch"])
            .inc();
        HTTP_REQUESTS_TOTAL
            .with_label_values(&["POST", endpoint, "401"])
            .inc();
        return Err(AppError::Unauthorized);
    }

    let activity_type = activity
        .get("type")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("unknown");
    tracing::info!(
        actor = %signer.log_identifier(),
        activity_type,
        "Accepted signed delivery"
    );
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbound", "accepted"])
        .inc();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", endpoint, "202"])
        .inc();

    Ok(StatusCode::ACCEPTED)
}
