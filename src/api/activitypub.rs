//! ActivityPub endpoints
//!
//! - Actor document
//! - Actor inbox and shared inbox (activity receiving)
//! - Actor outbox (activities of local actors)
//!
//! Ingestion only queues: every accepted request is answered before any
//! verification or side effect happens.

use axum::body::Bytes;
use axum::{
    Router,
    extract::{DefaultBodyLimit, OriginalUri, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{ACTIVITY_CONTENT_TYPE, InboundRequest, Ingress};

/// Create ActivityPub router
///
/// Routes:
/// - GET /actors/:username - Actor document
/// - POST /actors/:username/inbox - Personal inbox
/// - POST /shared/inbox - Shared inbox
/// - POST /actors/:username/outbox - Outbox
pub fn activitypub_router(max_body_bytes: usize) -> Router<AppState> {
    let ingestion = Router::new()
        .route("/actors/:username/inbox", post(inbox))
        .route("/shared/inbox", post(shared_inbox))
        .route("/actors/:username/outbox", post(outbox))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes));

    Router::new()
        .route("/actors/:username", get(actor))
        .merge(ingestion)
}

/// GET /actors/:username
///
/// Content-Type: application/activity+json
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let actor = state
        .db
        .get_local_actor(&username)
        .await?
        .ok_or(AppError::NotFound)?;

    let kind = if username == state.config.instance.actor_username {
        "Application"
    } else {
        "Person"
    };

    let document = json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "type": kind,
        "id": actor.uri,
        "preferredUsername": actor.username,
        "inbox": actor.inbox_uri,
        "outbox": format!("{}/outbox", actor.uri),
        "followers": actor.followers_uri(),
        "manuallyApprovesFollowers": actor.manually_approves_followers,
        "endpoints": {
            "sharedInbox": actor.shared_inbox_uri,
        },
        "movedTo": actor.moved_to_uri,
        "publicKey": {
            "id": actor.public_key_id,
            "owner": actor.uri,
            "publicKeyPem": actor.public_key_pem,
        },
    });

    Ok((
        [(header::CONTENT_TYPE, ACTIVITY_CONTENT_TYPE)],
        document.to_string(),
    )
        .into_response())
}

/// POST /actors/:username/inbox
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    ingest(&state, Ingress::ActorInbox { username }, &uri, &headers, &body).await
}

/// POST /shared/inbox
async fn shared_inbox(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    ingest(&state, Ingress::SharedInbox, &uri, &headers, &body).await
}

/// POST /actors/:username/outbox
async fn outbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    ingest(&state, Ingress::ActorOutbox { username }, &uri, &headers, &body).await
}

async fn ingest(
    state: &AppState,
    ingress: Ingress,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<StatusCode, AppError> {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    let request = InboundRequest {
        method: "POST",
        path,
        headers,
        body,
    };
    let outcome = state.dispatcher.dispatch(ingress, request).await?;
    tracing::debug!(path = %path, outcome = outcome.label(), "Inbound request acknowledged");
    Ok(StatusCode::OK)
}
