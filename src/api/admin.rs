//! Admin API endpoints
//!
//! Read access to the delivery audit trail and maintenance of the domain
//! block list. All routes require the admin bearer token.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::Json,
    routing::{delete, get, post},
};

use super::dto::{
    BlockDomainRequest, DeliveryEventQuery, DeliveryItemQuery, FollowRequestDecision,
    PagedResponse,
};
use crate::AppState;
use crate::auth::require_admin_token;
use crate::data::{DeliveryEvent, DeliveryEventItem, DomainBlock};
use crate::error::AppError;
use crate::federation::FollowDecision;

/// Create admin router
///
/// Routes:
/// - GET /admin/delivery-events - List delivery events
/// - GET /admin/delivery-events/:id - One delivery event
/// - GET /admin/delivery-events/:id/items - Destinations of an event
/// - GET /admin/domain-blocks - List blocked domains
/// - POST /admin/domain-blocks - Block domain
/// - DELETE /admin/domain-blocks/:domain - Unblock domain
/// - POST /admin/follow-requests/:decision - Accept or reject a pending follow
pub fn admin_router(state: AppState) -> Router<AppState> {
    Router::new()
        // Delivery audit trail
        .route("/delivery-events", get(list_delivery_events))
        .route("/delivery-events/:id", get(get_delivery_event))
        .route("/delivery-events/:id/items", get(list_delivery_event_items))
        // Domain blocks
        .route("/domain-blocks", get(list_domain_blocks).post(block_domain))
        .route("/domain-blocks/:domain", delete(unblock_domain))
        // Follow requests
        .route("/follow-requests/:decision", post(answer_follow_request))
        .route_layer(middleware::from_fn_with_state(state, require_admin_token))
}

// =============================================================================
// Delivery events
// =============================================================================

/// GET /admin/delivery-events
async fn list_delivery_events(
    State(state): State<AppState>,
    Query(query): Query<DeliveryEventQuery>,
) -> Result<Json<PagedResponse<DeliveryEvent>>, AppError> {
    let filter = query.filter()?;
    let page = query.page();
    let (events, total) = state.db.list_delivery_events(&filter, page).await?;
    Ok(Json(PagedResponse::new(events, page, total)))
}

/// GET /admin/delivery-events/:id
async fn get_delivery_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeliveryEvent>, AppError> {
    let event = state
        .db
        .get_delivery_event(&id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(event))
}

/// GET /admin/delivery-events/:id/items
async fn list_delivery_event_items(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeliveryItemQuery>,
) -> Result<Json<PagedResponse<DeliveryEventItem>>, AppError> {
    if state.db.get_delivery_event(&id).await?.is_none() {
        return Err(AppError::NotFound);
    }

    let page = query.page();
    let (items, total) = state
        .db
        .list_delivery_event_items(&id, query.only_errors, page)
        .await?;
    Ok(Json(PagedResponse::new(items, page, total)))
}

// =============================================================================
// Domain blocks
// =============================================================================

/// GET /admin/domain-blocks
async fn list_domain_blocks(
    State(state): State<AppState>,
) -> Result<Json<Vec<DomainBlock>>, AppError> {
    Ok(Json(state.db.get_all_domain_blocks().await?))
}

/// POST /admin/domain-blocks
async fn block_domain(
    State(state): State<AppState>,
    Json(req): Json<BlockDomainRequest>,
) -> Result<StatusCode, AppError> {
    let domain = req.domain.trim();
    if domain.is_empty() || domain.contains('/') {
        return Err(AppError::Validation(format!("Invalid domain: {}", req.domain)));
    }

    state.db.block_domain(domain, req.reason.as_deref()).await?;
    state.refresher.refresh().await?;
    tracing::info!(domain = %domain, "Domain blocked");
    Ok(StatusCode::CREATED)
}

/// DELETE /admin/domain-blocks/:domain
async fn unblock_domain(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<StatusCode, AppError> {
    if !state.db.unblock_domain(&domain).await? {
        return Err(AppError::NotFound);
    }

    state.refresher.refresh().await?;
    tracing::info!(domain = %domain, "Domain unblocked");
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Follow requests
// =============================================================================

/// POST /admin/follow-requests/:decision
async fn answer_follow_request(
    State(state): State<AppState>,
    Path(decision): Path<String>,
    Json(req): Json<FollowRequestDecision>,
) -> Result<StatusCode, AppError> {
    let decision = match decision.as_str() {
        "accept" => FollowDecision::Accept,
        "reject" => FollowDecision::Reject,
        other => {
            return Err(AppError::Validation(format!("Unknown decision: {}", other)));
        }
    };

    state
        .worker
        .respond_to_follow(&req.follower, &req.target, decision)
        .await?;
    Ok(StatusCode::ACCEPTED)
}
