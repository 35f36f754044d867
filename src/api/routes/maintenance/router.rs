//! Router for the maintenance API

use axum::{
    Router,
    extract::State,
    response::Json,
    routing::{get, post},
};

use super::public;
use crate::api::public::ApiError;
use crate::api::state::{SharedState, service};

async fn orphans_handler(
    State(state): State<SharedState>,
) -> Result<Json<public::OrphanReport>, ApiError> {
    let report = service(&state).reconcile_orphans().await?;
    Ok(Json(report))
}

async fn renew_handler(
    State(state): State<SharedState>,
) -> Result<Json<public::RenewalSummary>, ApiError> {
    let summary = service(&state).renew_expiring_subscriptions().await?;
    Ok(Json(summary))
}

async fn list_subscriptions_handler(
    State(state): State<SharedState>,
) -> Result<Json<public::SubscriptionsResponse>, ApiError> {
    let subscriptions = service(&state).subscriptions.list().await?;
    Ok(Json(public::SubscriptionsResponse { subscriptions }))
}

/// Create the maintenance router
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/orphans", post(orphans_handler))
        .route(
            "/subscriptions",
            get(list_subscriptions_handler).post(renew_handler),
        )
}
