//! Router for the calendars API

use axum::response::{IntoResponse, Response};
use axum::{
    Router,
    extract::{Path, State},
    response::Json,
    routing::{delete, get, post},
};

use super::public;
use crate::api::public::ApiError;
use crate::api::state::{SharedState, service};
use crate::calendar::db::list_calendars;

async fn list_calendars_handler(
    State(state): State<SharedState>,
) -> Result<Json<public::CalendarsResponse>, ApiError> {
    let db = state.read().unwrap_or_else(|e| e.into_inner()).db.clone();
    let calendars = list_calendars(&db)
        .await?
        .into_iter()
        .map(public::CalendarResponse::from)
        .collect();
    Ok(Json(public::CalendarsResponse { calendars }))
}

async fn sync_handler(State(state): State<SharedState>, Path(id): Path<i64>) -> Response {
    match service(&state).trigger_sync(id).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn resync_handler(State(state): State<SharedState>, Path(id): Path<i64>) -> Response {
    match service(&state).trigger_full_resync(id).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_handler(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<crate::sync::SyncReport>, ApiError> {
    let report = service(&state).delete_calendar(id).await?;
    Ok(Json(report))
}

/// Create the calendars router
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_calendars_handler))
        .route("/{id}", delete(delete_handler))
        .route("/{id}/sync", post(sync_handler))
        .route("/{id}/resync", post(resync_handler))
}
