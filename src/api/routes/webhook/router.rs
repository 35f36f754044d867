//! Router for the webhook API

use axum::{Router, extract::State, http::StatusCode};
use http::HeaderMap;

use super::public::GoogleNotification;
use crate::api::state::{SharedState, service};

/// Acknowledge right away and sync in the background. The provider only
/// needs to know delivery succeeded; anything else would make it retry.
async fn google_webhook(State(state): State<SharedState>, headers: HeaderMap) -> StatusCode {
    let Some(notification) = GoogleNotification::from_headers(&headers) else {
        tracing::warn!("Ignoring webhook call without channel headers");
        return StatusCode::OK;
    };
    tracing::debug!(
        channel_id = %notification.channel_id,
        state = %notification.resource_state,
        message_number = ?notification.message_number,
        "Received push notification"
    );

    let service = service(&state);
    tokio::spawn(async move {
        service.handle_notification(notification.into()).await;
    });
    StatusCode::OK
}

/// Create the webhook router
pub fn router() -> Router<SharedState> {
    Router::new().route("/google", axum::routing::post(google_webhook))
}
