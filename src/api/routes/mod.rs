//! API routes module

pub mod calendars;
pub mod maintenance;
pub mod webhook;

use axum::Router;

use crate::api::state::SharedState;

/// Create the combined API router
pub fn router() -> Router<SharedState> {
    Router::new()
        // Provider push notifications
        .nest("/webhook", webhook::router())
        // Calendar status and manual sync triggers
        .nest("/calendars", calendars::router())
        // Orphan reconciliation and subscription upkeep
        .nest("/maintenance", maintenance::router())
}
