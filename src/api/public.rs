//! Public API types

use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde_json::json;

use crate::sync::SyncError;

// Errors

pub struct ApiError(anyhow::Error);

/// Convert `ApiError` into an Axum compatible response.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Always log the error
        tracing::error!("{}", self.0);

        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Something went wrong: {}", self.0),
        )
            .into_response()
    }
}

/// Enables using `?` on functions that return `Result<_,
/// anyhow::Error>` to turn them into `Result<_, ApiError>`
impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = match &self {
            SyncError::CalendarNotFound(_) => StatusCode::NOT_FOUND,
            SyncError::CalendarDisabled(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SyncError::LockHeld(_) => StatusCode::CONFLICT,
            SyncError::Provider(_) => StatusCode::BAD_GATEWAY,
            SyncError::BudgetExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            SyncError::Classification(_) | SyncError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!("{}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// Re-export public types from each route

pub mod calendars {
    pub use crate::api::routes::calendars::public::*;
}

pub mod maintenance {
    pub use crate::api::routes::maintenance::public::*;
}

pub mod webhook {
    pub use crate::api::routes::webhook::public::*;
}
