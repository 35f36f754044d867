//! Public types for the webhook API
use http::HeaderMap;
use serde::Serialize;

use crate::service::Notification;

pub const CHANNEL_ID_HEADER: &str = "x-goog-channel-id";
pub const RESOURCE_ID_HEADER: &str = "x-goog-resource-id";
pub const RESOURCE_STATE_HEADER: &str = "x-goog-resource-state";
pub const MESSAGE_NUMBER_HEADER: &str = "x-goog-message-number";
pub const CHANNEL_TOKEN_HEADER: &str = "x-goog-channel-token";

/// A Google Calendar push notification. Everything arrives in headers; the
/// body is empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoogleNotification {
    pub channel_id: String,
    pub resource_id: String,
    pub resource_state: String,
    pub message_number: Option<i64>,
    pub channel_token: Option<String>,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl GoogleNotification {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        Some(Self {
            channel_id: header(headers, CHANNEL_ID_HEADER)?,
            resource_id: header(headers, RESOURCE_ID_HEADER)?,
            resource_state: header(headers, RESOURCE_STATE_HEADER).unwrap_or_else(|| "exists".to_string()),
            message_number: header(headers, MESSAGE_NUMBER_HEADER).and_then(|v| v.parse().ok()),
            channel_token: header(headers, CHANNEL_TOKEN_HEADER),
        })
    }
}

impl From<GoogleNotification> for Notification {
    fn from(n: GoogleNotification) -> Self {
        Notification {
            channel_id: n.channel_id,
            resource_id: n.resource_id,
            resource_state: n.resource_state,
            message_number: n.message_number,
            channel_token: n.channel_token,
        }
    }
}
