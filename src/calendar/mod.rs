pub mod db;
pub mod lock;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::provider::CalendarRef;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalendarAccount {
    pub id: String,
    /// Accounts sharing an owner have their busy time mirrored into each other.
    pub owner: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Calendar {
    pub id: i64,
    pub account_id: String,
    pub provider_calendar_id: String,
    pub name: String,
    pub sync_enabled: bool,
    /// Set when push notifications are unavailable and the calendar is
    /// kept current by polling.
    pub polling_mode: bool,
    pub channel_id: Option<String>,
    #[serde(skip_serializing)]
    pub sync_cursor: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Calendar {
    pub fn provider_ref(&self) -> CalendarRef {
        CalendarRef {
            account_id: self.account_id.clone(),
            provider_calendar_id: self.provider_calendar_id.clone(),
        }
    }
}
