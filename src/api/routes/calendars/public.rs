//! Public types for the calendars API
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;

#[derive(Debug, Serialize, Deserialize)]
pub struct CalendarResponse {
    pub id: i64,
    pub account_id: String,
    pub name: String,
    pub sync_enabled: bool,
    pub polling_mode: bool,
    pub channel_id: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl From<Calendar> for CalendarResponse {
    fn from(calendar: Calendar) -> Self {
        Self {
            id: calendar.id,
            account_id: calendar.account_id,
            name: calendar.name,
            sync_enabled: calendar.sync_enabled,
            polling_mode: calendar.polling_mode,
            channel_id: calendar.channel_id,
            last_synced_at: calendar.last_synced_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CalendarsResponse {
    pub calendars: Vec<CalendarResponse>,
}
