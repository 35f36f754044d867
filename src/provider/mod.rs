//! The provider seam: domain types for events and channels, the
//! [`CalendarApi`] trait a concrete backend implements, and the resilient
//! [`ProviderClient`] the rest of the crate talks to.

pub mod client;
pub mod error;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub use client::ProviderClient;
pub use error::{ProviderError, ProviderResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTime {
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
}

impl EventTime {
    /// All-day dates are treated as starting at midnight UTC.
    pub fn as_utc(&self) -> DateTime<Utc> {
        match self {
            EventTime::DateTime(dt) => *dt,
            EventTime::Date(date) => date
                .and_hms_opt(0, 0, 0)
                .map(|naive| naive.and_utc())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Confirmed,
    Tentative,
    Cancelled,
}

/// An event as observed on the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
    pub id: String,
    pub status: EventStatus,
    pub summary: Option<String>,
    pub start: Option<EventTime>,
    pub end: Option<EventTime>,
    pub transparent: bool,
    pub private_properties: HashMap<String, String>,
}

impl ProviderEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status == EventStatus::Cancelled
    }

    /// Whether this event blocks time on its calendar.
    pub fn is_busy(&self) -> bool {
        !self.is_cancelled() && !self.transparent && self.start.is_some() && self.end.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub summary: String,
    pub start: EventTime,
    pub end: EventTime,
    pub private_properties: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub enum ListQuery {
    /// Changes since a cursor, including cancellations.
    Incremental { sync_token: String },
    /// Everything from `time_min` onwards, used to obtain a fresh cursor.
    Full { time_min: DateTime<Utc> },
}

#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<ProviderEvent>,
    pub next_page_token: Option<String>,
    pub next_sync_token: Option<String>,
}

/// The result of listing changes for a calendar.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub events: Vec<ProviderEvent>,
    pub next_cursor: Option<String>,
    /// True when this is a complete listing rather than a delta.
    pub full: bool,
    pub window_start: Option<DateTime<Utc>>,
}

/// Identifies a calendar on the provider along with the account whose
/// credentials are used to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarRef {
    pub account_id: String,
    pub provider_calendar_id: String,
}

#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub channel_id: String,
    pub address: String,
    pub token: String,
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub channel_id: String,
    pub resource_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCalendar {
    pub id: String,
    pub name: String,
}

/// Raw calendar operations against a provider. Implementations map the
/// provider's failure responses onto [`ProviderError`] and do nothing else;
/// retries, rate limiting and credentials are handled by [`ProviderClient`].
#[async_trait]
pub trait CalendarApi: Send + Sync {
    async fn list_events(
        &self,
        token: &str,
        calendar_id: &str,
        query: &ListQuery,
        page_token: Option<&str>,
    ) -> ProviderResult<EventPage>;

    async fn find_events_by_correlation_id(
        &self,
        token: &str,
        calendar_id: &str,
        correlation_id: &str,
    ) -> ProviderResult<Vec<ProviderEvent>>;

    async fn insert_event(
        &self,
        token: &str,
        calendar_id: &str,
        event: &NewEvent,
    ) -> ProviderResult<ProviderEvent>;

    async fn patch_private_properties(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
        properties: &HashMap<String, String>,
    ) -> ProviderResult<()>;

    async fn patch_event_times(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
        start: &EventTime,
        end: &EventTime,
    ) -> ProviderResult<()>;

    async fn delete_event(&self, token: &str, calendar_id: &str, event_id: &str)
    -> ProviderResult<()>;

    async fn watch(
        &self,
        token: &str,
        calendar_id: &str,
        request: &WatchRequest,
    ) -> ProviderResult<Channel>;

    async fn stop_channel(&self, token: &str, channel_id: &str, resource_id: &str)
    -> ProviderResult<()>;

    async fn list_calendars(&self, token: &str) -> ProviderResult<Vec<ProviderCalendar>>;
}

/// Supplies access tokens per account. Refreshing is the implementation's
/// concern; callers only ask for a token and report one that was rejected.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self, account_id: &str) -> ProviderResult<String>;

    async fn invalidate(&self, account_id: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(status: EventStatus, transparent: bool) -> ProviderEvent {
        let start = Utc::now();
        ProviderEvent {
            id: "evt".to_string(),
            status,
            summary: None,
            start: Some(EventTime::DateTime(start)),
            end: Some(EventTime::DateTime(start + chrono::Duration::hours(1))),
            transparent,
            private_properties: HashMap::new(),
        }
    }

    #[test]
    fn it_only_treats_opaque_live_events_as_busy() {
        assert!(event(EventStatus::Confirmed, false).is_busy());
        assert!(event(EventStatus::Tentative, false).is_busy());
        assert!(!event(EventStatus::Confirmed, true).is_busy());
        assert!(!event(EventStatus::Cancelled, false).is_busy());
    }

    #[test]
    fn it_anchors_all_day_dates_at_midnight_utc() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        assert_eq!(
            EventTime::Date(date).as_utc().to_rfc3339(),
            "2025-03-01T00:00:00+00:00"
        );
    }
}
