//! Google Calendar v3 over plain HTTP.
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::provider::{
    CalendarApi, Channel, EventPage, EventStatus, EventTime, ListQuery, NewEvent,
    ProviderCalendar, ProviderError, ProviderEvent, ProviderResult, WatchRequest,
};

const PAGE_SIZE: &str = "250";

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GoogleEventTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
}

impl From<&EventTime> for GoogleEventTime {
    fn from(time: &EventTime) -> Self {
        match time {
            EventTime::DateTime(dt) => GoogleEventTime {
                date_time: Some(*dt),
                date: None,
            },
            EventTime::Date(d) => GoogleEventTime {
                date_time: None,
                date: Some(*d),
            },
        }
    }
}

impl GoogleEventTime {
    fn into_event_time(self) -> Option<EventTime> {
        match (self.date_time, self.date) {
            (Some(dt), _) => Some(EventTime::DateTime(dt)),
            (None, Some(d)) => Some(EventTime::Date(d)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ExtendedProperties {
    pub private: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleEvent {
    pub id: String,
    pub status: Option<String>,
    pub summary: Option<String>,
    pub start: Option<GoogleEventTime>,
    pub end: Option<GoogleEventTime>,
    pub transparency: Option<String>,
    pub extended_properties: Option<ExtendedProperties>,
}

impl From<GoogleEvent> for ProviderEvent {
    fn from(event: GoogleEvent) -> Self {
        let status = match event.status.as_deref() {
            Some("cancelled") => EventStatus::Cancelled,
            Some("tentative") => EventStatus::Tentative,
            _ => EventStatus::Confirmed,
        };
        ProviderEvent {
            id: event.id,
            status,
            summary: event.summary,
            start: event.start.and_then(GoogleEventTime::into_event_time),
            end: event.end.and_then(GoogleEventTime::into_event_time),
            transparent: event.transparency.as_deref() == Some("transparent"),
            private_properties: event
                .extended_properties
                .and_then(|p| p.private)
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsResponse {
    #[serde(default)]
    items: Vec<GoogleEvent>,
    next_page_token: Option<String>,
    next_sync_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    id: String,
    resource_id: String,
    // Milliseconds since the epoch, as a string
    expiration: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarListEntry {
    id: String,
    summary: Option<String>,
    summary_override: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarListResponse {
    #[serde(default)]
    items: Vec<CalendarListEntry>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorReason {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorReason>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Map a failed response onto [`ProviderError`]. `gone_means_cursor`
/// decides whether 410 is an invalidated sync token (listings) or an
/// already deleted resource.
async fn error_from_response(resp: Response, gone_means_cursor: bool) -> ProviderError {
    let status = resp.status();
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = resp.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&body).ok().map(|b| b.error);
    let reasons: Vec<String> = detail
        .as_ref()
        .map(|d| d.errors.iter().filter_map(|e| e.reason.clone()).collect())
        .unwrap_or_default();
    let message = detail
        .and_then(|d| d.message)
        .unwrap_or_else(|| body.clone());
    let rate_limited = reasons
        .iter()
        .any(|r| r == "rateLimitExceeded" || r == "userRateLimitExceeded");

    match status {
        StatusCode::UNAUTHORIZED => ProviderError::AuthExpired,
        StatusCode::NOT_FOUND => ProviderError::NotFound(message),
        StatusCode::GONE if gone_means_cursor => ProviderError::CursorInvalidated,
        StatusCode::GONE => ProviderError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        StatusCode::FORBIDDEN if rate_limited => ProviderError::RateLimited { retry_after },
        s if s.is_server_error() => ProviderError::Transient(format!("{}: {}", s, message)),
        s => ProviderError::Permanent(format!("{}: {}", s, message)),
    }
}

async fn send(req: RequestBuilder, gone_means_cursor: bool) -> ProviderResult<Response> {
    let resp = req.send().await.map_err(|e| {
        if e.is_timeout() {
            ProviderError::Timeout(Duration::ZERO)
        } else {
            ProviderError::Transient(e.to_string())
        }
    })?;
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(error_from_response(resp, gone_means_cursor).await)
    }
}

async fn parse<T: serde::de::DeserializeOwned>(resp: Response) -> ProviderResult<T> {
    resp.json::<T>()
        .await
        .map_err(|e| ProviderError::Transient(format!("Malformed response: {}", e)))
}

pub struct GoogleCalendarApi {
    client: Client,
    base_url: String,
}

impl GoogleCalendarApi {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn events_url(&self, calendar_id: &str) -> String {
        format!(
            "{}/calendar/v3/calendars/{}/events",
            self.base_url,
            urlencoding::encode(calendar_id)
        )
    }

    fn event_url(&self, calendar_id: &str, event_id: &str) -> String {
        format!(
            "{}/{}",
            self.events_url(calendar_id),
            urlencoding::encode(event_id)
        )
    }
}

#[async_trait]
impl CalendarApi for GoogleCalendarApi {
    async fn list_events(
        &self,
        token: &str,
        calendar_id: &str,
        query: &ListQuery,
        page_token: Option<&str>,
    ) -> ProviderResult<EventPage> {
        let mut params: Vec<(&str, String)> = vec![
            ("maxResults", PAGE_SIZE.to_string()),
            ("showDeleted", "true".to_string()),
            ("singleEvents", "true".to_string()),
        ];
        match query {
            ListQuery::Incremental { sync_token } => params.push(("syncToken", sync_token.clone())),
            ListQuery::Full { time_min } => params.push(("timeMin", time_min.to_rfc3339())),
        }
        if let Some(page_token) = page_token {
            params.push(("pageToken", page_token.to_string()));
        }

        let req = self
            .client
            .get(self.events_url(calendar_id))
            .bearer_auth(token)
            .query(&params);
        let body: EventsResponse = parse(send(req, true).await?).await?;
        Ok(EventPage {
            events: body.items.into_iter().map(ProviderEvent::from).collect(),
            next_page_token: body.next_page_token,
            next_sync_token: body.next_sync_token,
        })
    }

    async fn find_events_by_correlation_id(
        &self,
        token: &str,
        calendar_id: &str,
        correlation_id: &str,
    ) -> ProviderResult<Vec<ProviderEvent>> {
        let req = self
            .client
            .get(self.events_url(calendar_id))
            .bearer_auth(token)
            .query(&[
                ("privateExtendedProperty", format!("id={}", correlation_id)),
                ("showDeleted", "false".to_string()),
            ]);
        let body: EventsResponse = parse(send(req, false).await?).await?;
        Ok(body.items.into_iter().map(ProviderEvent::from).collect())
    }

    async fn insert_event(
        &self,
        token: &str,
        calendar_id: &str,
        event: &NewEvent,
    ) -> ProviderResult<ProviderEvent> {
        let payload = json!({
            "summary": event.summary,
            "start": GoogleEventTime::from(&event.start),
            "end": GoogleEventTime::from(&event.end),
            "transparency": "opaque",
            "visibility": "private",
            "reminders": { "useDefault": false },
            "extendedProperties": { "private": event.private_properties },
        });
        let req = self
            .client
            .post(self.events_url(calendar_id))
            .bearer_auth(token)
            .json(&payload);
        let created: GoogleEvent = parse(send(req, false).await?).await?;
        Ok(created.into())
    }

    async fn patch_private_properties(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
        properties: &HashMap<String, String>,
    ) -> ProviderResult<()> {
        let req = self
            .client
            .patch(self.event_url(calendar_id, event_id))
            .bearer_auth(token)
            .json(&json!({ "extendedProperties": { "private": properties } }));
        send(req, false).await?;
        Ok(())
    }

    async fn patch_event_times(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
        start: &EventTime,
        end: &EventTime,
    ) -> ProviderResult<()> {
        let req = self
            .client
            .patch(self.event_url(calendar_id, event_id))
            .bearer_auth(token)
            .json(&json!({
                "start": GoogleEventTime::from(start),
                "end": GoogleEventTime::from(end),
            }));
        send(req, false).await?;
        Ok(())
    }

    async fn delete_event(&self, token: &str, calendar_id: &str, event_id: &str) -> ProviderResult<()> {
        let req = self
            .client
            .delete(self.event_url(calendar_id, event_id))
            .bearer_auth(token);
        send(req, false).await?;
        Ok(())
    }

    async fn watch(
        &self,
        token: &str,
        calendar_id: &str,
        request: &WatchRequest,
    ) -> ProviderResult<Channel> {
        let mut payload = json!({
            "id": request.channel_id,
            "type": "web_hook",
            "address": request.address,
            "params": { "ttl": request.ttl.as_secs().to_string() },
        });
        if !request.token.is_empty() {
            payload["token"] = json!(request.token);
        }
        let req = self
            .client
            .post(format!("{}/watch", self.events_url(calendar_id)))
            .bearer_auth(token)
            .json(&payload);
        let body: WatchResponse = parse(send(req, false).await?).await?;

        let fallback = Utc::now()
            + chrono::Duration::from_std(request.ttl).unwrap_or_else(|_| chrono::Duration::days(7));
        let expires_at = body
            .expiration
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or(fallback);
        Ok(Channel {
            channel_id: body.id,
            resource_id: body.resource_id,
            expires_at,
        })
    }

    async fn stop_channel(&self, token: &str, channel_id: &str, resource_id: &str) -> ProviderResult<()> {
        let req = self
            .client
            .post(format!("{}/calendar/v3/channels/stop", self.base_url))
            .bearer_auth(token)
            .json(&json!({ "id": channel_id, "resourceId": resource_id }));
        send(req, false).await?;
        Ok(())
    }

    async fn list_calendars(&self, token: &str) -> ProviderResult<Vec<ProviderCalendar>> {
        let mut calendars = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut req = self
                .client
                .get(format!("{}/calendar/v3/users/me/calendarList", self.base_url))
                .bearer_auth(token)
                .query(&[("minAccessRole", "writer")]);
            if let Some(page_token) = &page_token {
                req = req.query(&[("pageToken", page_token)]);
            }
            let body: CalendarListResponse = parse(send(req, false).await?).await?;
            calendars.extend(body.items.into_iter().map(|entry| ProviderCalendar {
                name: entry
                    .summary_override
                    .or(entry.summary)
                    .unwrap_or_else(|| entry.id.clone()),
                id: entry.id,
            }));
            match body.next_page_token {
                Some(next) => page_token = Some(next),
                None => return Ok(calendars),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn api(server: &mockito::ServerGuard) -> GoogleCalendarApi {
        GoogleCalendarApi::new(Client::new(), &server.url())
    }

    #[tokio::test]
    async fn it_lists_incremental_changes() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/calendar/v3/calendars/primary/events")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("syncToken".into(), "tok-1".into()),
                Matcher::UrlEncoded("showDeleted".into(), "true".into()),
            ]))
            .match_header("authorization", "Bearer access")
            .with_status(200)
            .with_body(
                r#"{
                  "items": [
                    {
                      "id": "evt-1",
                      "status": "confirmed",
                      "summary": "Standup",
                      "start": {"dateTime": "2025-03-03T09:00:00-08:00"},
                      "end": {"dateTime": "2025-03-03T09:15:00-08:00"},
                      "extendedProperties": {"private": {"id": "c-1", "kind": "UserEvent"}}
                    },
                    {"id": "evt-2", "status": "cancelled"},
                    {
                      "id": "evt-3",
                      "start": {"date": "2025-03-04"},
                      "end": {"date": "2025-03-05"},
                      "transparency": "transparent"
                    }
                  ],
                  "nextSyncToken": "tok-2"
                }"#,
            )
            .create_async()
            .await;

        let page = api(&server)
            .list_events(
                "access",
                "primary",
                &ListQuery::Incremental {
                    sync_token: "tok-1".to_string(),
                },
                None,
            )
            .await
            .unwrap();
        mock.assert_async().await;

        assert_eq!(page.next_sync_token.as_deref(), Some("tok-2"));
        assert_eq!(page.events.len(), 3);
        let first = &page.events[0];
        assert!(first.is_busy());
        assert_eq!(first.private_properties.get("id").unwrap(), "c-1");
        assert_eq!(
            first.start.as_ref().unwrap().as_utc().to_rfc3339(),
            "2025-03-03T17:00:00+00:00"
        );
        assert!(page.events[1].is_cancelled());
        assert!(page.events[2].transparent);
        assert!(matches!(page.events[2].start, Some(EventTime::Date(_))));
    }

    #[tokio::test]
    async fn it_maps_provider_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/calendar/v3/calendars/gone/events")
            .match_query(Matcher::Any)
            .with_status(410)
            .with_body(r#"{"error": {"errors": [{"reason": "fullSyncRequired"}], "message": "Sync token is no longer valid"}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/calendar/v3/calendars/limited/events")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body(r#"{"error": {"errors": [{"reason": "rateLimitExceeded"}], "message": "Rate Limit Exceeded"}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/calendar/v3/calendars/denied/events")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body(r#"{"error": {"errors": [{"reason": "forbidden"}], "message": "Forbidden"}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/calendar/v3/calendars/expired/events")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;
        server
            .mock("GET", "/calendar/v3/calendars/flaky/events")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let api = api(&server);
        let query = ListQuery::Incremental {
            sync_token: "t".to_string(),
        };
        let list = |calendar: &'static str| {
            let api = &api;
            let query = &query;
            async move { api.list_events("access", calendar, query, None).await }
        };

        assert_eq!(list("gone").await.unwrap_err(), ProviderError::CursorInvalidated);
        assert_eq!(
            list("limited").await.unwrap_err(),
            ProviderError::RateLimited { retry_after: None }
        );
        assert!(matches!(list("denied").await.unwrap_err(), ProviderError::Permanent(_)));
        assert_eq!(list("expired").await.unwrap_err(), ProviderError::AuthExpired);
        assert!(matches!(list("flaky").await.unwrap_err(), ProviderError::Transient(_)));
    }

    #[tokio::test]
    async fn it_inserts_events_with_private_metadata() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/calendar/v3/calendars/primary/events")
            .match_body(Matcher::PartialJson(json!({
                "summary": "Busy",
                "transparency": "opaque",
                "extendedProperties": {"private": {"id": "p-1", "kind": "PlaceholderBlock"}}
            })))
            .with_status(200)
            .with_body(
                r#"{
                  "id": "new-1",
                  "status": "confirmed",
                  "summary": "Busy",
                  "start": {"dateTime": "2025-03-03T17:00:00Z"},
                  "end": {"dateTime": "2025-03-03T18:00:00Z"},
                  "extendedProperties": {"private": {"id": "p-1", "kind": "PlaceholderBlock"}}
                }"#,
            )
            .create_async()
            .await;

        let start: DateTime<Utc> = "2025-03-03T17:00:00Z".parse().unwrap();
        let mut properties = HashMap::new();
        properties.insert("id".to_string(), "p-1".to_string());
        properties.insert("kind".to_string(), "PlaceholderBlock".to_string());
        let created = api(&server)
            .insert_event(
                "access",
                "primary",
                &NewEvent {
                    summary: "Busy".to_string(),
                    start: EventTime::DateTime(start),
                    end: EventTime::DateTime(start + chrono::Duration::hours(1)),
                    private_properties: properties,
                },
            )
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(created.id, "new-1");
    }

    #[tokio::test]
    async fn it_treats_a_deleted_event_as_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/calendar/v3/calendars/primary/events/evt-1")
            .with_status(410)
            .create_async()
            .await;

        let err = api(&server)
            .delete_event("access", "primary", "evt-1")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn it_opens_a_watch_channel() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/calendar/v3/calendars/primary/events/watch")
            .match_body(Matcher::PartialJson(json!({
                "id": "chan-1",
                "type": "web_hook",
                "address": "https://example.com/api/webhook/google",
                "token": "secret"
            })))
            .with_status(200)
            .with_body(r#"{"kind": "api#channel", "id": "chan-1", "resourceId": "res-1", "expiration": "1741017600000"}"#)
            .create_async()
            .await;

        let channel = api(&server)
            .watch(
                "access",
                "primary",
                &WatchRequest {
                    channel_id: "chan-1".to_string(),
                    address: "https://example.com/api/webhook/google".to_string(),
                    token: "secret".to_string(),
                    ttl: Duration::from_secs(3600),
                },
            )
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(channel.resource_id, "res-1");
        assert_eq!(channel.expires_at.timestamp_millis(), 1741017600000);
    }

    #[tokio::test]
    async fn it_lists_calendars_across_pages() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/calendar/v3/users/me/calendarList")
            .match_query(Matcher::UrlEncoded("pageToken".into(), "p2".into()))
            .with_status(200)
            .with_body(r#"{"items": [{"id": "team@group.calendar.google.com", "summary": "Team"}]}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/calendar/v3/users/me/calendarList")
            .match_query(Matcher::Exact("minAccessRole=writer".into()))
            .with_status(200)
            .with_body(r#"{"items": [{"id": "me@example.com", "summary": "me@example.com", "summaryOverride": "Work"}], "nextPageToken": "p2"}"#)
            .create_async()
            .await;

        let calendars = api(&server).list_calendars("access").await.unwrap();
        assert_eq!(
            calendars,
            vec![
                ProviderCalendar {
                    id: "me@example.com".to_string(),
                    name: "Work".to_string()
                },
                ProviderCalendar {
                    id: "team@group.calendar.google.com".to_string(),
                    name: "Team".to_string()
                },
            ]
        );
    }
}
