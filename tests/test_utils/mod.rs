//! Test utilities for integration tests
#![allow(dead_code)]
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio_rusqlite::Connection;

use busysync::api::{AppState, app};
use busysync::calendar::Calendar;
use busysync::calendar::db::{get_calendar, upsert_account, upsert_calendar};
use busysync::core::AppConfig;
use busysync::core::db::{async_db, initialize_db};
use busysync::provider::{
    CalendarApi, Channel, EventPage, EventStatus, EventTime, ListQuery, NewEvent,
    ProviderCalendar, ProviderError, ProviderEvent, ProviderResult, TokenSource, WatchRequest,
};
use busysync::service::SyncService;

const PAGE_SIZE: usize = 2;

struct StoredEvent {
    event: ProviderEvent,
    seq: u64,
}

#[derive(Default)]
struct FakeState {
    calendars: HashMap<String, BTreeMap<String, StoredEvent>>,
    seq: u64,
    next_id: u64,
    // Remaining insert failures per calendar and whether the insert lands anyway
    insert_failures: HashMap<String, (u32, bool)>,
    permanent_insert_failures: HashSet<String>,
    list_failures: HashSet<String>,
    // Calendars whose correlation id search lags behind their writes
    hidden_from_search: HashSet<String>,
    invalid_cursors: HashSet<String>,
    watch_failures: u32,
    channels: HashMap<String, (String, String)>,
    account_calendars: HashMap<String, Vec<ProviderCalendar>>,
    listings: HashMap<String, Vec<ProviderEvent>>,
    writes: usize,
    list_calls: usize,
}

/// In-memory stand-in for a calendar provider. Every change bumps a global
/// sequence number and sync tokens are the sequence at listing time, so
/// incremental listings return exactly what changed since.
#[derive(Default)]
pub struct FakeCalendarApi {
    state: Mutex<FakeState>,
}

fn busy_event(id: String, summary: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> ProviderEvent {
    ProviderEvent {
        id,
        status: EventStatus::Confirmed,
        summary: Some(summary.to_string()),
        start: Some(EventTime::DateTime(start)),
        end: Some(EventTime::DateTime(end)),
        transparent: false,
        private_properties: HashMap::new(),
    }
}

impl FakeState {
    fn bump(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn new_id(&mut self) -> String {
        self.next_id += 1;
        format!("evt-{}", self.next_id)
    }

    fn store(&mut self, calendar_id: &str, event: ProviderEvent) {
        let seq = self.bump();
        self.calendars
            .entry(calendar_id.to_string())
            .or_default()
            .insert(event.id.clone(), StoredEvent { event, seq });
    }

    fn get_mut(&mut self, calendar_id: &str, event_id: &str) -> ProviderResult<&mut StoredEvent> {
        self.calendars
            .get_mut(calendar_id)
            .and_then(|events| events.get_mut(event_id))
            .filter(|stored| stored.event.status != EventStatus::Cancelled)
            .ok_or_else(|| ProviderError::NotFound(event_id.to_string()))
    }

    fn touch(&mut self, calendar_id: &str, event_id: &str) {
        let seq = self.bump();
        if let Some(stored) = self
            .calendars
            .get_mut(calendar_id)
            .and_then(|events| events.get_mut(event_id))
        {
            stored.seq = seq;
        }
    }

    fn cancel(&mut self, calendar_id: &str, event_id: &str) -> ProviderResult<()> {
        let stored = self.get_mut(calendar_id, event_id)?;
        stored.event.status = EventStatus::Cancelled;
        // Cancelled events come back without their private properties
        stored.event.private_properties.clear();
        self.touch(calendar_id, event_id);
        Ok(())
    }
}

impl FakeCalendarApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// A user creates an event directly on the provider.
    pub fn add_event(&self, calendar_id: &str, summary: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
        let mut state = self.state();
        let id = state.new_id();
        state.store(calendar_id, busy_event(id.clone(), summary, start, end));
        id
    }

    pub fn add_free_event(&self, calendar_id: &str, summary: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
        let mut state = self.state();
        let id = state.new_id();
        let mut event = busy_event(id.clone(), summary, start, end);
        event.transparent = true;
        state.store(calendar_id, event);
        id
    }

    /// An event written by some other system carrying its own metadata.
    pub fn add_event_with_properties(
        &self,
        calendar_id: &str,
        summary: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        properties: HashMap<String, String>,
    ) -> String {
        let mut state = self.state();
        let id = state.new_id();
        let mut event = busy_event(id.clone(), summary, start, end);
        event.private_properties = properties;
        state.store(calendar_id, event);
        id
    }

    pub fn move_event(&self, calendar_id: &str, event_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) {
        let mut state = self.state();
        let stored = state.get_mut(calendar_id, event_id).unwrap();
        stored.event.start = Some(EventTime::DateTime(start));
        stored.event.end = Some(EventTime::DateTime(end));
        state.touch(calendar_id, event_id);
    }

    pub fn mark_free(&self, calendar_id: &str, event_id: &str) {
        let mut state = self.state();
        state.get_mut(calendar_id, event_id).unwrap().event.transparent = true;
        state.touch(calendar_id, event_id);
    }

    /// A user deletes an event directly on the provider.
    pub fn cancel_event(&self, calendar_id: &str, event_id: &str) {
        self.state().cancel(calendar_id, event_id).unwrap();
    }

    /// Live events on a calendar.
    pub fn events(&self, calendar_id: &str) -> Vec<ProviderEvent> {
        self.state()
            .calendars
            .get(calendar_id)
            .map(|events| {
                events
                    .values()
                    .filter(|s| s.event.status != EventStatus::Cancelled)
                    .map(|s| s.event.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn event(&self, calendar_id: &str, event_id: &str) -> Option<ProviderEvent> {
        self.state()
            .calendars
            .get(calendar_id)
            .and_then(|events| events.get(event_id))
            .map(|s| s.event.clone())
    }

    /// Live events on a calendar tagged with a correlation id of the given kind.
    pub fn events_of_kind(&self, calendar_id: &str, kind: &str) -> Vec<ProviderEvent> {
        self.events(calendar_id)
            .into_iter()
            .filter(|e| e.private_properties.get("kind").map(String::as_str) == Some(kind))
            .collect()
    }

    /// Fail the next `times` inserts on a calendar. With `committed` the
    /// event is still created, as when a response is lost.
    pub fn fail_inserts(&self, calendar_id: &str, times: u32, committed: bool) {
        self.state()
            .insert_failures
            .insert(calendar_id.to_string(), (times, committed));
    }

    pub fn reject_inserts(&self, calendar_id: &str, rejected: bool) {
        let mut state = self.state();
        if rejected {
            state.permanent_insert_failures.insert(calendar_id.to_string());
        } else {
            state.permanent_insert_failures.remove(calendar_id);
        }
    }

    pub fn hide_from_search(&self, calendar_id: &str, hidden: bool) {
        let mut state = self.state();
        if hidden {
            state.hidden_from_search.insert(calendar_id.to_string());
        } else {
            state.hidden_from_search.remove(calendar_id);
        }
    }

    pub fn fail_lists(&self, calendar_id: &str, failing: bool) {
        let mut state = self.state();
        if failing {
            state.list_failures.insert(calendar_id.to_string());
        } else {
            state.list_failures.remove(calendar_id);
        }
    }

    /// The next incremental listing of the calendar reports an expired cursor.
    pub fn invalidate_cursor(&self, calendar_id: &str) {
        self.state().invalid_cursors.insert(calendar_id.to_string());
    }

    pub fn fail_watches(&self, times: u32) {
        self.state().watch_failures = times;
    }

    pub fn channels(&self) -> Vec<String> {
        self.state().channels.keys().cloned().collect()
    }

    pub fn add_account_calendar(&self, account_id: &str, calendar_id: &str, name: &str) {
        self.state()
            .account_calendars
            .entry(StaticTokens::token_for(account_id))
            .or_default()
            .push(ProviderCalendar {
                id: calendar_id.to_string(),
                name: name.to_string(),
            });
    }

    pub fn remove_account_calendar(&self, account_id: &str, calendar_id: &str) {
        if let Some(calendars) = self
            .state()
            .account_calendars
            .get_mut(&StaticTokens::token_for(account_id))
        {
            calendars.retain(|c| c.id != calendar_id);
        }
    }

    /// Writes made through the API: inserts, patches and deletes.
    pub fn writes(&self) -> usize {
        self.state().writes
    }

    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }
}

#[async_trait]
impl CalendarApi for FakeCalendarApi {
    async fn list_events(
        &self,
        _token: &str,
        calendar_id: &str,
        query: &ListQuery,
        page_token: Option<&str>,
    ) -> ProviderResult<EventPage> {
        let mut state = self.state();
        state.list_calls += 1;
        if state.list_failures.contains(calendar_id) {
            return Err(ProviderError::Transient("503 backend error".to_string()));
        }

        let (listing_id, offset) = match page_token {
            Some(token) => {
                let (listing_id, offset) = token.rsplit_once(':').unwrap();
                (listing_id.to_string(), offset.parse::<usize>().unwrap())
            }
            None => {
                if matches!(query, ListQuery::Incremental { .. })
                    && state.invalid_cursors.remove(calendar_id)
                {
                    return Err(ProviderError::CursorInvalidated);
                }
                let events = state.calendars.get(calendar_id);
                let snapshot: Vec<ProviderEvent> = match query {
                    ListQuery::Incremental { sync_token } => {
                        let since = sync_token
                            .strip_prefix("seq-")
                            .and_then(|s| s.parse::<u64>().ok())
                            .ok_or(ProviderError::CursorInvalidated)?;
                        let mut changed: Vec<&StoredEvent> = events
                            .map(|e| e.values().filter(|s| s.seq > since).collect())
                            .unwrap_or_default();
                        changed.sort_by_key(|s| s.seq);
                        changed.into_iter().map(|s| s.event.clone()).collect()
                    }
                    ListQuery::Full { time_min } => events
                        .map(|e| {
                            e.values()
                                .filter(|s| s.event.status != EventStatus::Cancelled)
                                .filter(|s| {
                                    s.event.end.as_ref().is_none_or(|end| end.as_utc() >= *time_min)
                                })
                                .map(|s| s.event.clone())
                                .collect()
                        })
                        .unwrap_or_default(),
                };
                let listing_id = format!("listing-{}-{}", calendar_id, state.listings.len());
                state.listings.insert(listing_id.clone(), snapshot);
                (listing_id, 0)
            }
        };

        let current = format!("seq-{}", state.seq);
        let snapshot = state.listings.get(&listing_id).cloned().unwrap_or_default();
        let end = (offset + PAGE_SIZE).min(snapshot.len());
        let events = snapshot[offset.min(end)..end].to_vec();
        if end < snapshot.len() {
            Ok(EventPage {
                events,
                next_page_token: Some(format!("{}:{}", listing_id, end)),
                next_sync_token: None,
            })
        } else {
            Ok(EventPage {
                events,
                next_page_token: None,
                next_sync_token: Some(current),
            })
        }
    }

    async fn find_events_by_correlation_id(
        &self,
        _token: &str,
        calendar_id: &str,
        correlation_id: &str,
    ) -> ProviderResult<Vec<ProviderEvent>> {
        if self.state().hidden_from_search.contains(calendar_id) {
            return Ok(Vec::new());
        }
        Ok(self
            .events(calendar_id)
            .into_iter()
            .filter(|e| e.private_properties.get("id").map(String::as_str) == Some(correlation_id))
            .collect())
    }

    async fn insert_event(
        &self,
        _token: &str,
        calendar_id: &str,
        event: &NewEvent,
    ) -> ProviderResult<ProviderEvent> {
        let mut state = self.state();
        if state.permanent_insert_failures.contains(calendar_id) {
            return Err(ProviderError::Permanent("403 forbidden".to_string()));
        }

        let mut failure = None;
        if let Some((remaining, committed)) = state.insert_failures.get_mut(calendar_id)
            && *remaining > 0
        {
            *remaining -= 1;
            failure = Some(*committed);
        }
        if failure == Some(false) {
            return Err(ProviderError::Transient("503 backend error".to_string()));
        }

        let id = state.new_id();
        let created = ProviderEvent {
            id,
            status: EventStatus::Confirmed,
            summary: Some(event.summary.clone()),
            start: Some(event.start.clone()),
            end: Some(event.end.clone()),
            transparent: false,
            private_properties: event.private_properties.clone(),
        };
        state.store(calendar_id, created.clone());
        state.writes += 1;
        if failure == Some(true) {
            return Err(ProviderError::Timeout(Duration::from_secs(10)));
        }
        Ok(created)
    }

    async fn patch_private_properties(
        &self,
        _token: &str,
        calendar_id: &str,
        event_id: &str,
        properties: &HashMap<String, String>,
    ) -> ProviderResult<()> {
        let mut state = self.state();
        state.get_mut(calendar_id, event_id)?.event.private_properties = properties.clone();
        state.touch(calendar_id, event_id);
        state.writes += 1;
        Ok(())
    }

    async fn patch_event_times(
        &self,
        _token: &str,
        calendar_id: &str,
        event_id: &str,
        start: &EventTime,
        end: &EventTime,
    ) -> ProviderResult<()> {
        let mut state = self.state();
        let stored = state.get_mut(calendar_id, event_id)?;
        stored.event.start = Some(start.clone());
        stored.event.end = Some(end.clone());
        state.touch(calendar_id, event_id);
        state.writes += 1;
        Ok(())
    }

    async fn delete_event(&self, _token: &str, calendar_id: &str, event_id: &str) -> ProviderResult<()> {
        let mut state = self.state();
        state.cancel(calendar_id, event_id)?;
        state.writes += 1;
        Ok(())
    }

    async fn watch(
        &self,
        _token: &str,
        calendar_id: &str,
        request: &WatchRequest,
    ) -> ProviderResult<Channel> {
        let mut state = self.state();
        if state.watch_failures > 0 {
            state.watch_failures -= 1;
            return Err(ProviderError::Permanent("push not supported".to_string()));
        }
        let resource_id = format!("res-{}", calendar_id);
        state.channels.insert(
            request.channel_id.clone(),
            (calendar_id.to_string(), resource_id.clone()),
        );
        Ok(Channel {
            channel_id: request.channel_id.clone(),
            resource_id,
            expires_at: Utc::now() + chrono::Duration::from_std(request.ttl).unwrap(),
        })
    }

    async fn stop_channel(&self, _token: &str, channel_id: &str, _resource_id: &str) -> ProviderResult<()> {
        match self.state().channels.remove(channel_id) {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound(channel_id.to_string())),
        }
    }

    async fn list_calendars(&self, token: &str) -> ProviderResult<Vec<ProviderCalendar>> {
        Ok(self
            .state()
            .account_calendars
            .get(token)
            .cloned()
            .unwrap_or_default())
    }
}

/// Hands out a fixed token per account and counts invalidations.
#[derive(Default)]
pub struct StaticTokens {
    pub invalidations: AtomicUsize,
}

impl StaticTokens {
    pub fn token_for(account_id: &str) -> String {
        format!("token:{}", account_id)
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for StaticTokens {
    async fn access_token(&self, account_id: &str) -> ProviderResult<String> {
        Ok(Self::token_for(account_id))
    }

    async fn invalidate(&self, _account_id: &str) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Config tuned so retries and backoff don't slow tests down.
pub fn test_config(dir: &TempDir) -> AppConfig {
    let storage_path = dir.path().display().to_string();
    AppConfig {
        db_path: storage_path.clone(),
        storage_path,
        webhook_url: String::from("https://busysync.test/api/webhook/google"),
        channel_token: String::from("test-channel-token"),
        placeholder_title: String::from("Busy"),
        max_retries: 2,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
        breaker_failure_threshold: 50,
        breaker_cooldown: Duration::from_secs(60),
        read_rate_per_sec: 10_000.0,
        write_rate_per_sec: 10_000.0,
        provider_timeout: Duration::from_secs(5),
        sync_pass_budget: Duration::from_secs(30),
        ..AppConfig::default()
    }
}

pub struct TestEnv {
    pub service: Arc<SyncService>,
    pub api: Arc<FakeCalendarApi>,
    pub tokens: Arc<StaticTokens>,
    pub db: Connection,
    pub config: AppConfig,
    _dir: TempDir,
}

impl TestEnv {
    pub async fn calendar(&self, calendar_id: i64) -> Calendar {
        get_calendar(&self.db, calendar_id).await.unwrap().unwrap()
    }

    /// Let background metadata stamps land.
    pub async fn settle(&self) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn test_env() -> TestEnv {
    test_env_with(|_| {}).await
}

pub async fn test_env_with(configure: impl FnOnce(&mut AppConfig)) -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    configure(&mut config);

    let db = async_db(&config.db_path).await.unwrap();
    db.call(|conn| {
        initialize_db(conn).expect("Failed to initialize db");
        Ok(())
    })
    .await
    .unwrap();

    let api = Arc::new(FakeCalendarApi::new());
    let tokens = Arc::new(StaticTokens::default());
    let service = Arc::new(SyncService::new(
        db.clone(),
        config.clone(),
        api.clone(),
        tokens.clone(),
    ));
    TestEnv {
        service,
        api,
        tokens,
        db,
        config,
        _dir: dir,
    }
}

/// Register a calendar for an account, creating the account if needed.
pub async fn seed_calendar(db: &Connection, account_id: &str, owner: &str, calendar_id: &str) -> Calendar {
    upsert_account(db, account_id, owner, Some(String::from("refresh")))
        .await
        .unwrap();
    upsert_calendar(db, account_id, calendar_id, calendar_id)
        .await
        .unwrap()
}

pub fn test_app(env: &TestEnv) -> Router {
    let app_state = AppState::new(env.service.clone());
    app(Arc::new(RwLock::new(app_state)))
}

/// A fixed hour on a day in the near future.
pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    let base = Utc::now() + chrono::Duration::days(day as i64);
    Utc.from_utc_datetime(
        &base
            .date_naive()
            .and_hms_opt(hour, 0, 0)
            .unwrap(),
    )
}

pub async fn body_to_string(body: axum::body::Body) -> String {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
