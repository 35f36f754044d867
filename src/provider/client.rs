use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{
    CalendarApi, CalendarRef, ChangeSet, Channel, EventTime, ListQuery, NewEvent,
    ProviderCalendar, ProviderError, ProviderEvent, ProviderResult, TokenSource, WatchRequest,
};
use crate::core::AppConfig;
use crate::resilience::{Backoff, BreakerState, EndpointClass, Guards};

// Upper bound on pages fetched for a single listing
const MAX_PAGES: usize = 100;

/// Every call made through the client is admitted by the rate limiter and
/// circuit breaker of its endpoint class, bounded by a timeout, retried with
/// jittered backoff on transient failures and retried once after a token
/// refresh when credentials are rejected.
pub struct ProviderClient {
    api: Arc<dyn CalendarApi>,
    tokens: Arc<dyn TokenSource>,
    guards: Guards,
    timeout: Duration,
    max_retries: u32,
    backoff: Backoff,
}

impl ProviderClient {
    pub fn new(api: Arc<dyn CalendarApi>, tokens: Arc<dyn TokenSource>, config: &AppConfig) -> Self {
        Self {
            api,
            tokens,
            guards: Guards::new(config),
            timeout: config.provider_timeout,
            max_retries: config.max_retries,
            backoff: Backoff::new(config.backoff_base, config.backoff_max),
        }
    }

    pub fn breaker_state(&self, class: EndpointClass) -> BreakerState {
        self.guards.for_class(class).breaker.state()
    }

    async fn attempt<T, F, Fut>(&self, class: EndpointClass, account_id: &str, f: &F) -> ProviderResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let token = self.tokens.access_token(account_id).await?;
        let guard = self.guards.for_class(class);
        let Some(admission) = guard.breaker.allow() else {
            return Err(ProviderError::CircuitOpen(class));
        };
        guard.limiter.acquire().await;

        let result = tokio::time::timeout(self.timeout, f(token))
            .await
            .unwrap_or(Err(ProviderError::Timeout(self.timeout)));

        match &result {
            Err(e) if e.counts_against_breaker() => admission.failure(),
            _ => admission.success(),
        }
        result
    }

    async fn call_with_retries<T, F, Fut>(
        &self,
        class: EndpointClass,
        account_id: &str,
        op: &'static str,
        max_retries: u32,
        f: F,
    ) -> ProviderResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut attempt = 0;
        let mut refreshed = false;
        loop {
            match self.attempt(class, account_id, &f).await {
                Ok(value) => return Ok(value),
                Err(ProviderError::AuthExpired) if !refreshed => {
                    tracing::info!("{} for {} rejected credentials, refreshing", op, account_id);
                    refreshed = true;
                    self.tokens.invalidate(account_id).await;
                }
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    let mut delay = self.backoff.delay(attempt);
                    if let ProviderError::RateLimited {
                        retry_after: Some(retry_after),
                    } = &e
                    {
                        delay = delay.max(*retry_after);
                    }
                    tracing::warn!(
                        "{} for {} failed (attempt {}): {}, retrying in {:?}",
                        op,
                        account_id,
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call<T, F, Fut>(
        &self,
        class: EndpointClass,
        account_id: &str,
        op: &'static str,
        f: F,
    ) -> ProviderResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        self.call_with_retries(class, account_id, op, self.max_retries, f)
            .await
    }

    /// Follow page tokens until the listing is exhausted.
    pub async fn list_all(&self, calendar: &CalendarRef, query: &ListQuery) -> ProviderResult<ChangeSet> {
        let api = self.api.as_ref();
        let calendar_id = calendar.provider_calendar_id.as_str();
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let page_ref = page_token.as_deref();
            let page = self
                .call(EndpointClass::Read, &calendar.account_id, "list_events", move |token| async move {
                    api.list_events(&token, calendar_id, query, page_ref).await
                })
                .await?;
            events.extend(page.events);

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => {
                    let (full, window_start) = match query {
                        ListQuery::Full { time_min } => (true, Some(*time_min)),
                        ListQuery::Incremental { .. } => (false, None),
                    };
                    return Ok(ChangeSet {
                        events,
                        next_cursor: page.next_sync_token,
                        full,
                        window_start,
                    });
                }
            }
        }

        Err(ProviderError::Permanent(format!(
            "listing {} exceeded {} pages",
            calendar_id, MAX_PAGES
        )))
    }

    pub async fn list_changes(&self, calendar: &CalendarRef, cursor: &str) -> ProviderResult<ChangeSet> {
        self.list_all(
            calendar,
            &ListQuery::Incremental {
                sync_token: cursor.to_string(),
            },
        )
        .await
    }

    pub async fn list_full(
        &self,
        calendar: &CalendarRef,
        time_min: DateTime<Utc>,
    ) -> ProviderResult<ChangeSet> {
        self.list_all(calendar, &ListQuery::Full { time_min }).await
    }

    pub async fn find_by_correlation_id(
        &self,
        calendar: &CalendarRef,
        correlation_id: &str,
    ) -> ProviderResult<Vec<ProviderEvent>> {
        let api = self.api.as_ref();
        let calendar_id = calendar.provider_calendar_id.as_str();
        self.call(EndpointClass::Read, &calendar.account_id, "find_events", move |token| async move {
            api.find_events_by_correlation_id(&token, calendar_id, correlation_id)
                .await
        })
        .await
    }

    /// Create an event tagged with `correlation_id`. Inserts are not
    /// idempotent on the provider, so after an ambiguous failure the
    /// correlation id is looked up before trying again.
    pub async fn create_event(
        &self,
        calendar: &CalendarRef,
        event: &NewEvent,
        correlation_id: &str,
    ) -> ProviderResult<ProviderEvent> {
        let api = self.api.as_ref();
        let calendar_id = calendar.provider_calendar_id.as_str();
        let mut attempt = 0;
        loop {
            let result = self
                .call_with_retries(EndpointClass::Write, &calendar.account_id, "insert_event", 0, move |token| async move {
                    api.insert_event(&token, calendar_id, event).await
                })
                .await;

            match result {
                Ok(created) => return Ok(created),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    if let Ok(found) = self.find_by_correlation_id(calendar, correlation_id).await
                        && let Some(existing) = found.into_iter().next()
                    {
                        tracing::info!(
                            "Insert of {} failed ambiguously but the event exists as {}",
                            correlation_id,
                            existing.id
                        );
                        return Ok(existing);
                    }
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!("Insert of {} failed: {}, retrying in {:?}", correlation_id, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn stamp_metadata(
        &self,
        calendar: &CalendarRef,
        event_id: &str,
        properties: &HashMap<String, String>,
    ) -> ProviderResult<()> {
        let api = self.api.as_ref();
        let calendar_id = calendar.provider_calendar_id.as_str();
        self.call(EndpointClass::Write, &calendar.account_id, "patch_properties", move |token| async move {
            api.patch_private_properties(&token, calendar_id, event_id, properties)
                .await
        })
        .await
    }

    pub async fn update_event_times(
        &self,
        calendar: &CalendarRef,
        event_id: &str,
        start: &EventTime,
        end: &EventTime,
    ) -> ProviderResult<()> {
        let api = self.api.as_ref();
        let calendar_id = calendar.provider_calendar_id.as_str();
        self.call(EndpointClass::Write, &calendar.account_id, "patch_times", move |token| async move {
            api.patch_event_times(&token, calendar_id, event_id, start, end)
                .await
        })
        .await
    }

    /// Deleting an event that is already gone counts as success.
    pub async fn delete_event(&self, calendar: &CalendarRef, event_id: &str) -> ProviderResult<()> {
        let api = self.api.as_ref();
        let calendar_id = calendar.provider_calendar_id.as_str();
        let result = self
            .call(EndpointClass::Write, &calendar.account_id, "delete_event", move |token| async move {
                api.delete_event(&token, calendar_id, event_id).await
            })
            .await;
        match result {
            Err(ProviderError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    pub async fn watch(&self, calendar: &CalendarRef, request: &WatchRequest) -> ProviderResult<Channel> {
        let api = self.api.as_ref();
        let calendar_id = calendar.provider_calendar_id.as_str();
        self.call(EndpointClass::Write, &calendar.account_id, "watch", move |token| async move {
            api.watch(&token, calendar_id, request).await
        })
        .await
    }

    /// Stopping a channel that is already gone counts as success.
    pub async fn stop_channel(
        &self,
        account_id: &str,
        channel_id: &str,
        resource_id: &str,
    ) -> ProviderResult<()> {
        let api = self.api.as_ref();
        let result = self
            .call(EndpointClass::Write, account_id, "stop_channel", move |token| async move {
                api.stop_channel(&token, channel_id, resource_id).await
            })
            .await;
        match result {
            Err(ProviderError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    pub async fn list_calendars(&self, account_id: &str) -> ProviderResult<Vec<ProviderCalendar>> {
        let api = self.api.as_ref();
        self.call(EndpointClass::Read, account_id, "list_calendars", move |token| async move {
            api.list_calendars(&token).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{EventPage, WatchRequest};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers `list_calendars` from a queue of canned results.
    #[derive(Default)]
    struct ScriptedApi {
        responses: Mutex<VecDeque<ProviderResult<Vec<ProviderCalendar>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedApi {
        fn with(responses: Vec<ProviderResult<Vec<ProviderCalendar>>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CalendarApi for ScriptedApi {
        async fn list_events(&self, _: &str, _: &str, _: &ListQuery, _: Option<&str>) -> ProviderResult<EventPage> {
            unimplemented!()
        }
        async fn find_events_by_correlation_id(&self, _: &str, _: &str, _: &str) -> ProviderResult<Vec<ProviderEvent>> {
            unimplemented!()
        }
        async fn insert_event(&self, _: &str, _: &str, _: &NewEvent) -> ProviderResult<ProviderEvent> {
            unimplemented!()
        }
        async fn patch_private_properties(&self, _: &str, _: &str, _: &str, _: &HashMap<String, String>) -> ProviderResult<()> {
            unimplemented!()
        }
        async fn patch_event_times(&self, _: &str, _: &str, _: &str, _: &EventTime, _: &EventTime) -> ProviderResult<()> {
            unimplemented!()
        }
        async fn delete_event(&self, _: &str, _: &str, _: &str) -> ProviderResult<()> {
            unimplemented!()
        }
        async fn watch(&self, _: &str, _: &str, _: &WatchRequest) -> ProviderResult<Channel> {
            unimplemented!()
        }
        async fn stop_channel(&self, _: &str, _: &str, _: &str) -> ProviderResult<()> {
            unimplemented!()
        }
        async fn list_calendars(&self, _: &str) -> ProviderResult<Vec<ProviderCalendar>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    #[derive(Default)]
    struct CountingTokens {
        invalidations: AtomicUsize,
    }

    #[async_trait]
    impl TokenSource for CountingTokens {
        async fn access_token(&self, _: &str) -> ProviderResult<String> {
            Ok("token".to_string())
        }

        async fn invalidate(&self, _: &str) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> AppConfig {
        AppConfig {
            max_retries: 2,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(100),
            breaker_failure_threshold: 3,
            breaker_cooldown: Duration::from_secs(30),
            read_rate_per_sec: 1000.0,
            write_rate_per_sec: 1000.0,
            ..AppConfig::default()
        }
    }

    fn make_client(api: Arc<ScriptedApi>, tokens: Arc<CountingTokens>, config: &AppConfig) -> ProviderClient {
        ProviderClient::new(api, tokens, config)
    }

    fn transient() -> ProviderResult<Vec<ProviderCalendar>> {
        Err(ProviderError::Transient("503".to_string()))
    }

    #[tokio::test(start_paused = true)]
    async fn it_retries_transient_failures() {
        let api = ScriptedApi::with(vec![transient(), transient(), Ok(Vec::new())]);
        let client = make_client(api.clone(), Arc::default(), &config());

        assert!(client.list_calendars("me").await.is_ok());
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn it_gives_up_after_max_retries() {
        let api = ScriptedApi::with(vec![transient(), transient(), transient(), Ok(Vec::new())]);
        let client = make_client(api.clone(), Arc::default(), &config());

        let err = client.list_calendars("me").await.unwrap_err();
        assert!(matches!(err, ProviderError::Transient(_)));
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test]
    async fn it_does_not_retry_permanent_failures() {
        let api = ScriptedApi::with(vec![
            Err(ProviderError::Permanent("400".to_string())),
            Ok(Vec::new()),
        ]);
        let client = make_client(api.clone(), Arc::default(), &config());

        assert!(client.list_calendars("me").await.is_err());
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn it_refreshes_credentials_once() {
        let api = ScriptedApi::with(vec![Err(ProviderError::AuthExpired), Ok(Vec::new())]);
        let tokens = Arc::new(CountingTokens::default());
        let client = make_client(api.clone(), tokens.clone(), &config());
        assert!(client.list_calendars("me").await.is_ok());
        assert_eq!(tokens.invalidations.load(Ordering::SeqCst), 1);

        let api = ScriptedApi::with(vec![Err(ProviderError::AuthExpired), Err(ProviderError::AuthExpired)]);
        let client = make_client(api.clone(), tokens.clone(), &config());
        let err = client.list_calendars("me").await.unwrap_err();
        assert_eq!(err, ProviderError::AuthExpired);
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn it_honors_retry_after() {
        let api = ScriptedApi::with(vec![
            Err(ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(5)),
            }),
            Ok(Vec::new()),
        ]);
        let client = make_client(api.clone(), Arc::default(), &config());

        let started = tokio::time::Instant::now();
        assert!(client.list_calendars("me").await.is_ok());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn it_fails_fast_while_the_circuit_is_open() {
        let config = AppConfig {
            max_retries: 0,
            ..config()
        };
        let api = ScriptedApi::with(vec![transient(), transient(), transient(), Ok(Vec::new())]);
        let client = make_client(api.clone(), Arc::default(), &config);

        for _ in 0..3 {
            assert!(client.list_calendars("me").await.is_err());
        }
        assert_eq!(client.breaker_state(EndpointClass::Read), BreakerState::Open);
        assert_eq!(client.breaker_state(EndpointClass::Write), BreakerState::Closed);

        let err = client.list_calendars("me").await.unwrap_err();
        assert_eq!(err, ProviderError::CircuitOpen(EndpointClass::Read));
        assert_eq!(api.calls(), 3);

        // A trial call after the cool-down closes the circuit again
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(client.list_calendars("me").await.is_ok());
        assert_eq!(client.breaker_state(EndpointClass::Read), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn it_recovers_when_a_trial_call_is_cancelled() {
        let config = AppConfig {
            max_retries: 0,
            breaker_failure_threshold: 1,
            read_rate_per_sec: 0.01,
            ..config()
        };
        let api = ScriptedApi::with(vec![transient(), Ok(Vec::new())]);
        let client = make_client(api.clone(), Arc::default(), &config);

        assert!(client.list_calendars("me").await.is_err());
        assert_eq!(client.breaker_state(EndpointClass::Read), BreakerState::Open);

        // The trial call is dropped while it waits on the rate limiter
        tokio::time::advance(Duration::from_secs(31)).await;
        let cancelled = tokio::time::timeout(Duration::from_secs(1), client.list_calendars("me")).await;
        assert!(cancelled.is_err());
        assert_eq!(api.calls(), 1);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(client.list_calendars("me").await.is_ok());
        assert_eq!(client.breaker_state(EndpointClass::Read), BreakerState::Closed);
        assert_eq!(api.calls(), 2);
    }
}
