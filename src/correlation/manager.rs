use std::sync::Arc;
use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use chrono::Utc;
use tokio_rusqlite::Connection;

use super::cache::CorrelationCache;
use super::db;
use super::{
    Classification, CorrelationId, CorrelationMetadata, EventCorrelationRecord, EventKind,
    LifecycleState,
};
use crate::calendar::Calendar;
use crate::calendar::db::get_calendar;
use crate::provider::{EventTime, ProviderClient, ProviderEvent, ProviderResult};

/// Owns provenance decisions and correlation record lifecycle. Every write
/// to a record goes through here so the classification cache stays
/// coherent with the store.
pub struct CorrelationManager {
    db: Connection,
    provider: Arc<ProviderClient>,
    cache: CorrelationCache,
    failed_search_window: Duration,
}

#[derive(Debug, Default, Clone, PartialEq, serde::Serialize)]
pub struct CleanupReport {
    pub cleaned: usize,
    pub retained: usize,
}

impl CorrelationManager {
    pub fn new(
        db: Connection,
        provider: Arc<ProviderClient>,
        cache_capacity: usize,
        failed_search_window: Duration,
    ) -> Self {
        Self {
            db,
            provider,
            cache: CorrelationCache::new(cache_capacity),
            failed_search_window,
        }
    }

    /// Decide where `event`, observed on `calendar_id`, came from.
    ///
    /// Embedded metadata wins when present. Events without metadata are
    /// matched by provider event id, which covers cancellations (the
    /// provider drops private properties on them) and user events whose
    /// metadata stamp has not landed yet. Any store failure is reported as
    /// `ClassificationError` so callers write nothing.
    pub async fn classify(&self, calendar_id: i64, event: &ProviderEvent) -> Classification {
        let Some(metadata) = CorrelationMetadata::from_properties(&event.private_properties) else {
            return match db::find_by_provider_event_id(&self.db, calendar_id, &event.id).await {
                Ok(Some(record)) => self.classify_record(record),
                Ok(None) => Classification::NewForeignEvent,
                Err(e) => Classification::ClassificationError(e.to_string()),
            };
        };

        if self.cache.get(&metadata.id) == Some(true) {
            return Classification::OwnedBySystem(metadata.id);
        }

        match db::find_by_correlation_id(&self.db, &metadata.id).await {
            Ok(Some(record)) => {
                self.cache
                    .insert(record.correlation_id.clone(), record.created_by_system);
                self.classify_record(record)
            }
            Ok(None) => Classification::ExternalPeerSystemEvent(metadata.id),
            Err(e) => Classification::ClassificationError(e.to_string()),
        }
    }

    fn classify_record(&self, record: EventCorrelationRecord) -> Classification {
        if record.created_by_system {
            Classification::OwnedBySystem(record.correlation_id)
        } else {
            Classification::ForeignTrackedEvent(record)
        }
    }

    pub async fn get(&self, correlation_id: &CorrelationId) -> Result<Option<EventCorrelationRecord>, Error> {
        db::find_by_correlation_id(&self.db, correlation_id).await
    }

    /// Track a busy user event seen for the first time. The record is
    /// written before anything else happens; the metadata stamp on the
    /// provider event follows in the background and is best effort.
    pub async fn record_new_foreign_event(
        &self,
        calendar: &Calendar,
        event: &ProviderEvent,
    ) -> Result<EventCorrelationRecord, Error> {
        let now = Utc::now();
        let record = EventCorrelationRecord {
            correlation_id: CorrelationId::generate(),
            calendar_id: calendar.id,
            provider_event_id: Some(event.id.clone()),
            kind: EventKind::UserEvent,
            created_by_system: false,
            source_correlation_id: None,
            lifecycle_state: LifecycleState::Materialized,
            title: event.summary.clone(),
            start: event.start.clone(),
            end: event.end.clone(),
            created_at: now,
            last_observed_at: now,
        };
        db::insert_record(&self.db, record.clone()).await?;
        self.cache.invalidate(&record.correlation_id);

        let provider = self.provider.clone();
        let calendar_ref = calendar.provider_ref();
        let event_id = event.id.clone();
        let mut properties = event.private_properties.clone();
        properties.extend(CorrelationMetadata::user_event(record.correlation_id.clone()).to_properties());
        tokio::spawn(async move {
            if let Err(e) = provider
                .stamp_metadata(&calendar_ref, &event_id, &properties)
                .await
            {
                tracing::warn!(
                    "Failed to stamp correlation metadata on {}: {}",
                    event_id,
                    e
                );
            }
        });

        Ok(record)
    }

    /// Write the `Pending` record for a placeholder before the provider
    /// create is attempted.
    pub async fn begin_placeholder(
        &self,
        target: &Calendar,
        source_correlation_id: &CorrelationId,
        title: &str,
        start: Option<EventTime>,
        end: Option<EventTime>,
    ) -> Result<EventCorrelationRecord, Error> {
        let now = Utc::now();
        let record = EventCorrelationRecord {
            correlation_id: CorrelationId::generate(),
            calendar_id: target.id,
            provider_event_id: None,
            kind: EventKind::PlaceholderBlock,
            created_by_system: true,
            source_correlation_id: Some(source_correlation_id.clone()),
            lifecycle_state: LifecycleState::Pending,
            title: Some(title.to_string()),
            start,
            end,
            created_at: now,
            last_observed_at: now,
        };
        db::insert_record(&self.db, record.clone()).await?;
        self.cache.invalidate(&record.correlation_id);
        Ok(record)
    }

    pub async fn materialize_placeholder(
        &self,
        correlation_id: &CorrelationId,
        provider_event_id: &str,
    ) -> Result<(), Error> {
        db::set_materialized(&self.db, correlation_id, provider_event_id, Utc::now()).await?;
        self.cache.invalidate(correlation_id);
        Ok(())
    }

    pub async fn fail_placeholder(&self, correlation_id: &CorrelationId) -> Result<(), Error> {
        self.set_state(correlation_id, LifecycleState::Failed).await
    }

    pub async fn mark_stale(&self, correlation_id: &CorrelationId) -> Result<(), Error> {
        self.set_state(correlation_id, LifecycleState::Stale).await
    }

    async fn set_state(&self, correlation_id: &CorrelationId, state: LifecycleState) -> Result<(), Error> {
        db::set_state(&self.db, correlation_id, state).await?;
        self.cache.invalidate(correlation_id);
        Ok(())
    }

    pub async fn update_times(
        &self,
        correlation_id: &CorrelationId,
        start: Option<EventTime>,
        end: Option<EventTime>,
    ) -> Result<(), Error> {
        db::update_times(&self.db, correlation_id, start, end).await?;
        self.cache.invalidate(correlation_id);
        Ok(())
    }

    pub async fn refresh_observed(&self, correlation_ids: Vec<CorrelationId>) -> Result<(), Error> {
        db::touch_observed(&self.db, correlation_ids, Utc::now()).await
    }

    /// Drop a record entirely.
    pub async fn forget(&self, correlation_id: &CorrelationId) -> Result<(), Error> {
        db::delete_record(&self.db, correlation_id).await?;
        self.cache.invalidate(correlation_id);
        Ok(())
    }

    pub async fn find_live_placeholder(
        &self,
        target_calendar_id: i64,
        source: &CorrelationId,
    ) -> Result<Option<EventCorrelationRecord>, Error> {
        let placeholders = db::list_placeholders_for_source(&self.db, source).await?;
        Ok(placeholders
            .into_iter()
            .find(|p| p.calendar_id == target_calendar_id && p.is_live_placeholder()))
    }

    pub async fn placeholders_for(&self, source: &CorrelationId) -> Result<Vec<EventCorrelationRecord>, Error> {
        db::list_placeholders_for_source(&self.db, source).await
    }

    pub async fn records_for_calendar(&self, calendar_id: i64) -> Result<Vec<EventCorrelationRecord>, Error> {
        db::list_records_for_calendar(&self.db, calendar_id).await
    }

    /// Move `Pending` records older than `max_age` to `Failed`. Their
    /// provider side is cleaned up by [`Self::cleanup_failed`].
    pub async fn reclaim_orphans(&self, max_age: Duration) -> Result<Vec<EventCorrelationRecord>, Error> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age)?;
        let reclaimed = db::fail_pending_before(&self.db, cutoff).await?;
        for record in &reclaimed {
            self.cache.invalidate(&record.correlation_id);
            tracing::info!(
                "Reclaimed pending placeholder {} on calendar {}",
                record.correlation_id,
                record.calendar_id
            );
        }
        Ok(reclaimed)
    }

    /// Remove the provider event behind a record. Events whose creation
    /// was never confirmed are found through their correlation id.
    ///
    /// Returns `false` when no provider event could be found for an
    /// unconfirmed record. The create may still surface once the provider's
    /// listing catches up, so the record must be kept until it does.
    pub async fn delete_provider_side(&self, record: &EventCorrelationRecord) -> Result<bool, Error> {
        let calendar = get_calendar(&self.db, record.calendar_id)
            .await?
            .ok_or_else(|| anyhow!("Calendar {} not found", record.calendar_id))?;
        self.delete_on_calendar(&calendar, record)
            .await
            .map_err(|e| anyhow!("Cleanup of {} failed: {}", record.correlation_id, e))
    }

    async fn delete_on_calendar(&self, calendar: &Calendar, record: &EventCorrelationRecord) -> ProviderResult<bool> {
        let calendar_ref = calendar.provider_ref();
        if let Some(event_id) = &record.provider_event_id {
            self.provider.delete_event(&calendar_ref, event_id).await?;
            return Ok(true);
        }
        let found = self
            .provider
            .find_by_correlation_id(&calendar_ref, record.correlation_id.as_str())
            .await?;
        for event in &found {
            self.provider.delete_event(&calendar_ref, &event.id).await?;
        }
        Ok(!found.is_empty())
    }

    /// Retry provider cleanup for every `Failed` placeholder and drop the
    /// records that are fully cleaned up.
    pub async fn cleanup_failed(&self) -> Result<CleanupReport, Error> {
        let failed = db::list_by_state(&self.db, LifecycleState::Failed).await?;
        self.cleanup_records(failed).await
    }

    /// Placeholders whose source record is gone are deleted from the
    /// provider and purged.
    pub async fn purge_dangling(&self) -> Result<CleanupReport, Error> {
        let dangling = db::list_dangling_placeholders(&self.db).await?;
        self.cleanup_records(dangling).await
    }

    async fn cleanup_records(&self, records: Vec<EventCorrelationRecord>) -> Result<CleanupReport, Error> {
        let mut report = CleanupReport::default();
        for record in records {
            if record.kind != EventKind::PlaceholderBlock {
                // Failed user records have nothing on the provider to undo
                self.forget(&record.correlation_id).await?;
                report.cleaned += 1;
                continue;
            }
            match self.delete_provider_side(&record).await {
                Ok(true) => {
                    self.forget(&record.correlation_id).await?;
                    report.cleaned += 1;
                }
                Ok(false) if self.search_expired(&record) => {
                    tracing::info!(
                        "Giving up on placeholder {}: never found on calendar {}",
                        record.correlation_id,
                        record.calendar_id
                    );
                    self.forget(&record.correlation_id).await?;
                    report.cleaned += 1;
                }
                Ok(false) => {
                    tracing::debug!(
                        "Placeholder {} not found yet, retrying later",
                        record.correlation_id
                    );
                    report.retained += 1;
                }
                Err(e) => {
                    tracing::warn!("{}", e);
                    report.retained += 1;
                }
            }
        }
        Ok(report)
    }

    fn search_expired(&self, record: &EventCorrelationRecord) -> bool {
        let age = Utc::now().signed_duration_since(record.created_at);
        age.to_std().is_ok_and(|age| age >= self.failed_search_window)
    }
}
