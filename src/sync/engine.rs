use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Error, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio_rusqlite::Connection;

use super::{SyncError, SyncMode, SyncPhase, SyncReport};
use crate::calendar::Calendar;
use crate::calendar::db::{get_calendar, list_targets, set_sync_cursor};
use crate::calendar::lock::CalendarLease;
use crate::core::AppConfig;
use crate::correlation::{
    Classification, CorrelationId, CorrelationManager, CorrelationMetadata,
    EventCorrelationRecord, EventKind, LifecycleState,
};
use crate::provider::{ChangeSet, NewEvent, ProviderClient, ProviderError, ProviderEvent};

enum PlaceholderOutcome {
    Created,
    Present,
    Failed(String),
}

pub struct SyncEngine {
    db: Connection,
    provider: Arc<ProviderClient>,
    correlations: Arc<CorrelationManager>,
    config: AppConfig,
}

impl SyncEngine {
    pub fn new(
        db: Connection,
        provider: Arc<ProviderClient>,
        correlations: Arc<CorrelationManager>,
        config: AppConfig,
    ) -> Self {
        Self {
            db,
            provider,
            correlations,
            config,
        }
    }

    /// Run one pass over `calendar_id`. At most one pass per calendar runs
    /// at a time; a pass that outlives its budget is abandoned and its
    /// cursor left where it was so the next pass sees the same changes.
    pub async fn sync(&self, calendar_id: i64, mode: SyncMode) -> Result<SyncReport, SyncError> {
        let calendar = get_calendar(&self.db, calendar_id)
            .await
            .map_err(SyncError::store)?
            .ok_or(SyncError::CalendarNotFound(calendar_id))?;
        if !calendar.sync_enabled {
            return Err(SyncError::CalendarDisabled(calendar_id));
        }

        let lease = CalendarLease::acquire(&self.db, calendar_id, self.config.lock_lease)
            .await
            .map_err(SyncError::store)?
            .ok_or(SyncError::LockHeld(calendar_id))?;

        let mut report = SyncReport::new(calendar_id);
        let budget = self.config.sync_pass_budget;
        let outcome =
            tokio::time::timeout(budget, self.run_pass(&calendar, mode, &mut report)).await;

        if let Err(e) = lease.release().await {
            tracing::warn!("Failed to release lease on calendar {}: {}", calendar_id, e);
        }

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(SyncError::BudgetExceeded(budget)),
        };
        match result {
            Ok(()) => {
                tracing::info!(
                    calendar_id,
                    fetched = report.fetched,
                    recorded = report.recorded,
                    created = report.placeholders_created,
                    deleted = report.placeholders_deleted,
                    failures = report.placeholder_failures,
                    "Sync pass complete"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(
                    calendar_id,
                    phase = ?report.phase,
                    "Sync pass failed: {}",
                    e
                );
                self.enter(&mut report, SyncPhase::Errored);
                Err(e)
            }
        }
    }

    fn enter(&self, report: &mut SyncReport, phase: SyncPhase) {
        tracing::debug!(calendar_id = report.calendar_id, ?phase, "Sync phase");
        report.phase = phase;
    }

    async fn run_pass(
        &self,
        calendar: &Calendar,
        mode: SyncMode,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        self.enter(report, SyncPhase::Fetching);
        let listed_at = Utc::now();
        let changes = self.fetch(calendar, mode, report).await?;
        report.full_listing = changes.full;
        let ChangeSet {
            events,
            next_cursor,
            full,
            window_start,
        } = changes;
        let events = dedupe(events);
        report.fetched = events.len();

        // Classification is read-only so a failure here leaves nothing
        // half-applied
        self.enter(report, SyncPhase::Classifying);
        let mut observed: Vec<CorrelationId> = Vec::new();
        let mut new_events = Vec::new();
        let mut tracked = Vec::new();
        let mut owned_cancelled = Vec::new();
        for event in events {
            match self.correlations.classify(calendar.id, &event).await {
                Classification::NewForeignEvent if event.is_busy() => new_events.push(event),
                Classification::NewForeignEvent => report.ignored += 1,
                Classification::OwnedBySystem(id) => {
                    report.skipped_owned += 1;
                    if event.is_cancelled() {
                        owned_cancelled.push(id);
                    } else {
                        observed.push(id);
                    }
                }
                Classification::ForeignTrackedEvent(record) => {
                    observed.push(record.correlation_id.clone());
                    tracked.push((record, event));
                }
                Classification::ExternalPeerSystemEvent(id) => {
                    tracing::debug!("Skipping {} owned by another instance ({})", event.id, id);
                    report.skipped_peer += 1;
                }
                Classification::ClassificationError(e) => {
                    return Err(SyncError::Classification(e));
                }
            }
        }

        self.enter(report, SyncPhase::Reconciling);
        let targets = list_targets(&self.db, calendar)
            .await
            .map_err(SyncError::store)?;

        let mut sources = Vec::new();
        for event in new_events {
            let record = self
                .correlations
                .record_new_foreign_event(calendar, &event)
                .await
                .map_err(SyncError::store)?;
            report.recorded += 1;
            observed.push(record.correlation_id.clone());
            sources.push(record);
        }

        for (record, event) in tracked {
            if event.is_cancelled() {
                self.retire_source(&record, report)
                    .await
                    .map_err(SyncError::store)?;
                report.removed += 1;
            } else if !event.is_busy() {
                // Now shows as free: drop the placeholders but keep tracking
                self.remove_placeholders(&record, report)
                    .await
                    .map_err(SyncError::store)?;
            } else {
                let record = self
                    .refresh_times(record, &event, report)
                    .await
                    .map_err(SyncError::store)?;
                sources.push(record);
            }
        }

        // Someone deleted one of our placeholders. Forgetting it lets the
        // next full pass recreate it.
        for id in owned_cancelled {
            self.correlations
                .forget(&id)
                .await
                .map_err(SyncError::store)?;
        }

        for source in &sources {
            self.ensure_placeholders(source, &targets, report).await;
        }

        if full {
            let observed_set: HashSet<&CorrelationId> = observed.iter().collect();
            self.sweep_unobserved(calendar, &observed_set, window_start, listed_at, report)
                .await
                .map_err(SyncError::store)?;
        }

        self.correlations
            .refresh_observed(observed)
            .await
            .map_err(SyncError::store)?;

        let cursor = match next_cursor {
            Some(cursor) => Some(cursor),
            None if full || report.cursor_reset => None,
            None => calendar.sync_cursor.clone(),
        };
        set_sync_cursor(&self.db, calendar.id, cursor, Utc::now())
            .await
            .map_err(SyncError::store)?;

        self.enter(report, SyncPhase::Complete);
        Ok(())
    }

    async fn fetch(
        &self,
        calendar: &Calendar,
        mode: SyncMode,
        report: &mut SyncReport,
    ) -> Result<ChangeSet, SyncError> {
        let calendar_ref = calendar.provider_ref();
        let window_start = Utc::now() - chrono::Duration::days(self.config.full_sync_lookback_days);

        match (mode, &calendar.sync_cursor) {
            (SyncMode::Incremental, Some(cursor)) => {
                match self.provider.list_changes(&calendar_ref, cursor).await {
                    Ok(changes) => Ok(changes),
                    Err(ProviderError::CursorInvalidated) => {
                        tracing::warn!(
                            "Cursor for calendar {} was invalidated, falling back to a full listing",
                            calendar.id
                        );
                        report.cursor_reset = true;
                        Ok(self.provider.list_full(&calendar_ref, window_start).await?)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            _ => Ok(self.provider.list_full(&calendar_ref, window_start).await?),
        }
    }

    async fn refresh_times(
        &self,
        mut record: EventCorrelationRecord,
        event: &ProviderEvent,
        report: &mut SyncReport,
    ) -> Result<EventCorrelationRecord, Error> {
        if record.start == event.start && record.end == event.end {
            return Ok(record);
        }
        self.correlations
            .update_times(&record.correlation_id, event.start.clone(), event.end.clone())
            .await?;
        record.start = event.start.clone();
        record.end = event.end.clone();
        report.updated += 1;

        let (Some(start), Some(end)) = (&event.start, &event.end) else {
            return Ok(record);
        };
        for placeholder in self.correlations.placeholders_for(&record.correlation_id).await? {
            let Some(event_id) = placeholder
                .provider_event_id
                .as_deref()
                .filter(|_| placeholder.lifecycle_state == LifecycleState::Materialized)
            else {
                continue;
            };
            let Some(target) = get_calendar(&self.db, placeholder.calendar_id).await? else {
                continue;
            };
            match self
                .provider
                .update_event_times(&target.provider_ref(), event_id, start, end)
                .await
            {
                Ok(()) => {
                    self.correlations
                        .update_times(
                            &placeholder.correlation_id,
                            Some(start.clone()),
                            Some(end.clone()),
                        )
                        .await?;
                    report.placeholders_updated += 1;
                }
                Err(e) => {
                    report.placeholder_failures += 1;
                    report
                        .errors
                        .push(format!("calendar {}: {}", target.id, e));
                }
            }
        }
        Ok(record)
    }

    /// Make sure every target holds a live placeholder for `source`.
    /// Targets are handled concurrently and a failure on one never affects
    /// the others.
    async fn ensure_placeholders(
        &self,
        source: &EventCorrelationRecord,
        targets: &[Calendar],
        report: &mut SyncReport,
    ) {
        let outcomes = join_all(
            targets
                .iter()
                .map(|target| self.ensure_placeholder(target, source)),
        )
        .await;

        for (target, outcome) in targets.iter().zip(outcomes) {
            match outcome {
                PlaceholderOutcome::Created => report.placeholders_created += 1,
                PlaceholderOutcome::Present => {}
                PlaceholderOutcome::Failed(e) => {
                    report.placeholder_failures += 1;
                    report.errors.push(format!("calendar {}: {}", target.id, e));
                }
            }
        }
    }

    async fn ensure_placeholder(
        &self,
        target: &Calendar,
        source: &EventCorrelationRecord,
    ) -> PlaceholderOutcome {
        let (Some(start), Some(end)) = (source.start.clone(), source.end.clone()) else {
            return PlaceholderOutcome::Failed(format!(
                "source {} has no times",
                source.correlation_id
            ));
        };

        match self
            .correlations
            .find_live_placeholder(target.id, &source.correlation_id)
            .await
        {
            Ok(Some(_)) => return PlaceholderOutcome::Present,
            Ok(None) => {}
            Err(e) => return PlaceholderOutcome::Failed(e.to_string()),
        }

        let title = self.config.placeholder_title.clone();
        let record = match self
            .correlations
            .begin_placeholder(
                target,
                &source.correlation_id,
                &title,
                Some(start.clone()),
                Some(end.clone()),
            )
            .await
        {
            Ok(record) => record,
            Err(e) => return PlaceholderOutcome::Failed(e.to_string()),
        };

        let new_event = NewEvent {
            summary: title,
            start,
            end,
            private_properties: CorrelationMetadata::placeholder(
                record.correlation_id.clone(),
                source.correlation_id.clone(),
            )
            .to_properties(),
        };

        match self
            .provider
            .create_event(&target.provider_ref(), &new_event, record.correlation_id.as_str())
            .await
        {
            Ok(created) => match self
                .correlations
                .materialize_placeholder(&record.correlation_id, &created.id)
                .await
            {
                Ok(()) => PlaceholderOutcome::Created,
                // Left pending; the orphan sweep finds the event by its id
                Err(e) => PlaceholderOutcome::Failed(e.to_string()),
            },
            Err(e) => {
                tracing::warn!(
                    "Creating placeholder {} on calendar {} failed: {}",
                    record.correlation_id,
                    target.id,
                    e
                );
                if let Err(store_err) = self.correlations.fail_placeholder(&record.correlation_id).await {
                    return PlaceholderOutcome::Failed(format!("{}; {}", e, store_err));
                }
                match self.correlations.delete_provider_side(&record).await {
                    Ok(true) => {
                        if let Err(forget_err) = self.correlations.forget(&record.correlation_id).await {
                            tracing::warn!("{}", forget_err);
                        }
                    }
                    // The create may have landed without showing up in listings yet
                    Ok(false) => {
                        tracing::debug!(
                            "Placeholder {} not found after failed create, keeping it for maintenance",
                            record.correlation_id
                        );
                    }
                    Err(cleanup_err) => {
                        tracing::debug!("Deferring cleanup to maintenance: {}", cleanup_err);
                    }
                }
                PlaceholderOutcome::Failed(e.to_string())
            }
        }
    }

    async fn delete_placeholder(
        &self,
        placeholder: &EventCorrelationRecord,
        report: &mut SyncReport,
    ) -> Result<(), Error> {
        match self.correlations.delete_provider_side(placeholder).await {
            Ok(true) => {
                self.correlations.forget(&placeholder.correlation_id).await?;
                report.placeholders_deleted += 1;
            }
            Ok(false) => {
                // Never confirmed and not listed yet; maintenance keeps searching
                self.correlations.fail_placeholder(&placeholder.correlation_id).await?;
            }
            Err(e) => {
                // Purged by the dangling placeholder sweep later
                tracing::warn!("{}", e);
                self.correlations.mark_stale(&placeholder.correlation_id).await?;
                report.placeholder_failures += 1;
                report.errors.push(e.to_string());
            }
        }
        Ok(())
    }

    async fn remove_placeholders(
        &self,
        source: &EventCorrelationRecord,
        report: &mut SyncReport,
    ) -> Result<(), Error> {
        for placeholder in self.correlations.placeholders_for(&source.correlation_id).await? {
            self.delete_placeholder(&placeholder, report).await?;
        }
        Ok(())
    }

    /// The source event is gone: remove its placeholders everywhere and
    /// stop tracking it.
    async fn retire_source(
        &self,
        source: &EventCorrelationRecord,
        report: &mut SyncReport,
    ) -> Result<(), Error> {
        self.remove_placeholders(source, report).await?;
        self.correlations.forget(&source.correlation_id).await
    }

    /// After a full listing, tracked events inside the window that were
    /// not seen no longer exist.
    async fn sweep_unobserved(
        &self,
        calendar: &Calendar,
        observed: &HashSet<&CorrelationId>,
        window_start: Option<DateTime<Utc>>,
        listed_at: DateTime<Utc>,
        report: &mut SyncReport,
    ) -> Result<(), Error> {
        for record in self.correlations.records_for_calendar(calendar.id).await? {
            // Materialized by a concurrent pass after the listing was taken
            if record.last_observed_at >= listed_at {
                continue;
            }
            if observed.contains(&record.correlation_id)
                || !matches!(
                    record.lifecycle_state,
                    LifecycleState::Materialized | LifecycleState::Stale
                )
            {
                continue;
            }
            let in_window = match (&record.end, window_start) {
                (Some(end), Some(window_start)) => end.as_utc() >= window_start,
                _ => true,
            };
            if !in_window {
                continue;
            }

            tracing::info!(
                "{} {} was not seen on a full listing of calendar {}",
                record.kind.as_str(),
                record.correlation_id,
                calendar.id
            );
            self.correlations.mark_stale(&record.correlation_id).await?;
            report.stale += 1;
            match record.kind {
                EventKind::UserEvent => self.retire_source(&record, report).await?,
                EventKind::PlaceholderBlock => {
                    self.correlations.forget(&record.correlation_id).await?
                }
            }
        }
        Ok(())
    }

    /// Undo everything the system did on behalf of `calendar` before it is
    /// removed: placeholders sourced from it elsewhere and placeholders
    /// it holds. Provider failures are logged and skipped.
    pub async fn retire_calendar(&self, calendar: &Calendar) -> Result<SyncReport, Error> {
        let mut report = SyncReport::new(calendar.id);
        for record in self.correlations.records_for_calendar(calendar.id).await? {
            match record.kind {
                EventKind::UserEvent => self.retire_source(&record, &mut report).await?,
                EventKind::PlaceholderBlock => {
                    match self.correlations.delete_provider_side(&record).await {
                        Ok(true) => report.placeholders_deleted += 1,
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!("{}", e);
                            report.errors.push(e.to_string());
                        }
                    }
                    self.correlations.forget(&record.correlation_id).await?;
                }
            }
        }
        Ok(report)
    }
}

/// Listings can repeat an event across pages; the last copy wins.
fn dedupe(events: Vec<ProviderEvent>) -> Vec<ProviderEvent> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<ProviderEvent> = Vec::with_capacity(events.len());
    for event in events {
        match index.get(&event.id) {
            Some(&i) => unique[i] = event,
            None => {
                index.insert(event.id.clone(), unique.len());
                unique.push(event);
            }
        }
    }
    unique
}
