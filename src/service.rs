//! Wires the managers together and exposes the operations triggered by
//! notifications, scheduled jobs and the management surfaces.
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{Error, Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use tokio_rusqlite::Connection;

use crate::calendar::db::{
    delete_calendar, disable_missing_calendars, get_calendar, list_sync_enabled, upsert_calendar,
};
use crate::calendar::lock::delete_expired_leases;
use crate::calendar::Calendar;
use crate::core::AppConfig;
use crate::correlation::CorrelationManager;
use crate::google::{GoogleCalendarApi, GoogleTokenManager};
use crate::provider::{CalendarApi, ProviderClient, TokenSource};
use crate::subscription::{NotificationCheck, RenewalSummary, SubscriptionManager};
use crate::sync::{SyncEngine, SyncError, SyncMode, SyncReport};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrphanReport {
    pub reclaimed: usize,
    pub failed_cleaned: usize,
    pub failed_retained: usize,
    pub dangling_purged: usize,
    pub dangling_retained: usize,
    pub leases_cleared: usize,
}

/// A push notification as delivered to the webhook.
#[derive(Debug, Clone)]
pub struct Notification {
    pub channel_id: String,
    pub resource_id: String,
    pub resource_state: String,
    pub message_number: Option<i64>,
    pub channel_token: Option<String>,
}

pub struct SyncService {
    pub db: Connection,
    pub config: AppConfig,
    pub provider: Arc<ProviderClient>,
    pub correlations: Arc<CorrelationManager>,
    pub engine: Arc<SyncEngine>,
    pub subscriptions: Arc<SubscriptionManager>,
    // Calendars that changed while a pass was already running on them
    rerun: Mutex<HashSet<i64>>,
}

impl SyncService {
    pub fn new(
        db: Connection,
        config: AppConfig,
        api: Arc<dyn CalendarApi>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        let provider = Arc::new(ProviderClient::new(api, tokens, &config));
        let correlations = Arc::new(CorrelationManager::new(
            db.clone(),
            provider.clone(),
            config.cache_capacity,
            config.failed_search_window,
        ));
        let engine = Arc::new(SyncEngine::new(
            db.clone(),
            provider.clone(),
            correlations.clone(),
            config.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(
            db.clone(),
            provider.clone(),
            config.clone(),
        ));
        Self {
            db,
            config,
            provider,
            correlations,
            engine,
            subscriptions,
            rerun: Mutex::new(HashSet::new()),
        }
    }

    /// Build the service against the real Google endpoints.
    pub fn google(db: Connection, config: AppConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.provider_timeout)
            .build()?;
        let api = Arc::new(GoogleCalendarApi::new(client.clone(), &config.google_api_url));
        let tokens = Arc::new(GoogleTokenManager::new(db.clone(), client, &config));
        Ok(Self::new(db, config, api, tokens))
    }

    fn take_rerun(&self, calendar_id: i64) -> bool {
        self.rerun
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&calendar_id)
    }

    fn request_rerun(&self, calendar_id: i64) {
        self.rerun
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(calendar_id);
    }

    /// Run an incremental pass. If changes for the calendar arrive while a
    /// pass holds its lease, the holder runs once more before returning so
    /// those changes aren't left for the next scheduled sync.
    pub async fn trigger_sync(&self, calendar_id: i64) -> Result<SyncReport, SyncError> {
        self.sync_until_settled(calendar_id, SyncMode::Incremental).await
    }

    /// Re-list the calendar and reconcile everything, bypassing the cursor.
    pub async fn trigger_full_resync(&self, calendar_id: i64) -> Result<SyncReport, SyncError> {
        self.sync_until_settled(calendar_id, SyncMode::Full).await
    }

    async fn sync_until_settled(&self, calendar_id: i64, mode: SyncMode) -> Result<SyncReport, SyncError> {
        self.take_rerun(calendar_id);
        let mut mode = mode;
        loop {
            match self.engine.sync(calendar_id, mode).await {
                Err(SyncError::LockHeld(id)) => {
                    self.request_rerun(id);
                    return Err(SyncError::LockHeld(id));
                }
                result => {
                    if result.is_ok() && self.take_rerun(calendar_id) {
                        tracing::debug!("Calendar {} changed during the pass, syncing again", calendar_id);
                        mode = SyncMode::Incremental;
                        continue;
                    }
                    return result;
                }
            }
        }
    }

    /// Handle a validated-or-not push notification. Never fails: problems
    /// are logged and counted against the channel.
    pub async fn handle_notification(&self, notification: Notification) {
        let check = self
            .subscriptions
            .accept_notification(
                &notification.channel_id,
                &notification.resource_id,
                notification.channel_token.as_deref(),
                notification.message_number,
            )
            .await;

        let subscription = match check {
            Ok(NotificationCheck::Accepted(subscription)) => subscription,
            Ok(NotificationCheck::Duplicate) => {
                tracing::debug!("Dropping replayed notification on {}", notification.channel_id);
                return;
            }
            Ok(NotificationCheck::Unknown) => {
                tracing::info!("Notification for unknown channel {}", notification.channel_id);
                return;
            }
            Ok(NotificationCheck::Rejected(reason)) => {
                tracing::warn!(
                    "Rejected notification on {}: {}",
                    notification.channel_id,
                    reason
                );
                return;
            }
            Err(e) => {
                tracing::error!("Failed to check notification: {}", e);
                return;
            }
        };

        // The handshake sent when a channel is opened carries no changes
        if notification.resource_state == "sync" {
            return;
        }

        let outcome = match self.trigger_sync(subscription.calendar_id).await {
            Ok(_) => self.subscriptions.record_delivery_success(&subscription.channel_id).await,
            // A pass is already running and will pick the change up
            Err(SyncError::LockHeld(_)) => Ok(()),
            Err(e) => {
                self.subscriptions
                    .record_delivery_failure(&subscription.channel_id, &e.to_string())
                    .await
            }
        };
        if let Err(e) = outcome {
            tracing::error!("Failed to update channel {}: {}", subscription.channel_id, e);
        }
    }

    /// Maintenance: reclaim stale pending placeholders, retry cleanup of
    /// failed ones, purge placeholders whose source is gone and drop
    /// expired leases.
    pub async fn reconcile_orphans(&self) -> Result<OrphanReport, Error> {
        let mut report = OrphanReport {
            reclaimed: self
                .correlations
                .reclaim_orphans(self.config.pending_grace)
                .await?
                .len(),
            ..Default::default()
        };

        let failed = self.correlations.cleanup_failed().await?;
        report.failed_cleaned = failed.cleaned;
        report.failed_retained = failed.retained;

        let dangling = self.correlations.purge_dangling().await?;
        report.dangling_purged = dangling.cleaned;
        report.dangling_retained = dangling.retained;

        report.leases_cleared = delete_expired_leases(&self.db).await?;
        tracing::info!(?report, "Orphan reconciliation complete");
        Ok(report)
    }

    pub async fn renew_expiring_subscriptions(&self) -> Result<RenewalSummary, Error> {
        let summary = self.subscriptions.renew_expiring().await?;
        tracing::info!(?summary, "Subscription maintenance complete");
        Ok(summary)
    }

    /// Calendars due for a pass: polling calendars every time, the rest
    /// once `sync_interval` has passed since their last pass.
    pub async fn due_calendars(&self) -> Result<Vec<Calendar>, Error> {
        let now = Utc::now();
        let interval = chrono::Duration::from_std(self.config.sync_interval)?;
        Ok(list_sync_enabled(&self.db)
            .await?
            .into_iter()
            .filter(|c| {
                c.polling_mode
                    || c.channel_id.is_none()
                    || c.last_synced_at.is_none_or(|at| now - at >= interval)
            })
            .collect())
    }

    /// Run a pass over each calendar concurrently.
    pub async fn sync_calendars(
        self: &Arc<Self>,
        calendars: Vec<Calendar>,
        mode: SyncMode,
    ) -> Vec<(i64, Result<SyncReport, SyncError>)> {
        let mut tasks = tokio::task::JoinSet::new();
        for calendar in calendars {
            let service = self.clone();
            tasks.spawn(async move {
                let result = match mode {
                    SyncMode::Incremental => service.trigger_sync(calendar.id).await,
                    SyncMode::Full => service.trigger_full_resync(calendar.id).await,
                };
                (calendar.id, result)
            });
        }
        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!("Sync task panicked: {}", e),
            }
        }
        results.sort_by_key(|(id, _)| *id);
        results
    }

    /// Refresh the calendars known for an account from the provider.
    /// Calendars that disappeared are disabled and their placeholders
    /// elsewhere removed.
    pub async fn discover_calendars(&self, account_id: &str) -> Result<Vec<Calendar>, Error> {
        let found = self
            .provider
            .list_calendars(account_id)
            .await
            .map_err(|e| anyhow!("Listing calendars for {} failed: {}", account_id, e))?;

        let mut calendars = Vec::new();
        for entry in &found {
            calendars.push(upsert_calendar(&self.db, account_id, &entry.id, &entry.name).await?);
        }
        let present = found.into_iter().map(|c| c.id).collect();
        for calendar in disable_missing_calendars(&self.db, account_id, present).await? {
            tracing::info!("Calendar {} is gone from {}, disabling", calendar.id, account_id);
            self.engine.retire_calendar(&calendar).await?;
            self.subscriptions.remove_for_calendar(&calendar).await?;
        }
        Ok(calendars)
    }

    /// Remove a calendar and everything the system created for it.
    pub async fn delete_calendar(&self, calendar_id: i64) -> Result<SyncReport, Error> {
        let calendar = get_calendar(&self.db, calendar_id)
            .await?
            .ok_or_else(|| anyhow!("Calendar {} not found", calendar_id))?;
        let report = self.engine.retire_calendar(&calendar).await?;
        self.subscriptions.remove_for_calendar(&calendar).await?;
        delete_calendar(&self.db, calendar_id).await?;
        tracing::info!("Deleted calendar {}", calendar_id);
        Ok(report)
    }
}
