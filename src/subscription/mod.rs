//! Push notification channels per calendar: creation, renewal ahead of
//! expiry, suspension after repeated failures and garbage collection.
//! Calendars without a working channel fall back to polling.

pub mod db;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::calendar::Calendar;
use crate::calendar::db::{get_calendar, list_sync_enabled, set_channel, set_polling_mode};
use crate::core::AppConfig;
use crate::provider::{ProviderClient, WatchRequest};
use crate::resilience::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubscriptionStatus {
    Active,
    Suspended,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "Active",
            SubscriptionStatus::Suspended => "Suspended",
            SubscriptionStatus::Expired => "Expired",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Active" => Ok(SubscriptionStatus::Active),
            "Suspended" => Ok(SubscriptionStatus::Suspended),
            "Expired" => Ok(SubscriptionStatus::Expired),
            other => Err(format!("unknown subscription status {}", other)),
        }
    }
}

crate::core::db::sql_text_enum!(SubscriptionStatus);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushSubscription {
    pub channel_id: String,
    pub calendar_id: i64,
    pub resource_id: String,
    pub expires_at: DateTime<Utc>,
    pub failure_count: u32,
    pub status: SubscriptionStatus,
    pub suspended_reason: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_message_number: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenewOutcome {
    NotDue,
    Renewed(PushSubscription),
    Deferred {
        failures: u32,
        next_attempt_at: DateTime<Utc>,
    },
    Suspended,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationCheck {
    Accepted(PushSubscription),
    Duplicate,
    Unknown,
    Rejected(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenewalSummary {
    pub renewed: usize,
    pub deferred: usize,
    pub suspended: usize,
    pub created: usize,
    pub failed: usize,
    pub collected: usize,
}

pub struct SubscriptionManager {
    db: Connection,
    provider: Arc<ProviderClient>,
    config: AppConfig,
    backoff: Backoff,
}

impl SubscriptionManager {
    pub fn new(db: Connection, provider: Arc<ProviderClient>, config: AppConfig) -> Self {
        // Renewal attempts back off on a much coarser scale than requests
        let backoff = Backoff::new(
            std::time::Duration::from_secs(60),
            config.renewal_buffer / 4,
        );
        Self {
            db,
            provider,
            config,
            backoff,
        }
    }

    /// Open a channel for `calendar`. On failure the calendar is put into
    /// polling mode and the error returned.
    pub async fn create(&self, calendar: &Calendar) -> Result<PushSubscription, Error> {
        let request = WatchRequest {
            channel_id: Uuid::new_v4().to_string(),
            address: self.config.webhook_url.clone(),
            token: self.config.channel_token.clone(),
            ttl: self.config.subscription_ttl,
        };

        let channel = match self.provider.watch(&calendar.provider_ref(), &request).await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(
                    "Could not subscribe to calendar {}, polling instead: {}",
                    calendar.id,
                    e
                );
                set_polling_mode(&self.db, calendar.id, true).await?;
                return Err(anyhow!("Watch for calendar {} failed: {}", calendar.id, e));
            }
        };

        let subscription = PushSubscription {
            channel_id: channel.channel_id,
            calendar_id: calendar.id,
            resource_id: channel.resource_id,
            expires_at: channel.expires_at,
            failure_count: 0,
            status: SubscriptionStatus::Active,
            suspended_reason: None,
            next_attempt_at: None,
            last_message_number: 0,
        };
        db::insert_subscription(&self.db, subscription.clone()).await?;
        set_channel(&self.db, calendar.id, Some(subscription.channel_id.clone())).await?;
        set_polling_mode(&self.db, calendar.id, false).await?;
        tracing::info!(
            "Subscribed to calendar {} with channel {} until {}",
            calendar.id,
            subscription.channel_id,
            subscription.expires_at
        );
        Ok(subscription)
    }

    fn is_due(&self, subscription: &PushSubscription, now: DateTime<Utc>) -> bool {
        let buffer = chrono::Duration::from_std(self.config.renewal_buffer)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        subscription.expires_at - now <= buffer
            && subscription.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Replace a channel that is close to expiry. The new channel is opened
    /// before the old one is stopped so coverage never lapses.
    pub async fn renew(&self, subscription: &PushSubscription) -> Result<RenewOutcome, Error> {
        let now = Utc::now();
        if subscription.status != SubscriptionStatus::Active || !self.is_due(subscription, now) {
            return Ok(RenewOutcome::NotDue);
        }

        let calendar = match get_calendar(&self.db, subscription.calendar_id).await? {
            Some(calendar) if calendar.sync_enabled => calendar,
            _ => {
                db::set_status(
                    &self.db,
                    &subscription.channel_id,
                    SubscriptionStatus::Expired,
                    None,
                )
                .await?;
                return Ok(RenewOutcome::NotDue);
            }
        };

        match self.create(&calendar).await {
            Ok(renewed) => {
                self.retire(subscription).await?;
                Ok(RenewOutcome::Renewed(renewed))
            }
            Err(e) => {
                let failures = subscription.failure_count + 1;
                if failures >= self.config.subscription_failure_threshold {
                    self.suspend(subscription, &format!("renewal failed {} times: {}", failures, e))
                        .await?;
                    return Ok(RenewOutcome::Suspended);
                }
                let delay = chrono::Duration::from_std(self.backoff.delay(failures - 1))?;
                let next_attempt_at = now + delay;
                db::set_failures(&self.db, &subscription.channel_id, failures, Some(next_attempt_at))
                    .await?;
                // The old channel is still live until it expires
                set_polling_mode(&self.db, calendar.id, false).await?;
                Ok(RenewOutcome::Deferred {
                    failures,
                    next_attempt_at,
                })
            }
        }
    }

    async fn retire(&self, subscription: &PushSubscription) -> Result<(), Error> {
        db::set_status(
            &self.db,
            &subscription.channel_id,
            SubscriptionStatus::Expired,
            None,
        )
        .await?;
        if let Some(calendar) = get_calendar(&self.db, subscription.calendar_id).await? {
            match self
                .provider
                .stop_channel(
                    &calendar.account_id,
                    &subscription.channel_id,
                    &subscription.resource_id,
                )
                .await
            {
                Ok(()) => db::delete_subscription(&self.db, &subscription.channel_id).await?,
                Err(e) => tracing::warn!(
                    "Failed to stop channel {}, leaving it to expire: {}",
                    subscription.channel_id,
                    e
                ),
            }
        }
        Ok(())
    }

    /// Stop relying on a channel. The calendar is polled until a new
    /// subscription is created.
    pub async fn suspend(&self, subscription: &PushSubscription, reason: &str) -> Result<(), Error> {
        tracing::warn!(
            "Suspending channel {} for calendar {}: {}",
            subscription.channel_id,
            subscription.calendar_id,
            reason
        );
        db::set_status(
            &self.db,
            &subscription.channel_id,
            SubscriptionStatus::Suspended,
            Some(reason.to_string()),
        )
        .await?;
        set_polling_mode(&self.db, subscription.calendar_id, true).await?;
        if let Some(calendar) = get_calendar(&self.db, subscription.calendar_id).await?
            && calendar.channel_id.as_deref() == Some(subscription.channel_id.as_str())
        {
            set_channel(&self.db, calendar.id, None).await?;
        }
        Ok(())
    }

    /// Expire lapsed channels and remove suspended or expired ones, along
    /// with channels of calendars that are no longer synced.
    pub async fn gc(&self) -> Result<usize, Error> {
        db::expire_lapsed(&self.db, Utc::now()).await?;

        let mut collected = 0;
        for subscription in db::list_subscriptions(&self.db).await? {
            let calendar = get_calendar(&self.db, subscription.calendar_id).await?;
            let calendar_enabled = calendar.as_ref().is_some_and(|c| c.sync_enabled);
            if subscription.status == SubscriptionStatus::Active && calendar_enabled {
                continue;
            }

            let stopped = match &calendar {
                Some(calendar) => self
                    .provider
                    .stop_channel(
                        &calendar.account_id,
                        &subscription.channel_id,
                        &subscription.resource_id,
                    )
                    .await
                    .map_err(|e| e.to_string()),
                None => Ok(()),
            };
            match stopped {
                Ok(()) => {}
                // Lapsed channels are already gone on the provider side
                Err(_) if subscription.status == SubscriptionStatus::Expired => {}
                Err(e) => {
                    tracing::warn!(
                        "Keeping channel {} until it can be stopped: {}",
                        subscription.channel_id,
                        e
                    );
                    continue;
                }
            }

            db::delete_subscription(&self.db, &subscription.channel_id).await?;
            if let Some(calendar) = calendar
                && calendar.channel_id.as_deref() == Some(subscription.channel_id.as_str())
            {
                set_channel(&self.db, calendar.id, None).await?;
            }
            collected += 1;
        }
        Ok(collected)
    }

    /// Renew channels close to expiry, subscribe calendars that have no
    /// active channel and collect dead channels.
    pub async fn renew_expiring(&self) -> Result<RenewalSummary, Error> {
        let mut summary = RenewalSummary::default();

        for subscription in db::list_by_status(&self.db, SubscriptionStatus::Active).await? {
            match self.renew(&subscription).await {
                Ok(RenewOutcome::NotDue) => {}
                Ok(RenewOutcome::Renewed(_)) => summary.renewed += 1,
                Ok(RenewOutcome::Deferred { .. }) => summary.deferred += 1,
                Ok(RenewOutcome::Suspended) => summary.suspended += 1,
                Err(e) => {
                    tracing::error!("Renewing {} failed: {}", subscription.channel_id, e);
                    summary.failed += 1;
                }
            }
        }

        let active = db::list_by_status(&self.db, SubscriptionStatus::Active).await?;
        for calendar in list_sync_enabled(&self.db).await? {
            if active.iter().any(|s| s.calendar_id == calendar.id) {
                continue;
            }
            match self.create(&calendar).await {
                Ok(_) => summary.created += 1,
                Err(_) => summary.failed += 1,
            }
        }

        summary.collected = self.gc().await?;
        Ok(summary)
    }

    /// Validate an incoming notification against the channel it claims to
    /// belong to and drop replays.
    pub async fn accept_notification(
        &self,
        channel_id: &str,
        resource_id: &str,
        token: Option<&str>,
        message_number: Option<i64>,
    ) -> Result<NotificationCheck, Error> {
        let Some(subscription) = db::get_subscription(&self.db, channel_id).await? else {
            return Ok(NotificationCheck::Unknown);
        };
        if subscription.resource_id != resource_id {
            return Ok(NotificationCheck::Rejected("resource mismatch"));
        }
        if !self.config.channel_token.is_empty() && token != Some(self.config.channel_token.as_str()) {
            return Ok(NotificationCheck::Rejected("bad channel token"));
        }
        if subscription.status != SubscriptionStatus::Active {
            return Ok(NotificationCheck::Rejected("inactive channel"));
        }
        if let Some(number) = message_number
            && !db::advance_message_number(&self.db, channel_id, number).await?
        {
            return Ok(NotificationCheck::Duplicate);
        }
        Ok(NotificationCheck::Accepted(subscription))
    }

    pub async fn record_delivery_success(&self, channel_id: &str) -> Result<(), Error> {
        if let Some(subscription) = db::get_subscription(&self.db, channel_id).await?
            && subscription.failure_count > 0
            && subscription.status == SubscriptionStatus::Active
        {
            db::set_failures(&self.db, channel_id, 0, None).await?;
        }
        Ok(())
    }

    /// A notification could not be turned into a successful sync. Enough
    /// of these in a row suspend the channel.
    pub async fn record_delivery_failure(&self, channel_id: &str, reason: &str) -> Result<(), Error> {
        let Some(subscription) = db::get_subscription(&self.db, channel_id).await? else {
            return Ok(());
        };
        if subscription.status != SubscriptionStatus::Active {
            return Ok(());
        }
        let failures = subscription.failure_count + 1;
        if failures >= self.config.subscription_failure_threshold {
            self.suspend(&subscription, &format!("delivery failed {} times: {}", failures, reason))
                .await
        } else {
            db::set_failures(&self.db, channel_id, failures, subscription.next_attempt_at).await
        }
    }

    /// Stop and remove every channel of a calendar.
    pub async fn remove_for_calendar(&self, calendar: &Calendar) -> Result<(), Error> {
        for subscription in db::list_for_calendar(&self.db, calendar.id).await? {
            if let Err(e) = self
                .provider
                .stop_channel(
                    &calendar.account_id,
                    &subscription.channel_id,
                    &subscription.resource_id,
                )
                .await
            {
                tracing::warn!("Failed to stop channel {}: {}", subscription.channel_id, e);
            }
            db::delete_subscription(&self.db, &subscription.channel_id).await?;
        }
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<PushSubscription>, Error> {
        db::list_subscriptions(&self.db).await
    }

    pub async fn get(&self, channel_id: &str) -> Result<Option<PushSubscription>, Error> {
        db::get_subscription(&self.db, channel_id).await
    }
}
