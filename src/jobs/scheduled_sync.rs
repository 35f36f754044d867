use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::PeriodicJob;
use crate::core::AppConfig;
use crate::service::SyncService;
use crate::sync::{SyncError, SyncMode};

/// Safety net for lost notifications and the only source of changes for
/// calendars in polling mode.
#[derive(Debug)]
pub struct ScheduledSync;

#[async_trait]
impl PeriodicJob for ScheduledSync {
    fn interval(&self, config: &AppConfig) -> Duration {
        config.poll_interval
    }

    async fn run_job(&self, service: &Arc<SyncService>) {
        let calendars = match service.due_calendars().await {
            Ok(calendars) => calendars,
            Err(e) => {
                tracing::error!("Failed to list calendars due for sync: {}", e);
                return;
            }
        };
        if calendars.is_empty() {
            return;
        }

        for (calendar_id, result) in service.sync_calendars(calendars, SyncMode::Incremental).await {
            match result {
                Ok(_) | Err(SyncError::LockHeld(_)) => {}
                Err(e) => tracing::warn!("Scheduled sync of calendar {} failed: {}", calendar_id, e),
            }
        }
    }
}
