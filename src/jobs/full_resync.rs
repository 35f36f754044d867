use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::PeriodicJob;
use crate::calendar::db::list_sync_enabled;
use crate::core::AppConfig;
use crate::service::SyncService;
use crate::sync::SyncMode;

/// Periodic full reconciliation. Recreates placeholders that went missing
/// and retires tracked events that vanished without a cancellation.
#[derive(Debug)]
pub struct FullResync;

#[async_trait]
impl PeriodicJob for FullResync {
    fn interval(&self, config: &AppConfig) -> Duration {
        config.full_resync_interval
    }

    async fn run_job(&self, service: &Arc<SyncService>) {
        let calendars = match list_sync_enabled(&service.db).await {
            Ok(calendars) => calendars,
            Err(e) => {
                tracing::error!("Failed to list calendars for full resync: {}", e);
                return;
            }
        };
        for (calendar_id, result) in service.sync_calendars(calendars, SyncMode::Full).await {
            if let Err(e) = result {
                tracing::warn!("Full resync of calendar {} failed: {}", calendar_id, e);
            }
        }
    }
}
