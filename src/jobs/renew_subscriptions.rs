use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::PeriodicJob;
use crate::core::AppConfig;
use crate::service::SyncService;

#[derive(Debug)]
pub struct RenewSubscriptions;

#[async_trait]
impl PeriodicJob for RenewSubscriptions {
    fn interval(&self, config: &AppConfig) -> Duration {
        // Several checks fit inside the renewal buffer
        (config.renewal_buffer / 4).max(Duration::from_secs(60))
    }

    async fn run_job(&self, service: &Arc<SyncService>) {
        if let Err(e) = service.renew_expiring_subscriptions().await {
            tracing::error!("Subscription maintenance failed: {}", e);
        }
    }
}
