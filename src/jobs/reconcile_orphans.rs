use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::PeriodicJob;
use crate::core::AppConfig;
use crate::service::SyncService;

#[derive(Debug)]
pub struct ReconcileOrphans;

#[async_trait]
impl PeriodicJob for ReconcileOrphans {
    fn interval(&self, config: &AppConfig) -> Duration {
        config.maintenance_interval
    }

    async fn run_job(&self, service: &Arc<SyncService>) {
        if let Err(e) = service.reconcile_orphans().await {
            tracing::error!("Orphan reconciliation failed: {}", e);
        }
    }
}
