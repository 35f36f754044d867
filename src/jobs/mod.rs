use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::AppConfig;
use crate::service::SyncService;

mod full_resync;
mod reconcile_orphans;
mod renew_subscriptions;
mod scheduled_sync;

pub use full_resync::FullResync;
pub use reconcile_orphans::ReconcileOrphans;
pub use renew_subscriptions::RenewSubscriptions;
pub use scheduled_sync::ScheduledSync;

#[async_trait]
pub trait PeriodicJob: Send + Sync + Debug {
    fn interval(&self, config: &AppConfig) -> Duration;

    async fn run_job(&self, service: &Arc<SyncService>);
}

pub fn spawn_periodic_job<J>(service: Arc<SyncService>, job: J)
where
    J: PeriodicJob + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(job.interval(&service.config));
        // Delay missed ticks instead of bursting after a long pass
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            tracing::debug!("Running periodic job {:?}", job);
            job.run_job(&service).await;
        }
    });
}
