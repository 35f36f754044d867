use anyhow::Result;

use crate::core::AppConfig;
use crate::core::telemetry::{default_filter, init_tracing};
use crate::jobs::{FullResync, PeriodicJob, ReconcileOrphans, RenewSubscriptions, ScheduledSync};

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum JobId {
    ScheduledSync,
    FullResync,
    ReconcileOrphans,
    RenewSubscriptions,
}

pub async fn run(id: JobId, config: AppConfig) -> Result<()> {
    init_tracing(&default_filter());
    let service = super::open_service(config).await?;

    let job: Box<dyn PeriodicJob> = match id {
        JobId::ScheduledSync => Box::new(ScheduledSync),
        JobId::FullResync => Box::new(FullResync),
        JobId::ReconcileOrphans => Box::new(ReconcileOrphans),
        JobId::RenewSubscriptions => Box::new(RenewSubscriptions),
    };

    println!("Running job: {:?}", id);
    job.run_job(&service).await;
    println!("Job completed");

    Ok(())
}
