use anyhow::Result;

use crate::core::AppConfig;
use crate::core::telemetry::{default_filter, init_tracing};

pub async fn sync(calendar_id: i64, full: bool, config: AppConfig) -> Result<()> {
    init_tracing(&default_filter());
    let service = super::open_service(config).await?;
    let report = if full {
        service.trigger_full_resync(calendar_id).await?
    } else {
        service.trigger_sync(calendar_id).await?
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn reconcile(config: AppConfig) -> Result<()> {
    init_tracing(&default_filter());
    let service = super::open_service(config).await?;
    let report = service.reconcile_orphans().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn renew(config: AppConfig) -> Result<()> {
    init_tracing(&default_filter());
    let service = super::open_service(config).await?;
    let summary = service.renew_expiring_subscriptions().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
