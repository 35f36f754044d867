use std::sync::{Arc, RwLock};

use anyhow::{Result, anyhow};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::routes;
use crate::api::state::{AppState, SharedState};
use crate::core::db::{async_db, migrate_db};
use crate::core::telemetry::init_tracing;
use crate::core::AppConfig;
use crate::jobs::{
    FullResync, ReconcileOrphans, RenewSubscriptions, ScheduledSync, spawn_periodic_job,
};
use crate::service::SyncService;

pub fn app(shared_state: SharedState) -> Router {
    let cors = CorsLayer::permissive();

    Router::new()
        // API routes
        .nest("/api", routes::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(Arc::clone(&shared_state))
}

// Run the server
pub async fn serve(host: String, port: String, config: AppConfig) -> Result<()> {
    // axum logs rejections from built-in extractors with the `axum::rejection`
    // target, at `TRACE` level. `axum::rejection=trace` enables showing those events
    init_tracing(&format!(
        "info,{}=debug,tower_http=debug,axum::rejection=trace",
        env!("CARGO_CRATE_NAME")
    ));

    let db = async_db(&config.db_path).await?;
    db.call(|conn| {
        migrate_db(conn)?;
        Ok(())
    })
    .await?;

    let service = Arc::new(SyncService::google(db, config)?);
    let shared_state = Arc::new(RwLock::new(AppState::new(service.clone())));
    let app = app(Arc::clone(&shared_state));

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", host, port))
        .await
        .map_err(|e| anyhow!("Failed to bind {}:{}: {}", host, port, e))?;

    tracing::info!("Server started. Listening on {}", listener.local_addr()?);

    // Run background jobs. Each job is spawned in its own tokio task
    // in a loop.
    spawn_periodic_job(service.clone(), RenewSubscriptions);
    spawn_periodic_job(service.clone(), ScheduledSync);
    spawn_periodic_job(service.clone(), ReconcileOrphans);
    spawn_periodic_job(service, FullResync);

    axum::serve(listener, app).await?;
    Ok(())
}
