use std::sync::{Arc, RwLock};

use tokio_rusqlite::Connection;

use crate::service::SyncService;

pub type SharedState = Arc<RwLock<AppState>>;

pub struct AppState {
    pub db: Connection,
    pub service: Arc<SyncService>,
}

impl AppState {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self {
            db: service.db.clone(),
            service,
        }
    }
}

/// Clone the service handle out of the shared state so no lock is held
/// across an await.
pub fn service(state: &SharedState) -> Arc<SyncService> {
    state
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .service
        .clone()
}
