//! The synchronization engine: fetch a calendar's changes, classify them
//! and mirror busy time into the owner's other calendars.

pub mod engine;

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::provider::ProviderError;

pub use engine::SyncEngine;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Calendar {0} not found")]
    CalendarNotFound(i64),
    #[error("Calendar {0} is not enabled for sync")]
    CalendarDisabled(i64),
    #[error("Calendar {0} is already being synced")]
    LockHeld(i64),
    #[error("Provider request failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("Classification failed, no changes applied: {0}")]
    Classification(String),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Sync pass exceeded its budget of {0:?}")]
    BudgetExceeded(Duration),
}

impl SyncError {
    pub(crate) fn store(error: anyhow::Error) -> Self {
        SyncError::Store(format!("{:#}", error))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncMode {
    Incremental,
    /// Re-list the whole window and treat missing tracked events as gone.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SyncPhase {
    #[default]
    Fetching,
    Classifying,
    Reconciling,
    Complete,
    Errored,
}

/// What a single pass over one calendar did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub calendar_id: i64,
    pub phase: SyncPhase,
    pub full_listing: bool,
    pub cursor_reset: bool,
    pub fetched: usize,
    pub recorded: usize,
    pub updated: usize,
    pub removed: usize,
    pub skipped_owned: usize,
    pub skipped_peer: usize,
    pub ignored: usize,
    pub stale: usize,
    pub placeholders_created: usize,
    pub placeholders_updated: usize,
    pub placeholders_deleted: usize,
    pub placeholder_failures: usize,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn new(calendar_id: i64) -> Self {
        Self {
            calendar_id,
            ..Default::default()
        }
    }
}
