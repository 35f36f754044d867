//! Event provenance and lifecycle bookkeeping.
//!
//! Every event the engine cares about gets an [`EventCorrelationRecord`]
//! keyed by a correlation id that is also embedded in the provider event's
//! private metadata. Provenance decisions are made from that id alone.

pub mod cache;
pub mod db;
pub mod manager;
pub mod metadata;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provider::EventTime;

pub use manager::CorrelationManager;
pub use metadata::CorrelationMetadata;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    UserEvent,
    PlaceholderBlock,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::UserEvent => "UserEvent",
            EventKind::PlaceholderBlock => "PlaceholderBlock",
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UserEvent" => Ok(EventKind::UserEvent),
            "PlaceholderBlock" => Ok(EventKind::PlaceholderBlock),
            other => Err(format!("unknown event kind {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Pending,
    Materialized,
    Failed,
    Stale,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "Pending",
            LifecycleState::Materialized => "Materialized",
            LifecycleState::Failed => "Failed",
            LifecycleState::Stale => "Stale",
        }
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(LifecycleState::Pending),
            "Materialized" => Ok(LifecycleState::Materialized),
            "Failed" => Ok(LifecycleState::Failed),
            "Stale" => Ok(LifecycleState::Stale),
            other => Err(format!("unknown lifecycle state {}", other)),
        }
    }
}

crate::core::db::sql_text_enum!(EventKind);
crate::core::db::sql_text_enum!(LifecycleState);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventCorrelationRecord {
    pub correlation_id: CorrelationId,
    pub calendar_id: i64,
    pub provider_event_id: Option<String>,
    pub kind: EventKind,
    pub created_by_system: bool,
    pub source_correlation_id: Option<CorrelationId>,
    pub lifecycle_state: LifecycleState,
    pub title: Option<String>,
    pub start: Option<EventTime>,
    pub end: Option<EventTime>,
    pub created_at: DateTime<Utc>,
    pub last_observed_at: DateTime<Utc>,
}

impl EventCorrelationRecord {
    pub fn is_live_placeholder(&self) -> bool {
        self.kind == EventKind::PlaceholderBlock
            && matches!(
                self.lifecycle_state,
                LifecycleState::Pending | LifecycleState::Materialized
            )
    }
}

/// Outcome of deciding where an observed event came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// User data this system has never seen.
    NewForeignEvent,
    /// Created by this system. Never a sync input.
    OwnedBySystem(CorrelationId),
    /// User data already tracked.
    ForeignTrackedEvent(EventCorrelationRecord),
    /// Carries a correlation id this instance never issued: another
    /// instance of the system shares the calendar. Left alone.
    ExternalPeerSystemEvent(CorrelationId),
    /// The store could not answer. Callers must do nothing.
    ClassificationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_parses_kinds_and_states() {
        for kind in [EventKind::UserEvent, EventKind::PlaceholderBlock] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        for state in [
            LifecycleState::Pending,
            LifecycleState::Materialized,
            LifecycleState::Failed,
            LifecycleState::Stale,
        ] {
            assert_eq!(state.as_str().parse::<LifecycleState>().unwrap(), state);
        }
        assert!("Busy".parse::<EventKind>().is_err());
    }

    #[test]
    fn it_generates_unique_ids() {
        assert_ne!(CorrelationId::generate(), CorrelationId::generate());
    }
}
