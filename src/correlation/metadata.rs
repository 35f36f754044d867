//! The private metadata embedded in every provider event this system
//! touches. Other instances and future schema versions rely on these exact
//! keys, so they never change.

use std::collections::HashMap;

use serde::Serialize;

use super::{CorrelationId, EventKind};

pub const SCHEMA_VERSION: &str = "1";

pub const KEY_ID: &str = "id";
pub const KEY_KIND: &str = "kind";
pub const KEY_SOURCE_ID: &str = "sourceId";
pub const KEY_SCHEMA_VERSION: &str = "schemaVersion";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationMetadata {
    pub id: CorrelationId,
    // None when written by a schema version with kinds this build does not know
    pub kind: Option<EventKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<CorrelationId>,
    pub schema_version: String,
}

impl CorrelationMetadata {
    pub fn user_event(id: CorrelationId) -> Self {
        Self {
            id,
            kind: Some(EventKind::UserEvent),
            source_id: None,
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }

    pub fn placeholder(id: CorrelationId, source_id: CorrelationId) -> Self {
        Self {
            id,
            kind: Some(EventKind::PlaceholderBlock),
            source_id: Some(source_id),
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }

    /// Read metadata from an event's private properties. Only the id is
    /// required; it is the sole input to provenance decisions.
    pub fn from_properties(properties: &HashMap<String, String>) -> Option<Self> {
        let id = properties.get(KEY_ID).map(|s| s.trim()).filter(|s| !s.is_empty())?;
        Some(Self {
            id: CorrelationId::from(id),
            kind: properties.get(KEY_KIND).and_then(|k| k.parse().ok()),
            source_id: properties
                .get(KEY_SOURCE_ID)
                .filter(|s| !s.is_empty())
                .map(|s| CorrelationId::from(s.as_str())),
            schema_version: properties
                .get(KEY_SCHEMA_VERSION)
                .cloned()
                .unwrap_or_else(|| SCHEMA_VERSION.to_string()),
        })
    }

    pub fn to_properties(&self) -> HashMap<String, String> {
        let mut properties = HashMap::new();
        properties.insert(KEY_ID.to_string(), self.id.to_string());
        if let Some(kind) = self.kind {
            properties.insert(KEY_KIND.to_string(), kind.as_str().to_string());
        }
        if let Some(source_id) = &self.source_id {
            properties.insert(KEY_SOURCE_ID.to_string(), source_id.to_string());
        }
        properties.insert(KEY_SCHEMA_VERSION.to_string(), self.schema_version.clone());
        properties
    }
}
