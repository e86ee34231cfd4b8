use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const HISTORY_MODEL_ACTIVATED: &str = "model_activated";
pub const HISTORY_MODEL_DEACTIVATED: &str = "model_deactivated";
pub const HISTORY_WEIGHT_INSTALL_COMPLETED: &str = "weight_install_completed";
pub const HISTORY_WEIGHT_INSTALL_FAILED: &str = "weight_install_failed";

/// Append-only audit record. Ids come from a store-side sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: u64,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// An entry not yet assigned an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHistoryEntry {
    pub event: String,
    pub model_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewHistoryEntry {
    pub fn new(event: impl Into<String>, model_id: Option<String>, metadata: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            model_id,
            metadata,
        }
    }
}
