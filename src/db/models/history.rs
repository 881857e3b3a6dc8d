use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Append-only audit entry for an operation on an event, planning item or assignment.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub resource: String,
    pub item_id: String,
    pub operation: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub update_json: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateHistoryEntry {
    pub resource: String,
    pub item_id: String,
    pub operation: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub update: serde_json::Value,
}

impl CreateHistoryEntry {
    pub fn new(resource: &str, item_id: &str, operation: &str) -> Self {
        Self {
            resource: resource.to_string(),
            item_id: item_id.to_string(),
            operation: operation.to_string(),
            user_id: None,
            session_id: None,
            update: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn by(mut self, user_id: Option<&str>, session_id: Option<&str>) -> Self {
        self.user_id = user_id.map(str::to_string);
        self.session_id = session_id.map(str::to_string);
        self
    }

    pub fn with_update(mut self, update: serde_json::Value) -> Self {
        self.update = update;
        self
    }
}

/// A user's unsaved draft of a locked item.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Autosave {
    pub resource: String,
    pub item_id: String,
    pub data: String,
    pub created_at: NaiveDateTime,
}
