use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// States in which a content item counts as published output.
pub const PUBLISHED_STATES: [&str; 4] = ["published", "corrected", "killed", "recalled"];

/// The content repository's view of a produced item.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub etag: String,
    pub slugline: String,
    pub item_type: String,
    pub state: String,
    pub assignment_id: Option<String>,
    /// Item this one is a rewrite (update) of.
    pub rewrite_of: Option<String>,
    /// Item that rewrote this one.
    pub rewritten_by: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl ContentItem {
    pub fn is_published(&self) -> bool {
        PUBLISHED_STATES.contains(&self.state.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContentItem {
    pub slugline: String,
    pub item_type: String,
    pub state: String,
    pub rewrite_of: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub organisation: Option<String>,
    pub created_at: NaiveDateTime,
}

impl Contact {
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        let name = name.trim();
        if name.is_empty() {
            self.organisation.clone().unwrap_or_default()
        } else {
            name.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn contact_display_name_falls_back_to_organisation() {
        let now = Utc::now().naive_utc();
        let mut contact = Contact {
            id: "c1".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            organisation: Some("Analytical Engines".into()),
            created_at: now,
        };
        assert_eq!(contact.display_name(), "Ada Lovelace");

        contact.first_name.clear();
        contact.last_name.clear();
        assert_eq!(contact.display_name(), "Analytical Engines");
    }
}
