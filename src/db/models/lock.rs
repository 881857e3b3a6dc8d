use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Collections that carry the four-field pessimistic lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockResource {
    Events,
    Planning,
    Assignments,
}

impl LockResource {
    pub const ALL: [LockResource; 3] = [
        LockResource::Events,
        LockResource::Planning,
        LockResource::Assignments,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LockResource::Events => "events",
            LockResource::Planning => "planning",
            LockResource::Assignments => "assignments",
        }
    }

    /// Table holding the documents of this resource.
    pub fn table(self) -> &'static str {
        match self {
            LockResource::Events => "events",
            LockResource::Planning => "planning",
            LockResource::Assignments => "assignments",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "events" => Some(LockResource::Events),
            "planning" => Some(LockResource::Planning),
            "assignments" => Some(LockResource::Assignments),
            _ => None,
        }
    }
}

impl std::fmt::Display for LockResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock holder attached to an Event, Planning item or Assignment.
///
/// Kept as `Option<Lock>` on the documents, so a lock user without a session or
/// lock time cannot be represented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    #[serde(rename = "lock_user")]
    pub user: String,
    #[serde(rename = "lock_session")]
    pub session: String,
    #[serde(rename = "lock_action")]
    pub action: String,
    #[serde(rename = "lock_time")]
    pub time: DateTime<Utc>,
}

impl Lock {
    pub fn new(user: &str, session: &str, action: &str, time: DateTime<Utc>) -> Self {
        Self {
            user: user.to_string(),
            session: session.to_string(),
            action: action.to_string(),
            time,
        }
    }

    pub fn is_held_by(&self, user: &str, session: &str) -> bool {
        self.user == user && self.session == session
    }

    /// Build a lock from the four nullable columns. Partial locks read as unlocked.
    pub fn from_columns(
        user: Option<String>,
        session: Option<String>,
        action: Option<String>,
        time: Option<NaiveDateTime>,
    ) -> Option<Self> {
        match (user, session, time) {
            (Some(user), Some(session), Some(time)) => Some(Lock {
                user,
                session,
                action: action.unwrap_or_default(),
                time: DateTime::from_naive_utc_and_offset(time, Utc),
            }),
            _ => None,
        }
    }
}

/// Lock columns plus the concurrency token of the owning document.
#[derive(Debug, Clone)]
pub struct LockSnapshot {
    pub item_id: String,
    pub etag: String,
    pub lock: Option<Lock>,
}
