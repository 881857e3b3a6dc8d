use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::event::utc;
use super::lock::Lock;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentState {
    Draft,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

impl AssignmentState {
    pub fn as_str(self) -> &'static str {
        match self {
            AssignmentState::Draft => "draft",
            AssignmentState::Assigned => "assigned",
            AssignmentState::InProgress => "in_progress",
            AssignmentState::Completed => "completed",
            AssignmentState::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(AssignmentState::Draft),
            "assigned" => Some(AssignmentState::Assigned),
            "in_progress" => Some(AssignmentState::InProgress),
            "completed" => Some(AssignmentState::Completed),
            "cancelled" => Some(AssignmentState::Cancelled),
            _ => None,
        }
    }
}

impl TryFrom<&str> for AssignmentState {
    type Error = AppError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::from_str(value)
            .ok_or_else(|| AppError::Validation(format!("Invalid assignment state: {}", value)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedTo {
    pub state: AssignmentState,
    pub user: Option<String>,
    pub desk: Option<String>,
    pub assignor_user: Option<String>,
    /// External contact the coverage is assigned to, if any.
    pub contact: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    pub etag: String,
    pub planning_item: String,
    pub coverage_item: String,
    pub assigned_to: AssignedTo,
    pub accepted: bool,
    #[serde(flatten)]
    pub lock: Option<Lock>,
    #[serde(rename = "_to_delete")]
    pub to_delete: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAssignment {
    pub planning_item: String,
    pub coverage_item: String,
    pub assigned_to: AssignedTo,
}

#[derive(Debug, Clone, FromRow)]
pub struct AssignmentRow {
    pub id: String,
    pub etag: String,
    pub planning_item: String,
    pub coverage_item: String,
    pub state: String,
    pub assigned_user: Option<String>,
    pub assigned_desk: Option<String>,
    pub assignor_user: Option<String>,
    pub contact: Option<String>,
    pub accepted: bool,
    pub to_delete: bool,
    pub lock_user: Option<String>,
    pub lock_session: Option<String>,
    pub lock_action: Option<String>,
    pub lock_time: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl TryFrom<AssignmentRow> for Assignment {
    type Error = AppError;

    fn try_from(row: AssignmentRow) -> Result<Self, Self::Error> {
        Ok(Assignment {
            assigned_to: AssignedTo {
                state: AssignmentState::try_from(row.state.as_str())?,
                user: row.assigned_user,
                desk: row.assigned_desk,
                assignor_user: row.assignor_user,
                contact: row.contact,
            },
            lock: Lock::from_columns(row.lock_user, row.lock_session, row.lock_action, row.lock_time),
            created_at: utc(row.created_at),
            updated_at: utc(row.updated_at),
            id: row.id,
            etag: row.etag,
            planning_item: row.planning_item,
            coverage_item: row.coverage_item,
            accepted: row.accepted,
            to_delete: row.to_delete,
        })
    }
}
