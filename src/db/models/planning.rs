use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::assignment::AssignmentState;
use super::event::{utc, WorkflowState};
use super::lock::Lock;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedEventLink {
    #[serde(rename = "_id")]
    pub event_id: String,
    pub link_type: LinkType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence_id: Option<String>,
}

/// Workflow status of a coverage, mirroring the state of its assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CoverageStatus {
    #[default]
    Draft,
    Active,
    Cancelled,
}

impl From<AssignmentState> for CoverageStatus {
    fn from(state: AssignmentState) -> Self {
        match state {
            AssignmentState::Draft => CoverageStatus::Draft,
            AssignmentState::Assigned
            | AssignmentState::InProgress
            | AssignmentState::Completed => CoverageStatus::Active,
            AssignmentState::Cancelled => CoverageStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CoveragePlanning {
    pub g2_content_type: String,
    #[serde(default)]
    pub scheduled: Option<DateTime<Utc>>,
    #[serde(default)]
    pub slugline: String,
}

/// Denormalized projection of the coverage's assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CoverageAssignee {
    #[serde(default)]
    pub assignment_id: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub desk: Option<String>,
    #[serde(default)]
    pub state: Option<AssignmentState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub coverage_id: String,
    pub planning: CoveragePlanning,
    #[serde(default = "default_news_coverage_status")]
    pub news_coverage_status: String,
    #[serde(default)]
    pub workflow_status: CoverageStatus,
    #[serde(default)]
    pub assigned_to: CoverageAssignee,
}

fn default_news_coverage_status() -> String {
    "ncostat:int".to_string()
}

impl Coverage {
    pub fn new(coverage_id: &str, g2_content_type: &str, slugline: &str) -> Self {
        Self {
            coverage_id: coverage_id.to_string(),
            planning: CoveragePlanning {
                g2_content_type: g2_content_type.to_string(),
                scheduled: None,
                slugline: slugline.to_string(),
            },
            news_coverage_status: default_news_coverage_status(),
            workflow_status: CoverageStatus::Draft,
            assigned_to: CoverageAssignee::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Planning {
    pub id: String,
    pub etag: String,
    pub slugline: String,
    pub planning_date: DateTime<Utc>,
    pub related_events: Vec<RelatedEventLink>,
    pub coverages: Vec<Coverage>,
    pub state: WorkflowState,
    #[serde(flatten)]
    pub lock: Option<Lock>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Planning {
    pub fn primary_event(&self) -> Option<&RelatedEventLink> {
        self.related_events
            .iter()
            .find(|link| link.link_type == LinkType::Primary)
    }

    pub fn coverage(&self, coverage_id: &str) -> Option<&Coverage> {
        self.coverages.iter().find(|c| c.coverage_id == coverage_id)
    }

    pub fn coverage_mut(&mut self, coverage_id: &str) -> Option<&mut Coverage> {
        self.coverages
            .iter_mut()
            .find(|c| c.coverage_id == coverage_id)
    }

    /// Assignment ids referenced by the coverages of this item.
    pub fn assignment_ids(&self) -> Vec<String> {
        self.coverages
            .iter()
            .filter_map(|c| c.assigned_to.assignment_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePlanning {
    pub slugline: String,
    pub planning_date: DateTime<Utc>,
    pub related_events: Vec<RelatedEventLink>,
    pub coverages: Vec<Coverage>,
}

#[derive(Debug, Clone, FromRow)]
pub struct PlanningRow {
    pub id: String,
    pub etag: String,
    pub slugline: String,
    pub planning_date: NaiveDateTime,
    pub related_events: String,
    pub coverages: String,
    pub state: String,
    pub lock_user: Option<String>,
    pub lock_session: Option<String>,
    pub lock_action: Option<String>,
    pub lock_time: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl TryFrom<PlanningRow> for Planning {
    type Error = AppError;

    fn try_from(row: PlanningRow) -> Result<Self, Self::Error> {
        Ok(Planning {
            related_events: serde_json::from_str(&row.related_events)?,
            coverages: serde_json::from_str(&row.coverages)?,
            state: WorkflowState::try_from(row.state.as_str())?,
            lock: Lock::from_columns(row.lock_user, row.lock_session, row.lock_action, row.lock_time),
            planning_date: utc(row.planning_date),
            created_at: utc(row.created_at),
            updated_at: utc(row.updated_at),
            id: row.id,
            etag: row.etag,
            slugline: row.slugline,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage_status_follows_assignment_state() {
        assert_eq!(CoverageStatus::from(AssignmentState::Draft), CoverageStatus::Draft);
        assert_eq!(CoverageStatus::from(AssignmentState::InProgress), CoverageStatus::Active);
        assert_eq!(CoverageStatus::from(AssignmentState::Completed), CoverageStatus::Active);
        assert_eq!(
            CoverageStatus::from(AssignmentState::Cancelled),
            CoverageStatus::Cancelled
        );
    }

    #[test]
    fn coverage_json_tolerates_missing_projection() {
        let coverage: Coverage = serde_json::from_value(serde_json::json!({
            "coverage_id": "c1",
            "planning": {"g2_content_type": "text"}
        }))
        .expect("coverage");

        assert_eq!(coverage.workflow_status, CoverageStatus::Draft);
        assert!(coverage.assigned_to.assignment_id.is_none());
        assert_eq!(coverage.news_coverage_status, "ncostat:int");
    }
}
