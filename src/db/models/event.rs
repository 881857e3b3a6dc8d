use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::lock::Lock;
use crate::error::AppError;

// ============================================================================
// Workflow
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    Draft,
    Ingested,
    Scheduled,
    Postponed,
    Rescheduled,
    Cancelled,
    Killed,
    Spiked,
}

impl WorkflowState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Draft => "draft",
            WorkflowState::Ingested => "ingested",
            WorkflowState::Scheduled => "scheduled",
            WorkflowState::Postponed => "postponed",
            WorkflowState::Rescheduled => "rescheduled",
            WorkflowState::Cancelled => "cancelled",
            WorkflowState::Killed => "killed",
            WorkflowState::Spiked => "spiked",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(WorkflowState::Draft),
            "ingested" => Some(WorkflowState::Ingested),
            "scheduled" => Some(WorkflowState::Scheduled),
            "postponed" => Some(WorkflowState::Postponed),
            "rescheduled" => Some(WorkflowState::Rescheduled),
            "cancelled" => Some(WorkflowState::Cancelled),
            "killed" => Some(WorkflowState::Killed),
            "spiked" => Some(WorkflowState::Spiked),
            _ => None,
        }
    }
}

impl TryFrom<&str> for WorkflowState {
    type Error = AppError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::from_str(value)
            .ok_or_else(|| AppError::Validation(format!("Invalid workflow state: {}", value)))
    }
}

// ============================================================================
// Recurrence rule
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndRepeatMode {
    Count,
    Until,
    Unlimited,
}

/// Repetition rule as stored on an event.
///
/// `frequency` and `byday` are kept as raw tokens; they are parsed (and rejected
/// with a configuration error) by the recurrence expander.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringRule {
    pub frequency: String,
    #[serde(default = "default_interval")]
    pub interval: i64,
    #[serde(default)]
    pub byday: Vec<String>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub count: Option<i64>,
    #[serde(rename = "endRepeatMode")]
    pub end_repeat_mode: EndRepeatMode,
    #[serde(default)]
    pub ex_date: Vec<NaiveDate>,
}

fn default_interval() -> i64 {
    1
}

impl RecurringRule {
    pub fn daily_count(count: i64) -> Self {
        Self {
            frequency: "DAILY".to_string(),
            interval: 1,
            byday: Vec::new(),
            until: None,
            count: Some(count),
            end_repeat_mode: EndRepeatMode::Count,
            ex_date: Vec::new(),
        }
    }
}

// ============================================================================
// Event
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDates {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub tz: Tz,
    #[serde(default)]
    pub all_day: bool,
    #[serde(default)]
    pub no_end_time: bool,
    #[serde(default)]
    pub recurring_rule: Option<RecurringRule>,
}

impl EventDates {
    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub etag: String,
    pub name: String,
    pub recurrence_id: Option<String>,
    pub dates: EventDates,
    pub state: WorkflowState,
    /// Set once a single occurrence was edited on its own; excluded from regeneration.
    pub detached: bool,
    pub related_plannings: Vec<String>,
    #[serde(flatten)]
    pub lock: Option<Lock>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub fn is_recurring(&self) -> bool {
        self.recurrence_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEvent {
    pub name: String,
    pub recurrence_id: Option<String>,
    pub dates: EventDates,
    pub state: WorkflowState,
}

/// Row shape of the `events` table.
#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub id: String,
    pub etag: String,
    pub name: String,
    pub recurrence_id: Option<String>,
    pub dates_start: NaiveDateTime,
    pub dates_end: NaiveDateTime,
    pub dates_tz: String,
    pub all_day: bool,
    pub no_end_time: bool,
    pub recurring_rule: Option<String>,
    pub state: String,
    pub detached: bool,
    pub related_plannings: String,
    pub lock_user: Option<String>,
    pub lock_session: Option<String>,
    pub lock_action: Option<String>,
    pub lock_time: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

pub(crate) fn utc(naive: NaiveDateTime) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(naive, Utc)
}

impl TryFrom<EventRow> for Event {
    type Error = AppError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let tz: Tz = row.dates_tz.parse().map_err(|_| {
            AppError::Configuration(format!(
                "Event {} has an unknown timezone: {}",
                row.id, row.dates_tz
            ))
        })?;
        let recurring_rule = match row.recurring_rule {
            Some(ref json) => Some(serde_json::from_str(json)?),
            None => None,
        };

        Ok(Event {
            dates: EventDates {
                start: utc(row.dates_start),
                end: utc(row.dates_end),
                tz,
                all_day: row.all_day,
                no_end_time: row.no_end_time,
                recurring_rule,
            },
            state: WorkflowState::try_from(row.state.as_str())?,
            related_plannings: serde_json::from_str(&row.related_plannings)?,
            lock: Lock::from_columns(row.lock_user, row.lock_session, row.lock_action, row.lock_time),
            created_at: utc(row.created_at),
            updated_at: utc(row.updated_at),
            id: row.id,
            etag: row.etag,
            name: row.name,
            recurrence_id: row.recurrence_id,
            detached: row.detached,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_deserializes_with_defaults() {
        let rule: RecurringRule = serde_json::from_value(serde_json::json!({
            "frequency": "WEEKLY",
            "byday": ["MO", "WE"],
            "endRepeatMode": "unlimited"
        }))
        .expect("rule");

        assert_eq!(rule.interval, 1);
        assert_eq!(rule.end_repeat_mode, EndRepeatMode::Unlimited);
        assert!(rule.count.is_none());
        assert!(rule.ex_date.is_empty());
    }

    #[test]
    fn unknown_timezone_in_row_is_a_configuration_error() {
        let now = Utc::now().naive_utc();
        let row = EventRow {
            id: "e1".into(),
            etag: "x".into(),
            name: "Vote".into(),
            recurrence_id: None,
            dates_start: now,
            dates_end: now,
            dates_tz: "Mars/Olympus".into(),
            all_day: false,
            no_end_time: false,
            recurring_rule: None,
            state: "draft".into(),
            detached: false,
            related_plannings: "[]".into(),
            lock_user: None,
            lock_session: None,
            lock_action: None,
            lock_time: None,
            created_at: now,
            updated_at: now,
        };

        assert!(matches!(
            Event::try_from(row),
            Err(AppError::Configuration(_))
        ));
    }
}
