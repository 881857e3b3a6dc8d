//! Keeping a materialized recurring series consistent with its rule.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::recurrence::{at_local, expand};
use crate::db::models::{Event, EventDates, WorkflowState};
use crate::error::{AppError, AppResult};

/// Which part of a series an edit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateScope {
    Single,
    Future,
    All,
}

impl FromStr for UpdateScope {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single" => Ok(UpdateScope::Single),
            "future" => Ok(UpdateScope::Future),
            "all" => Ok(UpdateScope::All),
            other => Err(AppError::Validation(format!("Unknown update scope: {}", other))),
        }
    }
}

/// New dates (and rule) for one occurrence of a series.
#[derive(Debug, Clone)]
pub struct DatesChange {
    pub event_id: String,
    pub dates: EventDates,
}

/// Writes needed to bring the stored series in line with an edit.
#[derive(Debug, Clone, Default)]
pub struct SeriesDiff {
    pub to_create: Vec<Event>,
    pub to_update: Vec<Event>,
    pub to_delete: Vec<Event>,
}

impl SeriesDiff {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

/// Instances of a series relative to a selected one.
#[derive(Debug, Clone, Default)]
pub struct RecurringTimeline {
    /// Instances that already ended.
    pub historic: Vec<Event>,
    /// Instances not yet ended that start before the selected one.
    pub past: Vec<Event>,
    pub future: Vec<Event>,
}

#[derive(Debug, Clone)]
pub struct SeriesMaterializer {
    max_recurrent_events: usize,
}

impl SeriesMaterializer {
    pub fn new(max_recurrent_events: usize) -> Self {
        Self {
            max_recurrent_events,
        }
    }

    /// Compute the diff for editing `change.event_id` with `scope`.
    ///
    /// `existing` are the stored instances of `series_id`. Detached instances
    /// are never regenerated.
    pub fn reconcile(
        &self,
        series_id: &str,
        change: &DatesChange,
        scope: UpdateScope,
        existing: &[Event],
    ) -> AppResult<SeriesDiff> {
        if existing.is_empty() {
            return Ok(SeriesDiff::default());
        }

        let mut instances: Vec<&Event> = existing
            .iter()
            .filter(|e| e.recurrence_id.as_deref() == Some(series_id))
            .collect();
        instances.sort_by(|a, b| a.dates.start.cmp(&b.dates.start).then(a.id.cmp(&b.id)));

        let edited = instances
            .iter()
            .find(|e| e.id == change.event_id)
            .copied()
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Event {} is not part of series {}",
                    change.event_id, series_id
                ))
            })?;

        if scope == UpdateScope::Single {
            let mut detached = edited.clone();
            detached.dates = EventDates {
                recurring_rule: None,
                ..change.dates.clone()
            };
            detached.detached = true;
            return Ok(SeriesDiff {
                to_update: vec![detached],
                ..SeriesDiff::default()
            });
        }

        let rule = change
            .dates
            .recurring_rule
            .clone()
            .or_else(|| edited.dates.recurring_rule.clone())
            .ok_or_else(|| {
                AppError::Validation(format!("Event {} has no recurring rule", edited.id))
            })?;
        let tz = change.dates.tz;

        let (kept, targets): (Vec<&Event>, Vec<&Event>) = match scope {
            UpdateScope::All => (Vec::new(), instances.iter().copied().collect()),
            _ => instances
                .iter()
                .copied()
                .partition(|e| e.id != edited.id && e.dates.start < edited.dates.start),
        };
        let targets: Vec<&Event> = targets
            .into_iter()
            .filter(|e| !e.detached || e.id == edited.id)
            .collect();

        let anchor = match scope {
            UpdateScope::All => {
                let first_date = targets
                    .first()
                    .map(|e| e.dates.start.with_timezone(&tz).date_naive())
                    .unwrap_or_else(|| change.dates.start.with_timezone(&tz).date_naive());
                let time = change.dates.start.with_timezone(&tz).time();
                at_local(&tz, first_date, time).unwrap_or(change.dates.start)
            }
            _ => change.dates.start,
        };

        let budget = self.max_recurrent_events.saturating_sub(kept.len());
        let instants: Vec<DateTime<Utc>> = expand(anchor, &rule, tz)?.take(budget).collect();
        let duration = change.dates.end - change.dates.start;
        let dates_at = |start: DateTime<Utc>| EventDates {
            start,
            end: start + duration,
            recurring_rule: Some(rule.clone()),
            ..change.dates.clone()
        };

        let mut diff = SeriesDiff::default();
        for (index, instant) in instants.iter().enumerate() {
            match targets.get(index) {
                Some(target) => {
                    let mut updated = (*target).clone();
                    updated.dates = dates_at(*instant);
                    updated.detached = false;
                    diff.to_update.push(updated);
                }
                None => {
                    let mut created = edited.clone();
                    created.id = Uuid::new_v4().to_string();
                    created.etag = String::new();
                    created.recurrence_id = Some(series_id.to_string());
                    created.dates = dates_at(*instant);
                    created.detached = false;
                    created.lock = None;
                    created.related_plannings = Vec::new();
                    diff.to_create.push(created);
                }
            }
        }
        diff.to_delete = targets
            .iter()
            .skip(instants.len())
            .map(|e| (*e).clone())
            .collect();

        Ok(diff)
    }
}

/// Split `series` into historic, past and future relative to `selected`.
pub fn recurring_timeline(
    selected: &Event,
    series: &[Event],
    now: DateTime<Utc>,
) -> RecurringTimeline {
    let mut timeline = RecurringTimeline::default();

    for event in series.iter().filter(|e| e.id != selected.id) {
        if event.dates.end < now {
            timeline.historic.push(event.clone());
        } else if event.dates.start < selected.dates.start {
            timeline.past.push(event.clone());
        } else if event.dates.start > selected.dates.start {
            timeline.future.push(event.clone());
        }
    }

    timeline
}

/// A series may be purged only when nothing lies ahead of `reference` and every
/// other instance, plus the reference, is spiked and ended before `cutoff`.
pub fn is_series_expired_and_spiked(
    series: &[Event],
    reference: &Event,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    let timeline = recurring_timeline(reference, series, now);
    if !timeline.future.is_empty() {
        return false;
    }

    let qualifies = |e: &Event| e.state == WorkflowState::Spiked && e.dates.end < cutoff;
    qualifies(reference)
        && timeline.historic.iter().all(qualifies)
        && timeline.past.iter().all(qualifies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::RecurringRule;
    use crate::services::fixtures::{daily_series, utc};
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn starts(events: &[Event]) -> Vec<DateTime<Utc>> {
        events.iter().map(|e| e.dates.start).collect()
    }

    #[test]
    fn timeline_from_sixth_of_ten_daily_instances() {
        let now = Utc::now();
        let series = daily_series("s1", now - Duration::days(2) - Duration::minutes(30), 10);

        let timeline = recurring_timeline(&series[5], &series, now);
        assert_eq!(timeline.historic.len(), 2);
        assert_eq!(timeline.past.len(), 3);
        assert_eq!(timeline.future.len(), 4);
    }

    #[test]
    fn single_scope_detaches_the_instance() {
        let series = daily_series("s1", utc("2024-04-01T10:00:00Z"), 3);
        let mut dates = series[1].dates.clone();
        dates.start = utc("2024-04-02T15:00:00Z");
        dates.end = utc("2024-04-02T16:00:00Z");

        let diff = SeriesMaterializer::new(200)
            .reconcile(
                "s1",
                &DatesChange {
                    event_id: series[1].id.clone(),
                    dates,
                },
                UpdateScope::Single,
                &series,
            )
            .unwrap();

        assert_eq!(diff.to_update.len(), 1);
        let updated = &diff.to_update[0];
        assert!(updated.detached);
        assert!(updated.dates.recurring_rule.is_none());
        assert_eq!(updated.recurrence_id.as_deref(), Some("s1"));
        assert!(diff.to_create.is_empty() && diff.to_delete.is_empty());
    }

    #[test]
    fn all_scope_moves_time_and_shrinks_series() {
        let series = daily_series("s1", utc("2024-04-01T10:00:00Z"), 5);
        let mut dates = series[2].dates.clone();
        dates.start = utc("2024-04-03T14:00:00Z");
        dates.end = utc("2024-04-03T15:00:00Z");
        dates.recurring_rule = Some(RecurringRule::daily_count(3));

        let diff = SeriesMaterializer::new(200)
            .reconcile(
                "s1",
                &DatesChange {
                    event_id: series[2].id.clone(),
                    dates,
                },
                UpdateScope::All,
                &series,
            )
            .unwrap();

        assert_eq!(
            starts(&diff.to_update),
            vec![
                utc("2024-04-01T14:00:00Z"),
                utc("2024-04-02T14:00:00Z"),
                utc("2024-04-03T14:00:00Z")
            ]
        );
        assert_eq!(diff.to_update[0].id, series[0].id);
        assert_eq!(diff.to_delete.len(), 2);
        assert!(diff.to_create.is_empty());
    }

    #[test]
    fn future_scope_keeps_earlier_instances_and_grows() {
        let series = daily_series("s1", utc("2024-04-01T10:00:00Z"), 4);
        let mut dates = series[2].dates.clone();
        dates.start = utc("2024-04-03T11:00:00Z");
        dates.end = utc("2024-04-03T12:00:00Z");
        dates.recurring_rule = Some(RecurringRule::daily_count(4));

        let diff = SeriesMaterializer::new(200)
            .reconcile(
                "s1",
                &DatesChange {
                    event_id: series[2].id.clone(),
                    dates,
                },
                UpdateScope::Future,
                &series,
            )
            .unwrap();

        let updated_ids: Vec<_> = diff.to_update.iter().map(|e| e.id.clone()).collect();
        assert_eq!(updated_ids, vec![series[2].id.clone(), series[3].id.clone()]);
        assert_eq!(
            starts(&diff.to_create),
            vec![utc("2024-04-05T11:00:00Z"), utc("2024-04-06T11:00:00Z")]
        );
        let created = &diff.to_create[0];
        assert_eq!(created.recurrence_id.as_deref(), Some("s1"));
        assert!(created.lock.is_none());
        assert_ne!(created.id, series[2].id);
        assert!(diff.to_delete.is_empty());
    }

    #[test]
    fn detached_instances_are_not_regenerated() {
        let mut series = daily_series("s1", utc("2024-04-01T10:00:00Z"), 3);
        series[1].detached = true;
        let mut dates = series[0].dates.clone();
        dates.recurring_rule = Some(RecurringRule::daily_count(2));

        let diff = SeriesMaterializer::new(200)
            .reconcile(
                "s1",
                &DatesChange {
                    event_id: series[0].id.clone(),
                    dates,
                },
                UpdateScope::All,
                &series,
            )
            .unwrap();

        let touched: Vec<_> = diff
            .to_update
            .iter()
            .chain(diff.to_delete.iter())
            .map(|e| e.id.clone())
            .collect();
        assert!(!touched.contains(&series[1].id));
        assert_eq!(diff.to_update.len(), 2);
    }

    #[test]
    fn unlimited_rule_is_capped() {
        let series = daily_series("s1", utc("2024-04-01T10:00:00Z"), 1);
        let mut dates = series[0].dates.clone();
        dates.recurring_rule = Some(RecurringRule {
            count: None,
            end_repeat_mode: crate::db::models::EndRepeatMode::Unlimited,
            ..RecurringRule::daily_count(0)
        });

        let diff = SeriesMaterializer::new(10)
            .reconcile(
                "s1",
                &DatesChange {
                    event_id: series[0].id.clone(),
                    dates,
                },
                UpdateScope::All,
                &series,
            )
            .unwrap();

        assert_eq!(diff.to_update.len() + diff.to_create.len(), 10);
    }

    #[test]
    fn empty_series_gives_empty_diff() {
        let series = daily_series("s1", utc("2024-04-01T10:00:00Z"), 1);
        let diff = SeriesMaterializer::new(200)
            .reconcile(
                "s1",
                &DatesChange {
                    event_id: series[0].id.clone(),
                    dates: series[0].dates.clone(),
                },
                UpdateScope::All,
                &[],
            )
            .unwrap();

        assert!(diff.is_empty());
    }

    #[test]
    fn one_unspiked_instance_blocks_series_expiry() {
        let now = Utc::now();
        let mut series = daily_series("s1", now - Duration::days(10), 3);
        for event in series.iter_mut() {
            event.state = WorkflowState::Spiked;
        }
        let reference = series[2].clone();

        assert!(is_series_expired_and_spiked(&series, &reference, now, now));

        series[0].state = WorkflowState::Scheduled;
        assert!(!is_series_expired_and_spiked(&series, &reference, now, now));
    }

    #[test]
    fn future_instances_block_series_expiry() {
        let now = Utc::now();
        let mut series = daily_series("s1", now - Duration::days(2), 5);
        for event in series.iter_mut() {
            event.state = WorkflowState::Spiked;
        }
        let reference = series[1].clone();
        let cutoff = now + Duration::days(10);

        assert!(!is_series_expired_and_spiked(&series, &reference, cutoff, now));
    }
}
