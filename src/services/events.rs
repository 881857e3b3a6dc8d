use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::config::PlanningConfig;
use crate::db::models::*;
use crate::db::store::*;
use crate::error::{AppError, AppResult};
use crate::services::assignments::AssignmentLinkCoordinator;
use crate::services::init::Stores;
use crate::services::locks::LockManager;
use crate::services::notifications::NotificationSink;
use crate::services::recurrence::expand;
use crate::services::series::{DatesChange, SeriesDiff, SeriesMaterializer, UpdateScope};

/// Edits of events made by a user holding the event's lock.
#[derive(Clone)]
pub struct EventService {
    events: Arc<dyn EventStore>,
    history: Arc<dyn HistoryStore>,
    locks: LockManager,
    assignments: AssignmentLinkCoordinator,
    notifier: Arc<dyn NotificationSink>,
    materializer: SeriesMaterializer,
    max_recurrent_events: usize,
}

impl EventService {
    pub fn new(
        stores: &Stores,
        locks: LockManager,
        assignments: AssignmentLinkCoordinator,
        notifier: Arc<dyn NotificationSink>,
        config: &PlanningConfig,
    ) -> Self {
        Self {
            events: stores.events.clone(),
            history: stores.history.clone(),
            locks,
            assignments,
            notifier,
            materializer: SeriesMaterializer::new(config.max_recurrent_events),
            max_recurrent_events: config.max_recurrent_events,
        }
    }

    pub async fn get(&self, event_id: &str) -> AppResult<Event> {
        self.events
            .find_one(event_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Event {} not found", event_id)))
    }

    async fn record(&self, event: &Event, operation: &str, session: Option<&str>, update: serde_json::Value) {
        let user = event.lock.as_ref().map(|l| l.user.as_str());
        let entry = CreateHistoryEntry::new(LockResource::Events.as_str(), &event.id, operation)
            .by(user, session)
            .with_update(update);
        if let Err(e) = self.history.record(entry).await {
            tracing::warn!("Failed to write history for event {}: {:?}", event.id, e);
        }
    }

    /// Create an event; a recurring rule materializes the whole series.
    pub async fn create(&self, create: CreateEvent) -> AppResult<Vec<Event>> {
        let now = Utc::now();
        let template = Event {
            id: Uuid::new_v4().to_string(),
            etag: String::new(),
            name: create.name,
            recurrence_id: None,
            dates: create.dates,
            state: create.state,
            detached: false,
            related_plannings: Vec::new(),
            lock: None,
            created_at: now,
            updated_at: now,
        };

        let Some(ref rule) = template.dates.recurring_rule else {
            let event = self.events.insert(&template).await?;
            self.notifier
                .notify("events:created", json!({ "item": event.id }));
            return Ok(vec![event]);
        };

        let recurrence_id = create
            .recurrence_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let duration = template.dates.duration();
        let starts: Vec<_> = expand(template.dates.start, rule, template.dates.tz)?
            .take(self.max_recurrent_events)
            .collect();

        let mut series = Vec::with_capacity(starts.len());
        for (index, start) in starts.into_iter().enumerate() {
            let mut instance = template.clone();
            if index > 0 {
                instance.id = Uuid::new_v4().to_string();
            }
            instance.recurrence_id = Some(recurrence_id.clone());
            instance.dates.start = start;
            instance.dates.end = start + duration;
            series.push(self.events.insert(&instance).await?);
        }

        tracing::info!("Created series {} with {} instances", recurrence_id, series.len());
        self.notifier.notify(
            "events:created",
            json!({ "recurrence_id": recurrence_id, "instances": series.len() }),
        );
        Ok(series)
    }

    /// Change the dates (and rule) of an event the caller has locked.
    ///
    /// For a series, `scope` picks which instances follow the edit; the
    /// returned diff is what was written.
    pub async fn update_dates(
        &self,
        event_id: &str,
        dates: EventDates,
        scope: UpdateScope,
        session: &str,
    ) -> AppResult<SeriesDiff> {
        self.locks
            .validate(LockResource::Events, event_id, session)
            .await?;
        let event = self.get(event_id).await?;

        let Some(ref recurrence_id) = event.recurrence_id else {
            if dates.recurring_rule.is_some() {
                return Err(AppError::Validation(format!(
                    "Event {} is not part of a series; create a new recurring event instead",
                    event_id
                )));
            }
            if dates.end < dates.start {
                return Err(AppError::Validation("Event must not end before it starts".into()));
            }
            let mut updated = event.clone();
            updated.dates = dates;
            let updated = self.events.update(&updated).await?;
            self.record(&updated, "update_dates", Some(session), json!({ "scope": "single" }))
                .await;
            self.notifier
                .notify("events:updated", json!({ "item": event_id }));
            return Ok(SeriesDiff {
                to_update: vec![updated],
                ..SeriesDiff::default()
            });
        };

        if dates.end < dates.start {
            return Err(AppError::Validation("Event must not end before it starts".into()));
        }

        let existing = self.events.find_series(recurrence_id).await?;
        let change = DatesChange {
            event_id: event_id.to_string(),
            dates,
        };
        let diff = self
            .materializer
            .reconcile(recurrence_id, &change, scope, &existing)?;

        let mut written = SeriesDiff::default();
        for event in &diff.to_update {
            written.to_update.push(self.events.update(event).await?);
        }
        for event in &diff.to_create {
            written.to_create.push(self.events.insert(event).await?);
        }
        for event in &diff.to_delete {
            if !event.related_plannings.is_empty() {
                tracing::warn!(
                    "Removing series instance {} still linked to planning items {:?}",
                    event.id,
                    event.related_plannings
                );
            }
            self.events.delete(&event.id).await?;
            written.to_delete.push(event.clone());
        }

        tracing::info!(
            "Updated dates of series {}: {} updated, {} created, {} deleted",
            recurrence_id,
            written.to_update.len(),
            written.to_create.len(),
            written.to_delete.len()
        );
        self.record(
            &event,
            "update_dates",
            Some(session),
            json!({
                "scope": scope,
                "updated": written.to_update.len(),
                "created": written.to_create.len(),
                "deleted": written.to_delete.len(),
            }),
        )
        .await;
        self.notifier.notify(
            "events:updated",
            json!({ "item": event_id, "recurrence_id": recurrence_id, "scope": scope }),
        );

        Ok(written)
    }

    /// Instances of `event`'s series selected by `scope`, in start order.
    async fn scope_targets(&self, event: &Event, scope: UpdateScope) -> AppResult<Vec<Event>> {
        let Some(ref recurrence_id) = event.recurrence_id else {
            return Ok(vec![event.clone()]);
        };
        let series = self.events.find_series(recurrence_id).await?;
        Ok(match scope {
            UpdateScope::Single => vec![event.clone()],
            UpdateScope::Future => series
                .into_iter()
                .filter(|e| e.id == event.id || e.dates.start > event.dates.start)
                .collect(),
            UpdateScope::All => series,
        })
    }

    async fn set_state(
        &self,
        event_id: &str,
        session: &str,
        scope: UpdateScope,
        state: WorkflowState,
        allowed: impl Fn(WorkflowState) -> bool,
    ) -> AppResult<Vec<Event>> {
        self.locks
            .validate(LockResource::Events, event_id, session)
            .await?;
        let event = self.get(event_id).await?;
        if !allowed(event.state) {
            return Err(AppError::Validation(format!(
                "Event {} is {} and cannot become {}",
                event_id,
                event.state.as_str(),
                state.as_str()
            )));
        }

        let mut changed = Vec::new();
        for mut target in self.scope_targets(&event, scope).await? {
            if !allowed(target.state) {
                continue;
            }
            target.state = state;
            changed.push(self.events.update(&target).await?);
        }
        Ok(changed)
    }

    pub async fn spike(&self, event_id: &str, session: &str, scope: UpdateScope) -> AppResult<Vec<Event>> {
        let spiked = self
            .set_state(event_id, session, scope, WorkflowState::Spiked, |s| {
                !matches!(s, WorkflowState::Spiked | WorkflowState::Killed)
            })
            .await?;
        for event in &spiked {
            self.record(event, "spike", Some(session), json!({})).await;
        }
        self.notifier.notify(
            "events:spiked",
            json!({ "item": event_id, "count": spiked.len() }),
        );
        Ok(spiked)
    }

    /// Unspiked events go back to draft.
    pub async fn unspike(&self, event_id: &str, session: &str, scope: UpdateScope) -> AppResult<Vec<Event>> {
        let restored = self
            .set_state(event_id, session, scope, WorkflowState::Draft, |s| {
                s == WorkflowState::Spiked
            })
            .await?;
        for event in &restored {
            self.record(event, "unspike", Some(session), json!({})).await;
        }
        self.notifier.notify(
            "events:unspiked",
            json!({ "item": event_id, "count": restored.len() }),
        );
        Ok(restored)
    }

    /// Cancel events and the open assignments of the planning items they drive.
    pub async fn cancel(&self, event_id: &str, session: &str, scope: UpdateScope) -> AppResult<Vec<Event>> {
        let cancelled = self
            .set_state(event_id, session, scope, WorkflowState::Cancelled, |s| {
                !matches!(
                    s,
                    WorkflowState::Cancelled | WorkflowState::Spiked | WorkflowState::Killed
                )
            })
            .await?;

        let mut assignments_cancelled = 0;
        for event in &cancelled {
            self.record(event, "cancel", Some(session), json!({})).await;
            for planning_id in &event.related_plannings {
                match self.assignments.cancel_for_planning(planning_id).await {
                    Ok(n) => assignments_cancelled += n,
                    Err(e) => tracing::warn!(
                        "Failed to cancel assignments of planning item {}: {:?}",
                        planning_id,
                        e
                    ),
                }
            }
        }

        self.notifier.notify(
            "events:cancelled",
            json!({
                "item": event_id,
                "count": cancelled.len(),
                "assignments": assignments_cancelled,
            }),
        );
        Ok(cancelled)
    }

    /// Delete events that no planning item references.
    pub async fn delete(&self, event_id: &str, session: &str, scope: UpdateScope) -> AppResult<usize> {
        self.locks
            .validate(LockResource::Events, event_id, session)
            .await?;
        let event = self.get(event_id).await?;
        let targets = self.scope_targets(&event, scope).await?;

        if let Some(linked) = targets.iter().find(|e| !e.related_plannings.is_empty()) {
            return Err(AppError::Validation(format!(
                "Event {} is referenced by planning items and cannot be deleted",
                linked.id
            )));
        }

        for target in &targets {
            self.events.delete(&target.id).await?;
        }
        self.record(&event, "delete", Some(session), json!({ "count": targets.len() }))
            .await;
        self.notifier.notify(
            "events:deleted",
            json!({ "item": event_id, "count": targets.len() }),
        );
        Ok(targets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::services::fixtures::{planning, planning_config, test_stores, utc};
    use chrono::Duration;
    use chrono_tz::Tz;
    use pretty_assertions::assert_eq;

    struct Setup {
        stores: Stores,
        locks: LockManager,
        service: EventService,
    }

    async fn setup() -> Setup {
        let (stores, sink) = test_stores().await;
        let config = Config::default();
        let locks = LockManager::new(&stores, &config.sweep);
        let assignments = AssignmentLinkCoordinator::new(
            &stores,
            locks.clone(),
            sink.clone(),
            &planning_config(false),
            &config.sweep,
        );
        let service = EventService::new(&stores, locks.clone(), assignments, sink, &planning_config(false));
        Setup {
            stores,
            locks,
            service,
        }
    }

    fn daily(start: &str, count: i64) -> CreateEvent {
        let start = utc(start);
        CreateEvent {
            name: "Council meeting".into(),
            recurrence_id: None,
            dates: EventDates {
                start,
                end: start + Duration::hours(2),
                tz: Tz::Europe__London,
                all_day: false,
                no_end_time: false,
                recurring_rule: Some(RecurringRule::daily_count(count)),
            },
            state: WorkflowState::Scheduled,
        }
    }

    #[tokio::test]
    async fn create_materializes_the_series() {
        let s = setup().await;
        let series = s.service.create(daily("2024-03-01T09:00:00Z", 4)).await.unwrap();

        assert_eq!(series.len(), 4);
        let recurrence_id = series[0].recurrence_id.clone().unwrap();
        assert!(series.iter().all(|e| e.recurrence_id.as_deref() == Some(recurrence_id.as_str())));
        assert_eq!(series[3].dates.start, utc("2024-03-04T09:00:00Z"));
        assert_eq!(series[3].dates.end, utc("2024-03-04T11:00:00Z"));
    }

    #[tokio::test]
    async fn edits_require_the_lock() {
        let s = setup().await;
        let series = s.service.create(daily("2024-03-01T09:00:00Z", 3)).await.unwrap();

        let result = s
            .service
            .update_dates(&series[0].id, series[0].dates.clone(), UpdateScope::All, "s1")
            .await;
        assert!(matches!(result, Err(AppError::NotLockOwner(_))));
    }

    #[tokio::test]
    async fn future_edit_moves_later_instances_only() {
        let s = setup().await;
        let series = s.service.create(daily("2024-03-01T09:00:00Z", 4)).await.unwrap();
        s.locks
            .acquire(LockResource::Events, &series[2].id, "u1", "s1", "edit")
            .await
            .unwrap();

        let mut dates = series[2].dates.clone();
        dates.start = utc("2024-03-03T14:00:00Z");
        dates.end = utc("2024-03-03T15:00:00Z");
        dates.recurring_rule = Some(RecurringRule::daily_count(2));
        let diff = s
            .service
            .update_dates(&series[2].id, dates, UpdateScope::Future, "s1")
            .await
            .unwrap();
        assert_eq!(diff.to_update.len(), 2);
        assert!(diff.to_create.is_empty());

        let stored = s
            .stores
            .events
            .find_series(series[0].recurrence_id.as_deref().unwrap())
            .await
            .unwrap();
        let starts: Vec<_> = stored.iter().map(|e| e.dates.start).collect();
        assert_eq!(
            starts,
            vec![
                utc("2024-03-01T09:00:00Z"),
                utc("2024-03-02T09:00:00Z"),
                utc("2024-03-03T14:00:00Z"),
                utc("2024-03-04T14:00:00Z"),
            ]
        );
        // the edited instance keeps its lock
        let edited = s.stores.events.find_one(&series[2].id).await.unwrap().unwrap();
        assert_eq!(edited.lock.unwrap().session, "s1");
    }

    #[tokio::test]
    async fn single_edit_detaches_the_instance() {
        let s = setup().await;
        let series = s.service.create(daily("2024-03-01T09:00:00Z", 3)).await.unwrap();
        s.locks
            .acquire(LockResource::Events, &series[1].id, "u1", "s1", "edit")
            .await
            .unwrap();

        let mut dates = series[1].dates.clone();
        dates.start = utc("2024-03-02T18:00:00Z");
        dates.end = utc("2024-03-02T19:00:00Z");
        s.service
            .update_dates(&series[1].id, dates, UpdateScope::Single, "s1")
            .await
            .unwrap();

        let edited = s.stores.events.find_one(&series[1].id).await.unwrap().unwrap();
        assert!(edited.detached);
        assert!(edited.dates.recurring_rule.is_none());
        assert_eq!(edited.recurrence_id, series[1].recurrence_id);
    }

    #[tokio::test]
    async fn spike_all_then_unspike_single() {
        let s = setup().await;
        let series = s.service.create(daily("2024-03-01T09:00:00Z", 3)).await.unwrap();
        s.locks
            .acquire(LockResource::Events, &series[0].id, "u1", "s1", "spike")
            .await
            .unwrap();

        let spiked = s.service.spike(&series[0].id, "s1", UpdateScope::All).await.unwrap();
        assert_eq!(spiked.len(), 3);
        assert!(matches!(
            s.service.spike(&series[0].id, "s1", UpdateScope::All).await,
            Err(AppError::Validation(_))
        ));

        let restored = s
            .service
            .unspike(&series[0].id, "s1", UpdateScope::Single)
            .await
            .unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].state, WorkflowState::Draft);
    }

    #[tokio::test]
    async fn cancel_cascades_to_assignments_of_related_planning() {
        let s = setup().await;
        let mut event = s
            .service
            .create(CreateEvent {
                recurrence_id: None,
                dates: EventDates {
                    recurring_rule: None,
                    ..daily("2024-03-01T09:00:00Z", 1).dates
                },
                ..daily("2024-03-01T09:00:00Z", 1)
            })
            .await
            .unwrap()
            .remove(0);

        s.stores
            .planning
            .insert(&planning("p1", vec![Coverage::new("c1", "text", "council")]))
            .await
            .unwrap();
        let assignment = s
            .service
            .assignments
            .create_for_coverage("p1", "c1", Some("reporter"), None, "editor")
            .await
            .unwrap();
        event.related_plannings = vec!["p1".into()];
        s.stores.events.update(&event).await.unwrap();

        s.locks
            .acquire(LockResource::Events, &event.id, "u1", "s1", "cancel")
            .await
            .unwrap();
        s.service.cancel(&event.id, "s1", UpdateScope::Single).await.unwrap();

        let cancelled = s.stores.assignments.find_one(&assignment.id).await.unwrap().unwrap();
        assert_eq!(cancelled.assigned_to.state, AssignmentState::Cancelled);
        let p1 = s.stores.planning.find_one("p1").await.unwrap().unwrap();
        assert_eq!(p1.coverage("c1").unwrap().workflow_status, CoverageStatus::Cancelled);

        assert!(matches!(
            s.service.delete(&event.id, "s1", UpdateScope::Single).await,
            Err(AppError::Validation(_))
        ));
    }
}
