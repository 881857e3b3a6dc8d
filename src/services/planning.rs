use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::db::models::*;
use crate::db::store::*;
use crate::error::{AppError, AppResult};
use crate::services::assignments::AssignmentLinkCoordinator;
use crate::services::coverage_sync::PlanningCoverageSync;
use crate::services::init::Stores;
use crate::services::locks::LockManager;

#[derive(Clone)]
pub struct PlanningService {
    planning: Arc<dyn PlanningStore>,
    events: Arc<dyn EventStore>,
    history: Arc<dyn HistoryStore>,
    locks: LockManager,
    coverage_sync: PlanningCoverageSync,
    assignments: AssignmentLinkCoordinator,
}

impl PlanningService {
    pub fn new(
        stores: &Stores,
        locks: LockManager,
        coverage_sync: PlanningCoverageSync,
        assignments: AssignmentLinkCoordinator,
    ) -> Self {
        Self {
            planning: stores.planning.clone(),
            events: stores.events.clone(),
            history: stores.history.clone(),
            locks,
            coverage_sync,
            assignments,
        }
    }

    /// Create a planning item and register it on the events it covers.
    pub async fn create(&self, create: CreatePlanning, user: &str) -> AppResult<Planning> {
        let primaries = create
            .related_events
            .iter()
            .filter(|link| link.link_type == LinkType::Primary)
            .count();
        if primaries > 1 {
            return Err(AppError::Validation(
                "A planning item can have only one primary event".into(),
            ));
        }

        let mut related_events = Vec::with_capacity(create.related_events.len());
        let mut linked = Vec::new();
        for mut link in create.related_events {
            let event = self.events.find_one(&link.event_id).await?.ok_or_else(|| {
                AppError::Validation(format!("Related event {} not found", link.event_id))
            })?;
            link.recurrence_id = event.recurrence_id.clone();
            related_events.push(link);
            linked.push(event);
        }

        let mut coverage_ids = std::collections::HashSet::new();
        if let Some(duplicate) = create
            .coverages
            .iter()
            .find(|c| !coverage_ids.insert(c.coverage_id.as_str()))
        {
            return Err(AppError::Validation(format!(
                "Duplicate coverage id {}",
                duplicate.coverage_id
            )));
        }

        let now = Utc::now();
        let planning = self
            .planning
            .insert(&Planning {
                id: Uuid::new_v4().to_string(),
                etag: String::new(),
                slugline: create.slugline,
                planning_date: create.planning_date,
                related_events,
                coverages: create.coverages,
                state: WorkflowState::Draft,
                lock: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        for mut event in linked {
            if !event.related_plannings.contains(&planning.id) {
                event.related_plannings.push(planning.id.clone());
                self.events.update(&event).await?;
            }
        }

        self.history
            .record(
                CreateHistoryEntry::new(LockResource::Planning.as_str(), &planning.id, "create")
                    .by(Some(user), None)
                    .with_update(json!({ "slugline": planning.slugline })),
            )
            .await?;

        Ok(planning)
    }

    /// Read a planning item with its coverage projections refreshed.
    pub async fn get(&self, planning_id: &str) -> AppResult<Planning> {
        let planning = self
            .planning
            .find_one(planning_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Planning item {} not found", planning_id)))?;
        self.coverage_sync.sync(planning).await
    }

    pub async fn add_coverage(&self, planning_id: &str, coverage: Coverage) -> AppResult<Planning> {
        let mut planning = self
            .planning
            .find_one(planning_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Planning item {} not found", planning_id)))?;
        if planning.coverage(&coverage.coverage_id).is_some() {
            return Err(AppError::Validation(format!(
                "Coverage {} already exists on planning item {}",
                coverage.coverage_id, planning_id
            )));
        }
        planning.coverages.push(coverage);
        self.planning.update(&planning).await
    }

    pub async fn create_assignment(
        &self,
        planning_id: &str,
        coverage_id: &str,
        user: Option<&str>,
        desk: Option<&str>,
        assignor: &str,
    ) -> AppResult<Assignment> {
        self.assignments
            .create_for_coverage(planning_id, coverage_id, user, desk, assignor)
            .await
    }

    /// Spike a planning item. Requires the caller's lock.
    pub async fn spike(&self, planning_id: &str, session: &str) -> AppResult<Planning> {
        self.transition(planning_id, session, "spike", WorkflowState::Spiked, |s| {
            !matches!(s, WorkflowState::Spiked | WorkflowState::Killed)
        })
        .await
    }

    pub async fn unspike(&self, planning_id: &str, session: &str) -> AppResult<Planning> {
        self.transition(planning_id, session, "unspike", WorkflowState::Draft, |s| {
            s == WorkflowState::Spiked
        })
        .await
    }

    async fn transition(
        &self,
        planning_id: &str,
        session: &str,
        operation: &str,
        state: WorkflowState,
        allowed: impl Fn(WorkflowState) -> bool,
    ) -> AppResult<Planning> {
        let lock = self
            .locks
            .validate(LockResource::Planning, planning_id, session)
            .await?;
        let mut planning = self
            .planning
            .find_one(planning_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Planning item {} not found", planning_id)))?;
        if !allowed(planning.state) {
            return Err(AppError::Validation(format!(
                "Planning item {} is {} and cannot {}",
                planning_id,
                planning.state.as_str(),
                operation
            )));
        }
        planning.state = state;
        let planning = self.planning.update(&planning).await?;
        self.history
            .record(
                CreateHistoryEntry::new(LockResource::Planning.as_str(), planning_id, operation)
                    .by(Some(&lock.user), Some(session)),
            )
            .await?;
        Ok(planning)
    }
}
