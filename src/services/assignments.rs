//! Consistency between coverages, assignments and the content delivered for them.
//!
//! A coverage points at one assignment; the assignment points at zero or more
//! deliveries (content items). Linking moves the assignment forward in its
//! workflow, unlinking the last delivery moves it back to `assigned`, and every
//! state change is mirrored onto the coverage projection of the planning item.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::config::{PlanningConfig, SweepConfig};
use crate::db::models::*;
use crate::db::store::*;
use crate::error::{AppError, AppResult};
use crate::services::coverage_sync::project_assignment;
use crate::services::init::Stores;
use crate::services::locks::LockManager;
use crate::services::notifications::NotificationSink;
use crate::services::sweep::{keep_lease, run_exclusive};

pub const DELETE_ASSIGNMENTS_MUTEX: &str = "planning:delete_assignments";

/// Attempts for a system update of a planning item that lost an etag race.
const COVERAGE_UPDATE_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct AssignmentLinkCoordinator {
    assignments: Arc<dyn AssignmentStore>,
    deliveries: Arc<dyn DeliveryStore>,
    content: Arc<dyn ContentStore>,
    contacts: Arc<dyn ContactStore>,
    planning: Arc<dyn PlanningStore>,
    history: Arc<dyn HistoryStore>,
    mutex: Arc<dyn MutexLease>,
    locks: LockManager,
    notifier: Arc<dyn NotificationSink>,
    link_updates_to_coverages: bool,
    page_size: i64,
    max_loops: usize,
    mutex_ttl: Duration,
}

impl AssignmentLinkCoordinator {
    pub fn new(
        stores: &Stores,
        locks: LockManager,
        notifier: Arc<dyn NotificationSink>,
        config: &PlanningConfig,
        sweep: &SweepConfig,
    ) -> Self {
        Self {
            assignments: stores.assignments.clone(),
            deliveries: stores.deliveries.clone(),
            content: stores.content.clone(),
            contacts: stores.contacts.clone(),
            planning: stores.planning.clone(),
            history: stores.history.clone(),
            mutex: stores.mutex.clone(),
            locks,
            notifier,
            link_updates_to_coverages: config.link_updates_to_coverages,
            page_size: sweep.page_size.max(1),
            max_loops: sweep.max_loops,
            mutex_ttl: Duration::seconds(sweep.mutex_ttl_seconds),
        }
    }

    async fn find(&self, assignment_id: &str) -> AppResult<Assignment> {
        self.assignments
            .find_one(assignment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Assignment {} not found", assignment_id)))
    }

    async fn record(
        &self,
        assignment_id: &str,
        operation: &str,
        user: Option<&str>,
        update: serde_json::Value,
    ) -> AppResult<()> {
        self.history
            .record(
                CreateHistoryEntry::new(LockResource::Assignments.as_str(), assignment_id, operation)
                    .by(user, None)
                    .with_update(update),
            )
            .await
    }

    /// Apply `change` to one coverage of a planning item, re-reading on etag conflicts.
    async fn update_coverage<F>(&self, planning_id: &str, coverage_id: &str, change: F) -> AppResult<()>
    where
        F: Fn(&mut Coverage) + Send + Sync,
    {
        for attempt in 1..=COVERAGE_UPDATE_ATTEMPTS {
            let Some(mut planning) = self.planning.find_one(planning_id).await? else {
                tracing::warn!("Planning item {} not found; coverage not updated", planning_id);
                return Ok(());
            };
            let Some(coverage) = planning.coverage_mut(coverage_id) else {
                tracing::warn!(
                    "Coverage {} not found on planning item {}",
                    coverage_id,
                    planning_id
                );
                return Ok(());
            };
            change(coverage);

            match self.planning.update(&planning).await {
                Ok(_) => return Ok(()),
                Err(AppError::Conflict(_)) if attempt < COVERAGE_UPDATE_ATTEMPTS => {
                    tracing::debug!("Planning item {} changed concurrently, retrying", planning_id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn mirror(&self, assignment: &Assignment) -> AppResult<()> {
        self.update_coverage(&assignment.planning_item, &assignment.coverage_item, |coverage| {
            project_assignment(coverage, assignment)
        })
        .await
    }

    async fn save_state(&self, mut assignment: Assignment, state: AssignmentState) -> AppResult<Assignment> {
        assignment.assigned_to.state = state;
        let saved = self.assignments.update(&assignment).await?;
        self.mirror(&saved).await?;
        Ok(saved)
    }

    /// Stamp `item` with the assignment and add its delivery.
    async fn attach(&self, assignment: &Assignment, mut item: ContentItem, sequence_no: i64) -> AppResult<Delivery> {
        item.assignment_id = Some(assignment.id.clone());
        let item = self.content.update(&item).await?;

        self.deliveries
            .insert(CreateDelivery {
                item_id: item.id.clone(),
                assignment_id: assignment.id.clone(),
                planning_id: assignment.planning_item.clone(),
                coverage_id: assignment.coverage_item.clone(),
                item_state: item.state.clone(),
                sequence_no,
            })
            .await
    }

    /// Remove `delivery` and clear the item's link if it still points at the assignment.
    async fn detach(&self, delivery: &Delivery) -> AppResult<()> {
        if let Some(mut item) = self.content.find_one(&delivery.item_id).await? {
            if item.assignment_id.as_deref() == Some(delivery.assignment_id.as_str()) {
                item.assignment_id = None;
                self.content.update(&item).await?;
            }
        }
        self.deliveries.delete(&delivery.id).await
    }

    /// Drop a single item from another assignment, reverting it when nothing is left.
    async fn release_from(&self, assignment_id: &str, item_id: &str) -> AppResult<()> {
        let deliveries = self.deliveries.find_by_assignment(assignment_id).await?;
        for delivery in deliveries.iter().filter(|d| d.item_id == item_id) {
            self.detach(delivery).await?;
        }
        let left = deliveries.iter().filter(|d| d.item_id != item_id).count();
        if left == 0 {
            if let Some(previous) = self.assignments.find_one(assignment_id).await? {
                if matches!(
                    previous.assigned_to.state,
                    AssignmentState::InProgress | AssignmentState::Completed
                ) {
                    self.save_state(previous, AssignmentState::Assigned).await?;
                }
            }
        }
        Ok(())
    }

    /// Link content `item_id` to the assignment.
    ///
    /// With `reassign`, links the item or the assignment already have are
    /// replaced instead of rejected.
    pub async fn link(&self, assignment_id: &str, item_id: &str, reassign: bool) -> AppResult<Delivery> {
        let assignment = self
            .assignments
            .find_one(assignment_id)
            .await?
            .ok_or_else(|| AppError::Validation(format!("Assignment {} not found", assignment_id)))?;
        if assignment.assigned_to.state == AssignmentState::Cancelled {
            return Err(AppError::Validation(format!(
                "Assignment {} is cancelled",
                assignment_id
            )));
        }

        let item = self
            .content
            .find_one(item_id)
            .await?
            .ok_or_else(|| AppError::Validation(format!("Content item {} not found", item_id)))?;

        match item.assignment_id.as_deref() {
            Some(current) if current == assignment_id => {
                return Err(AppError::Validation(format!(
                    "Content item {} is already linked to assignment {}",
                    item_id, assignment_id
                )))
            }
            Some(current) if !reassign => {
                return Err(AppError::Validation(format!(
                    "Content item {} is already linked to assignment {}",
                    item_id, current
                )))
            }
            Some(current) => self.release_from(current, item_id).await?,
            None => {}
        }

        let mut existing = self.deliveries.find_by_assignment(assignment_id).await?;
        if !existing.is_empty() {
            let continues_chain = self.link_updates_to_coverages
                && item
                    .rewrite_of
                    .as_ref()
                    .is_some_and(|previous| existing.iter().any(|d| &d.item_id == previous));

            if !continues_chain {
                if !reassign {
                    return Err(AppError::Validation(format!(
                        "Assignment {} already has content linked",
                        assignment_id
                    )));
                }
                for delivery in &existing {
                    self.detach(delivery).await?;
                }
                existing.clear();
            }
        }

        // release_from may have rewritten the item; reload for a current etag
        let item = self
            .content
            .find_one(item_id)
            .await?
            .ok_or_else(|| AppError::Validation(format!("Content item {} not found", item_id)))?;

        let mut sequence_no = existing.iter().map(|d| d.sequence_no + 1).max().unwrap_or(0);
        let mut published = item.is_published();
        let next_rewrite = item.rewritten_by.clone();
        let delivery = self.attach(&assignment, item, sequence_no).await?;
        let mut linked = vec![delivery.item_id.clone()];

        if self.link_updates_to_coverages {
            let mut seen: HashSet<String> = linked.iter().cloned().collect();
            let mut next = next_rewrite;
            while let Some(rewrite_id) = next.take() {
                if !seen.insert(rewrite_id.clone()) {
                    break;
                }
                let Some(rewrite) = self.content.find_one(&rewrite_id).await? else {
                    break;
                };
                if rewrite.assignment_id.is_some() {
                    break;
                }
                sequence_no += 1;
                published = rewrite.is_published();
                next = rewrite.rewritten_by.clone();
                let added = self.attach(&assignment, rewrite, sequence_no).await?;
                linked.push(added.item_id);
            }
        }

        let state = if published {
            AssignmentState::Completed
        } else {
            AssignmentState::InProgress
        };
        let assignment = self.save_state(assignment, state).await?;

        self.record(
            assignment_id,
            "content_link",
            assignment.assigned_to.user.as_deref(),
            json!({ "items": linked, "state": state.as_str() }),
        )
        .await?;
        self.notifier.notify(
            "assignments:linked",
            json!({
                "assignment": assignment_id,
                "items": linked,
                "planning": assignment.planning_item,
                "coverage": assignment.coverage_item,
                "state": state.as_str(),
            }),
        );
        tracing::info!(
            "Linked {} content item(s) to assignment {}",
            linked.len(),
            assignment_id
        );

        Ok(delivery)
    }

    /// Unlink content `item_id`; in link-updates mode the whole rewrite chain goes.
    pub async fn unlink(&self, assignment_id: &str, item_id: &str) -> AppResult<Assignment> {
        let assignment = self
            .assignments
            .find_one(assignment_id)
            .await?
            .ok_or_else(|| AppError::Validation(format!("Assignment {} not found", assignment_id)))?;

        let deliveries = self.deliveries.find_by_assignment(assignment_id).await?;
        if !deliveries.iter().any(|d| d.item_id == item_id) {
            return Err(AppError::Validation(format!(
                "Content item {} is not linked to assignment {}",
                item_id, assignment_id
            )));
        }

        let removed: Vec<&Delivery> = if self.link_updates_to_coverages {
            deliveries.iter().collect()
        } else {
            deliveries.iter().filter(|d| d.item_id == item_id).collect()
        };
        for delivery in &removed {
            self.detach(delivery).await?;
        }

        let remaining = deliveries.len() - removed.len();
        let assignment = if remaining == 0 && assignment.assigned_to.state != AssignmentState::Cancelled {
            self.save_state(assignment, AssignmentState::Assigned).await?
        } else {
            assignment
        };

        let items: Vec<&str> = removed.iter().map(|d| d.item_id.as_str()).collect();
        self.record(
            assignment_id,
            "content_unlink",
            assignment.assigned_to.user.as_deref(),
            json!({ "items": items }),
        )
        .await?;
        self.notifier.notify(
            "assignments:unlinked",
            json!({
                "assignment": assignment_id,
                "items": items,
                "planning": assignment.planning_item,
                "coverage": assignment.coverage_item,
                "state": assignment.assigned_to.state.as_str(),
            }),
        );

        Ok(assignment)
    }

    /// Mark the assignment accepted. Accepting twice is a no-op.
    pub async fn accept(&self, assignment_id: &str, accepting_identity: &str) -> AppResult<Assignment> {
        let mut assignment = self.find(assignment_id).await?;
        if assignment.accepted {
            return Ok(assignment);
        }

        assignment.accepted = true;
        let assignment = self.assignments.update(&assignment).await?;

        let accepted_by = if assignment.assigned_to.user.as_deref() != Some(accepting_identity) {
            match self.contacts.find_one(accepting_identity).await? {
                Some(contact) => contact.display_name(),
                None => accepting_identity.to_string(),
            }
        } else {
            accepting_identity.to_string()
        };

        self.record(
            assignment_id,
            "accepted",
            Some(accepting_identity),
            json!({ "accepted_by": accepted_by }),
        )
        .await?;
        self.notifier.notify(
            "assignments:accepted",
            json!({ "assignment": assignment_id, "accepted_by": accepted_by }),
        );

        Ok(assignment)
    }

    /// Create the assignment of a coverage. Assigned when a user or desk is given.
    pub async fn create_for_coverage(
        &self,
        planning_id: &str,
        coverage_id: &str,
        user: Option<&str>,
        desk: Option<&str>,
        assignor: &str,
    ) -> AppResult<Assignment> {
        let planning = self
            .planning
            .find_one(planning_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Planning item {} not found", planning_id)))?;
        let coverage = planning.coverage(coverage_id).ok_or_else(|| {
            AppError::NotFound(format!(
                "Coverage {} not found on planning item {}",
                coverage_id, planning_id
            ))
        })?;
        if let Some(ref existing) = coverage.assigned_to.assignment_id {
            return Err(AppError::Validation(format!(
                "Coverage {} already has assignment {}",
                coverage_id, existing
            )));
        }

        let state = if user.is_some() || desk.is_some() {
            AssignmentState::Assigned
        } else {
            AssignmentState::Draft
        };
        let now = Utc::now();
        let assignment = self
            .assignments
            .insert(&Assignment {
                id: Uuid::new_v4().to_string(),
                etag: String::new(),
                planning_item: planning_id.to_string(),
                coverage_item: coverage_id.to_string(),
                assigned_to: AssignedTo {
                    state,
                    user: user.map(str::to_string),
                    desk: desk.map(str::to_string),
                    assignor_user: Some(assignor.to_string()),
                    contact: None,
                },
                accepted: false,
                lock: None,
                to_delete: false,
                created_at: now,
                updated_at: now,
            })
            .await?;

        self.mirror(&assignment).await?;
        self.record(
            &assignment.id,
            "create",
            Some(assignor),
            json!({ "planning": planning_id, "coverage": coverage_id, "state": state.as_str() }),
        )
        .await?;
        self.notifier.notify(
            "assignments:created",
            json!({ "assignment": assignment.id, "planning": planning_id, "coverage": coverage_id }),
        );

        Ok(assignment)
    }

    /// Hand the assignment to another user or desk. Requires the caller's lock.
    pub async fn reassign(
        &self,
        assignment_id: &str,
        user: Option<&str>,
        desk: Option<&str>,
        session: &str,
    ) -> AppResult<Assignment> {
        let lock = self
            .locks
            .validate(LockResource::Assignments, assignment_id, session)
            .await?;
        let mut assignment = self.find(assignment_id).await?;
        if matches!(
            assignment.assigned_to.state,
            AssignmentState::Completed | AssignmentState::Cancelled
        ) {
            return Err(AppError::Validation(format!(
                "Assignment {} is {} and cannot be reassigned",
                assignment_id,
                assignment.assigned_to.state.as_str()
            )));
        }

        assignment.assigned_to.user = user.map(str::to_string);
        assignment.assigned_to.desk = desk.map(str::to_string);
        assignment.assigned_to.assignor_user = Some(lock.user.clone());
        assignment.accepted = false;
        let state = match assignment.assigned_to.state {
            AssignmentState::Draft if user.is_some() || desk.is_some() => AssignmentState::Assigned,
            other => other,
        };
        let assignment = self.save_state(assignment, state).await?;

        self.record(
            assignment_id,
            "reassigned",
            Some(&lock.user),
            json!({ "user": user, "desk": desk }),
        )
        .await?;
        self.notifier.notify(
            "assignments:reassigned",
            json!({ "assignment": assignment_id, "user": user, "desk": desk }),
        );

        Ok(assignment)
    }

    /// Mark the assignment completed. Requires the caller's lock.
    pub async fn complete(&self, assignment_id: &str, session: &str) -> AppResult<Assignment> {
        let lock = self
            .locks
            .validate(LockResource::Assignments, assignment_id, session)
            .await?;
        let assignment = self.find(assignment_id).await?;
        if !matches!(
            assignment.assigned_to.state,
            AssignmentState::Assigned | AssignmentState::InProgress
        ) {
            return Err(AppError::Validation(format!(
                "Assignment {} is {} and cannot be completed",
                assignment_id,
                assignment.assigned_to.state.as_str()
            )));
        }

        let assignment = self.save_state(assignment, AssignmentState::Completed).await?;
        self.record(assignment_id, "complete", Some(&lock.user), json!({}))
            .await?;
        self.notifier
            .notify("assignments:completed", json!({ "assignment": assignment_id }));

        Ok(assignment)
    }

    /// Cancel every open assignment of a planning item. Returns how many changed.
    pub async fn cancel_for_planning(&self, planning_id: &str) -> AppResult<usize> {
        let mut cancelled = 0;
        for assignment in self.assignments.find_by_planning(planning_id).await? {
            if matches!(
                assignment.assigned_to.state,
                AssignmentState::Completed | AssignmentState::Cancelled
            ) {
                continue;
            }
            let id = assignment.id.clone();
            self.save_state(assignment, AssignmentState::Cancelled).await?;
            self.record(&id, "cancelled", None, json!({ "planning": planning_id }))
                .await?;
            self.notifier
                .notify("assignments:cancelled", json!({ "assignment": id }));
            cancelled += 1;
        }
        Ok(cancelled)
    }

    /// Delete an assignment on behalf of `session`.
    ///
    /// Fails with a bad request while another session holds its lock.
    pub async fn delete_action(&self, assignment_id: &str, session: &str) -> AppResult<()> {
        let assignment = self.find(assignment_id).await?;
        if let Some(ref lock) = assignment.lock {
            if lock.session != session {
                return Err(AppError::BadRequest(format!(
                    "Assignment {} is locked by {} and cannot be deleted",
                    assignment_id, lock.user
                )));
            }
        }
        self.remove(assignment).await
    }

    /// Delete an assignment regardless of locks. Returns false when it is already gone.
    pub async fn delete_for_system(&self, assignment_id: &str) -> AppResult<bool> {
        match self.assignments.find_one(assignment_id).await? {
            Some(assignment) => {
                self.remove(assignment).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, assignment: Assignment) -> AppResult<()> {
        for delivery in self.deliveries.find_by_assignment(&assignment.id).await? {
            self.detach(&delivery).await?;
        }

        let assignment_id = assignment.id.clone();
        self.update_coverage(&assignment.planning_item, &assignment.coverage_item, |coverage| {
            if coverage.assigned_to.assignment_id.as_deref() == Some(assignment_id.as_str()) {
                coverage.assigned_to = CoverageAssignee::default();
                coverage.workflow_status = CoverageStatus::Draft;
            }
        })
        .await?;

        self.assignments.delete(&assignment.id).await?;
        self.record(
            &assignment.id,
            "delete",
            None,
            json!({ "planning": assignment.planning_item, "coverage": assignment.coverage_item }),
        )
        .await?;
        self.notifier.notify(
            "assignments:removed",
            json!({
                "assignment": assignment.id,
                "planning": assignment.planning_item,
                "coverage": assignment.coverage_item,
            }),
        );
        tracing::info!("Deleted assignment {}", assignment.id);

        Ok(())
    }

    /// Delete every assignment flagged `to_delete`. Returns how many were
    /// deleted, or `None` when another process is already deleting them.
    pub async fn delete_marked(&self) -> AppResult<Option<usize>> {
        run_exclusive(
            self.mutex.as_ref(),
            DELETE_ASSIGNMENTS_MUTEX,
            self.mutex_ttl,
            self.delete_marked_pages(),
        )
        .await
    }

    async fn delete_marked_pages(&self) -> AppResult<usize> {
        let mut deleted = 0;
        // deleted rows drop out of the query, so only failures advance the offset
        let mut offset = 0i64;

        for _ in 0..self.max_loops {
            let page = self
                .assignments
                .find_marked_for_delete(offset, self.page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            let last_page = (page.len() as i64) < self.page_size;

            for assignment in page {
                let id = assignment.id.clone();
                match self.remove(assignment).await {
                    Ok(()) => deleted += 1,
                    Err(e) => {
                        tracing::warn!("Failed to delete assignment {}: {:?}", id, e);
                        offset += 1;
                    }
                }
            }

            keep_lease(self.mutex.as_ref(), DELETE_ASSIGNMENTS_MUTEX, self.mutex_ttl).await;
            if last_page {
                break;
            }
        }

        Ok(deleted)
    }

    /// Deliveries of an assignment in chain order.
    pub async fn deliveries(&self, assignment_id: &str) -> AppResult<Vec<Delivery>> {
        self.deliveries.find_by_assignment(assignment_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::repository::SqliteMutexLease;
    use crate::services::fixtures::{
        planning, planning_config, test_pool_stores, UndeletableAssignment,
    };
    use crate::services::notifications::RecordingNotificationSink;
    use pretty_assertions::assert_eq;

    struct Setup {
        pool: sqlx::SqlitePool,
        stores: Stores,
        sink: Arc<RecordingNotificationSink>,
        coordinator: AssignmentLinkCoordinator,
        assignment: Assignment,
    }

    async fn setup(link_updates: bool) -> Setup {
        let (pool, stores, sink) = test_pool_stores().await;
        stores
            .planning
            .insert(&planning("p1", vec![Coverage::new("c1", "text", "vote")]))
            .await
            .unwrap();

        let coordinator = coordinator(&stores, sink.clone(), link_updates, &Config::default().sweep);
        let assignment = coordinator
            .create_for_coverage("p1", "c1", Some("reporter"), None, "editor")
            .await
            .unwrap();

        Setup {
            pool,
            stores,
            sink,
            coordinator,
            assignment,
        }
    }

    fn coordinator(
        stores: &Stores,
        sink: Arc<RecordingNotificationSink>,
        link_updates: bool,
        sweep: &SweepConfig,
    ) -> AssignmentLinkCoordinator {
        let locks = LockManager::new(stores, sweep);
        AssignmentLinkCoordinator::new(stores, locks, sink, &planning_config(link_updates), sweep)
    }

    async fn mark_for_delete(stores: &Stores, id: &str) {
        let mut marked = stores.assignments.find_one(id).await.unwrap().unwrap();
        marked.to_delete = true;
        stores.assignments.update(&marked).await.unwrap();
    }

    async fn content(stores: &Stores, state: &str, rewrite_of: Option<&str>) -> ContentItem {
        stores
            .content
            .insert(CreateContentItem {
                slugline: "vote".into(),
                item_type: "text".into(),
                state: state.into(),
                rewrite_of: rewrite_of.map(str::to_string),
            })
            .await
            .unwrap()
    }

    async fn state_of(stores: &Stores, id: &str) -> AssignmentState {
        stores
            .assignments
            .find_one(id)
            .await
            .unwrap()
            .unwrap()
            .assigned_to
            .state
    }

    #[tokio::test]
    async fn create_projects_onto_coverage_and_rejects_a_second() {
        let s = setup(false).await;
        assert_eq!(s.assignment.assigned_to.state, AssignmentState::Assigned);

        let p1 = s.stores.planning.find_one("p1").await.unwrap().unwrap();
        let coverage = p1.coverage("c1").unwrap();
        assert_eq!(coverage.assigned_to.assignment_id.as_deref(), Some(s.assignment.id.as_str()));
        assert_eq!(coverage.workflow_status, CoverageStatus::Active);

        assert!(matches!(
            s.coordinator
                .create_for_coverage("p1", "c1", Some("other"), None, "editor")
                .await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn link_then_unlink_restores_assigned() {
        let s = setup(false).await;
        let item = content(&s.stores, "in_progress", None).await;

        let delivery = s.coordinator.link(&s.assignment.id, &item.id, false).await.unwrap();
        assert_eq!(delivery.item_state, "in_progress");
        assert_eq!(state_of(&s.stores, &s.assignment.id).await, AssignmentState::InProgress);
        let linked = s.stores.content.find_one(&item.id).await.unwrap().unwrap();
        assert_eq!(linked.assignment_id.as_deref(), Some(s.assignment.id.as_str()));

        s.coordinator.unlink(&s.assignment.id, &item.id).await.unwrap();
        assert_eq!(state_of(&s.stores, &s.assignment.id).await, AssignmentState::Assigned);
        assert!(s.coordinator.deliveries(&s.assignment.id).await.unwrap().is_empty());
        let unlinked = s.stores.content.find_one(&item.id).await.unwrap().unwrap();
        assert!(unlinked.assignment_id.is_none());

        assert_eq!(
            s.sink.events(),
            vec!["assignments:created", "assignments:linked", "assignments:unlinked"]
        );
    }

    #[tokio::test]
    async fn unlinking_a_rewrite_chain_removes_every_delivery() {
        let s = setup(true).await;
        let c1 = content(&s.stores, "in_progress", None).await;

        s.coordinator.link(&s.assignment.id, &c1.id, false).await.unwrap();
        let deliveries = s.coordinator.deliveries(&s.assignment.id).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].item_state, "in_progress");

        let c2 = content(&s.stores, "in_progress", Some(&c1.id)).await;
        s.coordinator.link(&s.assignment.id, &c2.id, false).await.unwrap();
        let deliveries = s.coordinator.deliveries(&s.assignment.id).await.unwrap();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[1].sequence_no, 1);

        s.coordinator.unlink(&s.assignment.id, &c1.id).await.unwrap();
        assert!(s.coordinator.deliveries(&s.assignment.id).await.unwrap().is_empty());
        assert_eq!(state_of(&s.stores, &s.assignment.id).await, AssignmentState::Assigned);
    }

    #[tokio::test]
    async fn linking_an_item_also_links_its_existing_rewrites() {
        let s = setup(true).await;
        let c1 = content(&s.stores, "in_progress", None).await;
        let c2 = content(&s.stores, "published", Some(&c1.id)).await;

        s.coordinator.link(&s.assignment.id, &c1.id, false).await.unwrap();

        let items: Vec<_> = s
            .coordinator
            .deliveries(&s.assignment.id)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.item_id)
            .collect();
        assert_eq!(items, vec![c1.id.clone(), c2.id.clone()]);
        assert_eq!(state_of(&s.stores, &s.assignment.id).await, AssignmentState::Completed);
    }

    #[tokio::test]
    async fn second_item_needs_reassign() {
        let s = setup(false).await;
        let first = content(&s.stores, "in_progress", None).await;
        let second = content(&s.stores, "in_progress", None).await;

        s.coordinator.link(&s.assignment.id, &first.id, false).await.unwrap();
        assert!(matches!(
            s.coordinator.link(&s.assignment.id, &second.id, false).await,
            Err(AppError::Validation(_))
        ));

        s.coordinator.link(&s.assignment.id, &second.id, true).await.unwrap();
        let items: Vec<_> = s
            .coordinator
            .deliveries(&s.assignment.id)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.item_id)
            .collect();
        assert_eq!(items, vec![second.id.clone()]);
        let released = s.stores.content.find_one(&first.id).await.unwrap().unwrap();
        assert!(released.assignment_id.is_none());
    }

    #[tokio::test]
    async fn missing_targets_are_validation_errors() {
        let s = setup(false).await;
        let item = content(&s.stores, "in_progress", None).await;

        assert!(matches!(
            s.coordinator.link("nope", &item.id, false).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            s.coordinator.link(&s.assignment.id, "nope", false).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            s.coordinator.unlink(&s.assignment.id, &item.id).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn accept_resolves_contact_and_is_idempotent() {
        let s = setup(false).await;
        s.stores
            .contacts
            .insert(&Contact {
                id: "contact-1".into(),
                first_name: "Grace".into(),
                last_name: "Hopper".into(),
                organisation: None,
                created_at: Utc::now().naive_utc(),
            })
            .await
            .unwrap();

        let accepted = s.coordinator.accept(&s.assignment.id, "contact-1").await.unwrap();
        assert!(accepted.accepted);
        let payload = s.sink.last("assignments:accepted").unwrap().payload;
        assert_eq!(payload["accepted_by"], "Grace Hopper");

        s.coordinator.accept(&s.assignment.id, "contact-1").await.unwrap();
        let history = s
            .stores
            .history
            .find_for_item("assignments", &s.assignment.id)
            .await
            .unwrap();
        assert_eq!(history.iter().filter(|h| h.operation == "accepted").count(), 1);
    }

    #[tokio::test]
    async fn delete_is_refused_while_another_session_holds_the_lock() {
        let s = setup(false).await;
        let locks = LockManager::new(&s.stores, &Config::default().sweep);
        locks
            .acquire(LockResource::Assignments, &s.assignment.id, "u1", "s1", "edit")
            .await
            .unwrap();

        assert!(matches!(
            s.coordinator.delete_action(&s.assignment.id, "s2").await,
            Err(AppError::BadRequest(_))
        ));

        s.coordinator.delete_action(&s.assignment.id, "s1").await.unwrap();
        assert!(s.stores.assignments.find_one(&s.assignment.id).await.unwrap().is_none());
        let p1 = s.stores.planning.find_one("p1").await.unwrap().unwrap();
        assert!(p1.coverage("c1").unwrap().assigned_to.assignment_id.is_none());
    }

    #[tokio::test]
    async fn complete_requires_lock_and_open_state() {
        let s = setup(false).await;
        let locks = LockManager::new(&s.stores, &Config::default().sweep);

        assert!(matches!(
            s.coordinator.complete(&s.assignment.id, "s1").await,
            Err(AppError::NotLockOwner(_))
        ));

        locks
            .acquire(LockResource::Assignments, &s.assignment.id, "u1", "s1", "complete")
            .await
            .unwrap();
        let done = s.coordinator.complete(&s.assignment.id, "s1").await.unwrap();
        assert_eq!(done.assigned_to.state, AssignmentState::Completed);
        assert!(matches!(
            s.coordinator.complete(&s.assignment.id, "s1").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn marked_assignments_are_deleted() {
        let s = setup(false).await;
        mark_for_delete(&s.stores, &s.assignment.id).await;

        assert_eq!(s.coordinator.delete_marked().await.unwrap(), Some(1));
        assert!(s.stores.assignments.find_one(&s.assignment.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_marked_assignment_does_not_stop_the_rest() {
        let s = setup(false).await;
        s.stores
            .planning
            .insert(&planning("p2", vec![Coverage::new("c1", "photo", "vote")]))
            .await
            .unwrap();
        let second = s
            .coordinator
            .create_for_coverage("p2", "c1", Some("photographer"), None, "editor")
            .await
            .unwrap();
        mark_for_delete(&s.stores, &s.assignment.id).await;
        mark_for_delete(&s.stores, &second.id).await;

        // the first one in scan order is the one that keeps failing
        let first = s.stores.assignments.find_marked_for_delete(0, 1).await.unwrap();
        let stuck = first[0].id.clone();
        let healthy = if stuck == second.id { s.assignment.id.clone() } else { second.id.clone() };

        let failing = Stores {
            assignments: Arc::new(UndeletableAssignment {
                inner: s.stores.assignments.clone(),
                id: stuck.clone(),
            }),
            ..s.stores.clone()
        };
        let sweep = SweepConfig {
            page_size: 1,
            ..Config::default().sweep
        };
        let coordinator = coordinator(&failing, s.sink.clone(), false, &sweep);

        assert_eq!(coordinator.delete_marked().await.unwrap(), Some(1));
        assert!(s.stores.assignments.find_one(&healthy).await.unwrap().is_none());
        assert!(s.stores.assignments.find_one(&stuck).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn contended_delete_marked_does_nothing() {
        let s = setup(false).await;
        mark_for_delete(&s.stores, &s.assignment.id).await;

        let other = SqliteMutexLease::new(s.pool.clone());
        assert!(other
            .acquire(DELETE_ASSIGNMENTS_MUTEX, Duration::minutes(10))
            .await
            .unwrap());
        assert_eq!(s.coordinator.delete_marked().await.unwrap(), None);
        assert!(s.stores.assignments.find_one(&s.assignment.id).await.unwrap().is_some());

        other.release(DELETE_ASSIGNMENTS_MUTEX).await.unwrap();
        assert_eq!(s.coordinator.delete_marked().await.unwrap(), Some(1));
    }
}
