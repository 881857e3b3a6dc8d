//! Collaborator interfaces the planning services are written against.
//!
//! One trait per collection. The SQLite repositories in `db::repository`
//! implement them; services receive `Arc<dyn …>` handles at construction.
//! Every `update` is a compare-and-swap on the document's `etag` and fails with
//! `AppError::Conflict` when the stored etag no longer matches.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::db::models::*;
use crate::error::AppResult;

#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    async fn find_one(&self, id: &str) -> AppResult<Option<Event>>;

    /// All instances of a series ordered by ascending start.
    async fn find_series(&self, recurrence_id: &str) -> AppResult<Vec<Event>>;

    async fn insert(&self, event: &Event) -> AppResult<Event>;

    /// Write every non-lock field of `event`, guarded by `event.etag`.
    async fn update(&self, event: &Event) -> AppResult<Event>;

    async fn delete(&self, id: &str) -> AppResult<()>;

    async fn delete_series(&self, recurrence_id: &str) -> AppResult<u64>;

    /// Spiked events that ended before `cutoff`, ordered by end date.
    async fn find_spiked_ended_before(
        &self,
        cutoff: DateTime<Utc>,
        offset: i64,
        limit: i64,
    ) -> AppResult<Vec<Event>>;
}

#[async_trait]
pub trait PlanningStore: Send + Sync + 'static {
    async fn find_one(&self, id: &str) -> AppResult<Option<Planning>>;

    async fn insert(&self, planning: &Planning) -> AppResult<Planning>;

    async fn update(&self, planning: &Planning) -> AppResult<Planning>;

    async fn delete(&self, id: &str) -> AppResult<()>;

    /// Spiked planning items whose planning date is before `cutoff`.
    async fn find_spiked_before(
        &self,
        cutoff: DateTime<Utc>,
        offset: i64,
        limit: i64,
    ) -> AppResult<Vec<Planning>>;
}

#[async_trait]
pub trait AssignmentStore: Send + Sync + 'static {
    async fn find_one(&self, id: &str) -> AppResult<Option<Assignment>>;

    async fn find_by_planning(&self, planning_id: &str) -> AppResult<Vec<Assignment>>;

    /// Fails with a validation error when the (planning, coverage) pair already has one.
    async fn insert(&self, assignment: &Assignment) -> AppResult<Assignment>;

    async fn update(&self, assignment: &Assignment) -> AppResult<Assignment>;

    async fn delete(&self, id: &str) -> AppResult<()>;

    /// Assignments flagged `to_delete`, oldest update first.
    async fn find_marked_for_delete(&self, offset: i64, limit: i64) -> AppResult<Vec<Assignment>>;
}

#[async_trait]
pub trait DeliveryStore: Send + Sync + 'static {
    /// Deliveries of an assignment ordered by `sequence_no`.
    async fn find_by_assignment(&self, assignment_id: &str) -> AppResult<Vec<Delivery>>;

    async fn insert(&self, create: CreateDelivery) -> AppResult<Delivery>;

    async fn delete(&self, id: &str) -> AppResult<()>;
}

#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    async fn find_one(&self, id: &str) -> AppResult<Option<ContentItem>>;

    /// Insert an item; a rewrite also stamps `rewritten_by` on its predecessor.
    async fn insert(&self, create: CreateContentItem) -> AppResult<ContentItem>;

    /// Write `state`, `assignment_id` and `rewritten_by`, guarded by `item.etag`.
    async fn update(&self, item: &ContentItem) -> AppResult<ContentItem>;
}

#[async_trait]
pub trait ContactStore: Send + Sync + 'static {
    async fn find_one(&self, id: &str) -> AppResult<Option<Contact>>;

    async fn insert(&self, contact: &Contact) -> AppResult<()>;
}

#[async_trait]
pub trait AutosaveStore: Send + Sync + 'static {
    async fn save(&self, resource: LockResource, item_id: &str, data: &serde_json::Value)
        -> AppResult<()>;

    async fn find(&self, resource: LockResource, item_id: &str) -> AppResult<Option<Autosave>>;

    /// Returns whether an autosave existed.
    async fn delete(&self, resource: LockResource, item_id: &str) -> AppResult<bool>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync + 'static {
    async fn record(&self, entry: CreateHistoryEntry) -> AppResult<()>;

    async fn find_for_item(&self, resource: &str, item_id: &str) -> AppResult<Vec<HistoryEntry>>;
}

/// Access to the four lock columns of the lockable collections.
#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    async fn snapshot(&self, resource: LockResource, id: &str) -> AppResult<Option<LockSnapshot>>;

    /// Set (or clear, with `None`) the lock if the document still carries `expected_etag`.
    async fn compare_and_set(
        &self,
        resource: LockResource,
        id: &str,
        expected_etag: &str,
        lock: Option<&Lock>,
    ) -> AppResult<bool>;

    async fn find_locked_before(
        &self,
        resource: LockResource,
        cutoff: DateTime<Utc>,
        offset: i64,
        limit: i64,
    ) -> AppResult<Vec<LockSnapshot>>;

    /// Clear the lock only if it is still exactly `lock` (same session and lock time).
    async fn clear_if_unchanged(
        &self,
        resource: LockResource,
        id: &str,
        lock: &Lock,
    ) -> AppResult<bool>;

    /// Lock snapshots of every instance of an event series.
    async fn find_series_locks(&self, recurrence_id: &str) -> AppResult<Vec<LockSnapshot>>;
}

/// Expiring advisory lock guarding the periodic sweeps.
#[async_trait]
pub trait MutexLease: Send + Sync + 'static {
    async fn acquire(&self, key: &str, ttl: Duration) -> AppResult<bool>;

    async fn release(&self, key: &str) -> AppResult<()>;

    /// Extend a lease still held by this owner.
    async fn extend(&self, key: &str, ttl: Duration) -> AppResult<bool>;
}
