//! Builders shared by the service tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use sqlx::SqlitePool;

use crate::config::PlanningConfig;
use crate::db::models::*;
use crate::db::store::*;
use crate::error::{AppError, AppResult};
use crate::services::init::{build_stores, init_memory_db, Stores};
use crate::services::notifications::RecordingNotificationSink;

pub fn utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .unwrap()
        .with_timezone(&Utc)
}

pub fn event(id: &str, start: DateTime<Utc>) -> Event {
    let now = Utc::now();
    Event {
        id: id.to_string(),
        etag: String::new(),
        name: format!("Event {}", id),
        recurrence_id: None,
        dates: EventDates {
            start,
            end: start + Duration::hours(1),
            tz: Tz::UTC,
            all_day: false,
            no_end_time: false,
            recurring_rule: None,
        },
        state: WorkflowState::Scheduled,
        detached: false,
        related_plannings: Vec::new(),
        lock: None,
        created_at: now,
        updated_at: now,
    }
}

/// `count` one-hour instances one day apart, ids `{recurrence_id}-{n}`.
pub fn daily_series(recurrence_id: &str, first_start: DateTime<Utc>, count: usize) -> Vec<Event> {
    (0..count)
        .map(|n| {
            let mut instance = event(
                &format!("{}-{}", recurrence_id, n),
                first_start + Duration::days(n as i64),
            );
            instance.recurrence_id = Some(recurrence_id.to_string());
            instance.dates.recurring_rule = Some(RecurringRule::daily_count(count as i64));
            instance
        })
        .collect()
}

pub fn planning(id: &str, coverages: Vec<Coverage>) -> Planning {
    let now = Utc::now();
    Planning {
        id: id.to_string(),
        etag: String::new(),
        slugline: format!("slug-{}", id),
        planning_date: now,
        related_events: Vec::new(),
        coverages,
        state: WorkflowState::Draft,
        lock: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn planning_config(link_updates: bool) -> PlanningConfig {
    PlanningConfig {
        link_updates_to_coverages: link_updates,
        delete_spiked_minutes: 60,
        max_recurrent_events: 200,
        expire_lock_hours: 24,
    }
}

/// In-memory stores plus a sink recording every notification.
pub async fn test_stores() -> (Stores, Arc<RecordingNotificationSink>) {
    let pool = init_memory_db().await.unwrap();
    (build_stores(&pool), Arc::new(RecordingNotificationSink::default()))
}

/// Like [`test_stores`], also handing back the pool for a second mutex owner.
pub async fn test_pool_stores() -> (SqlitePool, Stores, Arc<RecordingNotificationSink>) {
    let pool = init_memory_db().await.unwrap();
    let stores = build_stores(&pool);
    (pool, stores, Arc::new(RecordingNotificationSink::default()))
}

fn unavailable(what: &str) -> AppError {
    AppError::Internal(anyhow::anyhow!("{} unavailable", what))
}

/// Event store whose spiked-event scan always fails.
pub struct BrokenSpikedScan {
    pub inner: Arc<dyn EventStore>,
}

#[async_trait]
impl EventStore for BrokenSpikedScan {
    async fn find_one(&self, id: &str) -> AppResult<Option<Event>> {
        self.inner.find_one(id).await
    }

    async fn find_series(&self, recurrence_id: &str) -> AppResult<Vec<Event>> {
        self.inner.find_series(recurrence_id).await
    }

    async fn insert(&self, event: &Event) -> AppResult<Event> {
        self.inner.insert(event).await
    }

    async fn update(&self, event: &Event) -> AppResult<Event> {
        self.inner.update(event).await
    }

    async fn delete(&self, id: &str) -> AppResult<()> {
        self.inner.delete(id).await
    }

    async fn delete_series(&self, recurrence_id: &str) -> AppResult<u64> {
        self.inner.delete_series(recurrence_id).await
    }

    async fn find_spiked_ended_before(
        &self,
        _cutoff: DateTime<Utc>,
        _offset: i64,
        _limit: i64,
    ) -> AppResult<Vec<Event>> {
        Err(unavailable("events"))
    }
}

/// Planning store that refuses to delete one item.
pub struct UndeletablePlanning {
    pub inner: Arc<dyn PlanningStore>,
    pub id: String,
}

#[async_trait]
impl PlanningStore for UndeletablePlanning {
    async fn find_one(&self, id: &str) -> AppResult<Option<Planning>> {
        self.inner.find_one(id).await
    }

    async fn insert(&self, planning: &Planning) -> AppResult<Planning> {
        self.inner.insert(planning).await
    }

    async fn update(&self, planning: &Planning) -> AppResult<Planning> {
        self.inner.update(planning).await
    }

    async fn delete(&self, id: &str) -> AppResult<()> {
        if id == self.id {
            return Err(unavailable("planning"));
        }
        self.inner.delete(id).await
    }

    async fn find_spiked_before(
        &self,
        cutoff: DateTime<Utc>,
        offset: i64,
        limit: i64,
    ) -> AppResult<Vec<Planning>> {
        self.inner.find_spiked_before(cutoff, offset, limit).await
    }
}

/// Assignment store that refuses to delete one assignment.
pub struct UndeletableAssignment {
    pub inner: Arc<dyn AssignmentStore>,
    pub id: String,
}

#[async_trait]
impl AssignmentStore for UndeletableAssignment {
    async fn find_one(&self, id: &str) -> AppResult<Option<Assignment>> {
        self.inner.find_one(id).await
    }

    async fn find_by_planning(&self, planning_id: &str) -> AppResult<Vec<Assignment>> {
        self.inner.find_by_planning(planning_id).await
    }

    async fn insert(&self, assignment: &Assignment) -> AppResult<Assignment> {
        self.inner.insert(assignment).await
    }

    async fn update(&self, assignment: &Assignment) -> AppResult<Assignment> {
        self.inner.update(assignment).await
    }

    async fn delete(&self, id: &str) -> AppResult<()> {
        if id == self.id {
            return Err(unavailable("assignments"));
        }
        self.inner.delete(id).await
    }

    async fn find_marked_for_delete(&self, offset: i64, limit: i64) -> AppResult<Vec<Assignment>> {
        self.inner.find_marked_for_delete(offset, limit).await
    }
}

/// Lock store where another session writes the item once, right before the
/// caller's first compare-and-set. `Some(lock)` locks it, `None` only bumps the etag.
pub struct RacingLocks {
    pub inner: Arc<dyn LockStore>,
    pub interloper: Mutex<Option<Option<Lock>>>,
}

impl RacingLocks {
    pub fn new(inner: Arc<dyn LockStore>, interloper: Option<Lock>) -> Self {
        Self {
            inner,
            interloper: Mutex::new(Some(interloper)),
        }
    }
}

#[async_trait]
impl LockStore for RacingLocks {
    async fn snapshot(&self, resource: LockResource, id: &str) -> AppResult<Option<LockSnapshot>> {
        self.inner.snapshot(resource, id).await
    }

    async fn compare_and_set(
        &self,
        resource: LockResource,
        id: &str,
        expected_etag: &str,
        lock: Option<&Lock>,
    ) -> AppResult<bool> {
        let interloper = self.interloper.lock().unwrap().take();
        if let Some(other) = interloper {
            let current = self.inner.snapshot(resource, id).await?.unwrap();
            assert!(self
                .inner
                .compare_and_set(resource, id, &current.etag, other.as_ref())
                .await?);
        }
        self.inner
            .compare_and_set(resource, id, expected_etag, lock)
            .await
    }

    async fn find_locked_before(
        &self,
        resource: LockResource,
        cutoff: DateTime<Utc>,
        offset: i64,
        limit: i64,
    ) -> AppResult<Vec<LockSnapshot>> {
        self.inner
            .find_locked_before(resource, cutoff, offset, limit)
            .await
    }

    async fn clear_if_unchanged(
        &self,
        resource: LockResource,
        id: &str,
        lock: &Lock,
    ) -> AppResult<bool> {
        self.inner.clear_if_unchanged(resource, id, lock).await
    }

    async fn find_series_locks(&self, recurrence_id: &str) -> AppResult<Vec<LockSnapshot>> {
        self.inner.find_series_locks(recurrence_id).await
    }
}

/// Lock store where every lock found by the first stale scan is refreshed by
/// its holder before the purge gets to clear it.
pub struct RefreshedAfterScan {
    pub inner: Arc<dyn LockStore>,
    pub refreshed: Mutex<bool>,
}

impl RefreshedAfterScan {
    pub fn new(inner: Arc<dyn LockStore>) -> Self {
        Self {
            inner,
            refreshed: Mutex::new(false),
        }
    }
}

#[async_trait]
impl LockStore for RefreshedAfterScan {
    async fn snapshot(&self, resource: LockResource, id: &str) -> AppResult<Option<LockSnapshot>> {
        self.inner.snapshot(resource, id).await
    }

    async fn compare_and_set(
        &self,
        resource: LockResource,
        id: &str,
        expected_etag: &str,
        lock: Option<&Lock>,
    ) -> AppResult<bool> {
        self.inner
            .compare_and_set(resource, id, expected_etag, lock)
            .await
    }

    async fn find_locked_before(
        &self,
        resource: LockResource,
        cutoff: DateTime<Utc>,
        offset: i64,
        limit: i64,
    ) -> AppResult<Vec<LockSnapshot>> {
        let page = self
            .inner
            .find_locked_before(resource, cutoff, offset, limit)
            .await?;
        let first_scan = !std::mem::replace(&mut *self.refreshed.lock().unwrap(), true);
        if first_scan {
            for snapshot in &page {
                let Some(ref held) = snapshot.lock else {
                    continue;
                };
                let fresh = Lock::new(&held.user, &held.session, &held.action, Utc::now());
                assert!(self
                    .inner
                    .compare_and_set(resource, &snapshot.item_id, &snapshot.etag, Some(&fresh))
                    .await?);
            }
        }
        Ok(page)
    }

    async fn clear_if_unchanged(
        &self,
        resource: LockResource,
        id: &str,
        lock: &Lock,
    ) -> AppResult<bool> {
        self.inner.clear_if_unchanged(resource, id, lock).await
    }

    async fn find_series_locks(&self, recurrence_id: &str) -> AppResult<Vec<LockSnapshot>> {
        self.inner.find_series_locks(recurrence_id).await
    }
}
