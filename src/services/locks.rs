use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;

use crate::config::SweepConfig;
use crate::db::models::{CreateHistoryEntry, Lock, LockResource, LockSnapshot};
use crate::db::store::{AutosaveStore, EventStore, HistoryStore, LockStore, MutexLease};
use crate::error::{AppError, AppResult};
use crate::services::init::Stores;
use crate::services::sweep::{keep_lease, run_exclusive};

pub const PURGE_LOCKS_MUTEX: &str = "planning:purge_expired_locks";

/// Counts of one stale-lock purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub purged: usize,
    /// Locks refreshed or released while the purge ran.
    pub skipped: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for PurgeReport {
    fn add_assign(&mut self, other: Self) {
        self.purged += other.purged;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Resources named by a purge target: one collection or `all`.
pub fn purge_targets(name: &str) -> AppResult<Vec<LockResource>> {
    if name.eq_ignore_ascii_case("all") {
        return Ok(LockResource::ALL.to_vec());
    }
    LockResource::from_str(name)
        .map(|resource| vec![resource])
        .ok_or_else(|| AppError::Validation(format!("Unknown lock resource: {}", name)))
}

/// Pessimistic single-writer locks on events, planning items and assignments.
///
/// Every transition is a compare-and-swap on the document etag, so two
/// sessions racing for the same item cannot both win.
#[derive(Clone)]
pub struct LockManager {
    locks: Arc<dyn LockStore>,
    events: Arc<dyn EventStore>,
    autosaves: Arc<dyn AutosaveStore>,
    history: Arc<dyn HistoryStore>,
    mutex: Arc<dyn MutexLease>,
    page_size: i64,
    max_loops: usize,
    mutex_ttl: Duration,
}

impl LockManager {
    pub fn new(stores: &Stores, sweep: &SweepConfig) -> Self {
        Self {
            locks: stores.locks.clone(),
            events: stores.events.clone(),
            autosaves: stores.autosaves.clone(),
            history: stores.history.clone(),
            mutex: stores.mutex.clone(),
            page_size: sweep.page_size.max(1),
            max_loops: sweep.max_loops,
            mutex_ttl: Duration::seconds(sweep.mutex_ttl_seconds),
        }
    }

    async fn snapshot(&self, resource: LockResource, item_id: &str) -> AppResult<LockSnapshot> {
        self.locks
            .snapshot(resource, item_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{} item {} not found", resource, item_id)))
    }

    fn locked_error(resource: LockResource, item_id: &str, holder: Lock) -> AppError {
        AppError::ItemLocked {
            resource: resource.to_string(),
            item_id: item_id.to_string(),
            holder: Box::new(holder),
        }
    }

    /// Another session holding a lock on any instance of the event's series.
    async fn series_holder(&self, event_id: &str, user: &str, session: &str) -> AppResult<Option<Lock>> {
        let Some(event) = self.events.find_one(event_id).await? else {
            return Ok(None);
        };
        let Some(ref recurrence_id) = event.recurrence_id else {
            return Ok(None);
        };

        let siblings = self.locks.find_series_locks(recurrence_id).await?;
        Ok(siblings
            .into_iter()
            .filter(|s| s.item_id != event_id)
            .filter_map(|s| s.lock)
            .find(|lock| !lock.is_held_by(user, session)))
    }

    /// Lock `item_id` for (`user`, `session`). Re-acquiring an own lock
    /// refreshes its action and time.
    pub async fn acquire(
        &self,
        resource: LockResource,
        item_id: &str,
        user: &str,
        session: &str,
        action: &str,
    ) -> AppResult<Lock> {
        let snapshot = self.snapshot(resource, item_id).await?;
        if let Some(holder) = snapshot.lock {
            if !holder.is_held_by(user, session) {
                return Err(Self::locked_error(resource, item_id, holder));
            }
        }

        if resource == LockResource::Events {
            if let Some(holder) = self.series_holder(item_id, user, session).await? {
                return Err(Self::locked_error(resource, item_id, holder));
            }
        }

        let lock = Lock::new(user, session, action, Utc::now());
        let written = self
            .locks
            .compare_and_set(resource, item_id, &snapshot.etag, Some(&lock))
            .await?;

        if !written {
            let current = self.snapshot(resource, item_id).await?;
            return match current.lock {
                Some(holder) if holder.is_held_by(user, session) => Ok(holder),
                Some(holder) => Err(Self::locked_error(resource, item_id, holder)),
                None => Err(AppError::Conflict(format!(
                    "{} item {} changed while locking",
                    resource, item_id
                ))),
            };
        }

        self.history
            .record(
                CreateHistoryEntry::new(resource.as_str(), item_id, "lock")
                    .by(Some(user), Some(session))
                    .with_update(json!({ "lock_action": action })),
            )
            .await?;
        tracing::debug!("{} item {} locked by {} ({})", resource, item_id, user, action);

        Ok(lock)
    }

    /// Release a lock held by `session`.
    pub async fn release(&self, resource: LockResource, item_id: &str, session: &str) -> AppResult<()> {
        let snapshot = self.snapshot(resource, item_id).await?;
        let holder = match snapshot.lock {
            Some(holder) if holder.session == session => holder,
            Some(_) => {
                return Err(AppError::NotLockOwner(format!(
                    "{} item {} is locked by another session",
                    resource, item_id
                )))
            }
            None => {
                return Err(AppError::NotLockOwner(format!(
                    "{} item {} is not locked",
                    resource, item_id
                )))
            }
        };

        let written = self
            .locks
            .compare_and_set(resource, item_id, &snapshot.etag, None)
            .await?;
        if !written {
            return Err(AppError::Conflict(format!(
                "{} item {} changed while unlocking",
                resource, item_id
            )));
        }

        self.history
            .record(
                CreateHistoryEntry::new(resource.as_str(), item_id, "unlock")
                    .by(Some(&holder.user), Some(session)),
            )
            .await?;
        tracing::debug!("{} item {} unlocked by {}", resource, item_id, holder.user);

        Ok(())
    }

    /// The lock on `item_id`, provided `session` holds it.
    pub async fn validate(&self, resource: LockResource, item_id: &str, session: &str) -> AppResult<Lock> {
        match self.snapshot(resource, item_id).await?.lock {
            Some(lock) if lock.session == session => Ok(lock),
            Some(_) => Err(AppError::NotLockOwner(format!(
                "{} item {} is locked by another session",
                resource, item_id
            ))),
            None => Err(AppError::NotLockOwner(format!(
                "{} item {} must be locked before editing",
                resource, item_id
            ))),
        }
    }

    /// Clear locks older than `older_than` on every resource in `resources`.
    /// `None` when another process is already purging.
    pub async fn purge_expired(
        &self,
        resources: &[LockResource],
        older_than: Duration,
    ) -> AppResult<Option<PurgeReport>> {
        run_exclusive(
            self.mutex.as_ref(),
            PURGE_LOCKS_MUTEX,
            self.mutex_ttl,
            self.purge_all(resources, older_than),
        )
        .await
    }

    async fn purge_all(&self, resources: &[LockResource], older_than: Duration) -> AppResult<PurgeReport> {
        let mut report = PurgeReport::default();
        for resource in resources {
            let partial = self.purge_resource(*resource, older_than).await?;
            tracing::info!(
                "Purged {} stale {} locks ({} skipped, {} failed)",
                partial.purged,
                resource,
                partial.skipped,
                partial.failed
            );
            report += partial;
        }
        Ok(report)
    }

    async fn purge_resource(&self, resource: LockResource, older_than: Duration) -> AppResult<PurgeReport> {
        let cutoff = Utc::now() - older_than;
        let mut report = PurgeReport::default();
        // cleared rows drop out of the query, so only items left behind advance the offset
        let mut offset = 0i64;

        for iteration in 0.. {
            if iteration >= self.max_loops {
                tracing::warn!(
                    "Stale {} lock purge stopped after {} pages",
                    resource,
                    self.max_loops
                );
                break;
            }

            let page = self
                .locks
                .find_locked_before(resource, cutoff, offset, self.page_size)
                .await?;
            let page_len = page.len() as i64;

            for snapshot in page {
                let Some(lock) = snapshot.lock else {
                    offset += 1;
                    continue;
                };
                match self.purge_one(resource, &snapshot.item_id, &lock).await {
                    Ok(true) => report.purged += 1,
                    Ok(false) => report.skipped += 1,
                    Err(e) => {
                        tracing::warn!(
                            "Failed to purge lock on {} item {}: {:?}",
                            resource,
                            snapshot.item_id,
                            e
                        );
                        report.failed += 1;
                        offset += 1;
                    }
                }
            }

            keep_lease(self.mutex.as_ref(), PURGE_LOCKS_MUTEX, self.mutex_ttl).await;
            if page_len < self.page_size {
                break;
            }
        }

        Ok(report)
    }

    async fn purge_one(&self, resource: LockResource, item_id: &str, lock: &Lock) -> AppResult<bool> {
        if !self.locks.clear_if_unchanged(resource, item_id, lock).await? {
            return Ok(false);
        }

        if self.autosaves.delete(resource, item_id).await? {
            tracing::debug!("Deleted autosave of {} item {}", resource, item_id);
        }
        self.history
            .record(
                CreateHistoryEntry::new(resource.as_str(), item_id, "unlock")
                    .by(Some(&lock.user), Some(&lock.session))
                    .with_update(json!({ "expired": true })),
            )
            .await?;

        Ok(true)
    }
}
