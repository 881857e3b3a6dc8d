//! Periodic removal of spiked items that expired.
//!
//! Runs under the `planning:delete_spiked` mutex so at most one process sweeps
//! at a time. Deletions are single-document writes; a sweep interrupted halfway
//! leaves items that the next run picks up again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;

use crate::config::{PlanningConfig, SweepConfig};
use crate::db::models::{Event, Planning};
use crate::db::store::*;
use crate::error::AppResult;
use crate::services::assignments::AssignmentLinkCoordinator;
use crate::services::init::Stores;
use crate::services::notifications::NotificationSink;
use crate::services::series::is_series_expired_and_spiked;
use crate::services::sweep::{keep_lease, run_exclusive};

pub const DELETE_SPIKED_MUTEX: &str = "planning:delete_spiked";

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub events_deleted: usize,
    pub series_deleted: usize,
    pub series_skipped: usize,
    pub planning_deleted: usize,
    pub assignments_deleted: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SpikeExpiryCoordinator {
    events: Arc<dyn EventStore>,
    planning: Arc<dyn PlanningStore>,
    assignment_store: Arc<dyn AssignmentStore>,
    mutex: Arc<dyn MutexLease>,
    assignments: AssignmentLinkCoordinator,
    notifier: Arc<dyn NotificationSink>,
    delete_spiked_minutes: i64,
    page_size: i64,
    max_loops: usize,
    mutex_ttl: Duration,
}

impl SpikeExpiryCoordinator {
    pub fn new(
        stores: &Stores,
        assignments: AssignmentLinkCoordinator,
        notifier: Arc<dyn NotificationSink>,
        planning: &PlanningConfig,
        sweep: &SweepConfig,
    ) -> Self {
        Self {
            events: stores.events.clone(),
            planning: stores.planning.clone(),
            assignment_store: stores.assignments.clone(),
            mutex: stores.mutex.clone(),
            assignments,
            notifier,
            delete_spiked_minutes: planning.delete_spiked_minutes,
            page_size: sweep.page_size.max(1),
            max_loops: sweep.max_loops,
            mutex_ttl: Duration::seconds(sweep.mutex_ttl_seconds),
        }
    }

    /// Run one sweep. `None` when the sweep is disabled or another runner holds the mutex.
    pub async fn run(&self) -> AppResult<Option<SweepReport>> {
        if self.delete_spiked_minutes <= 0 {
            tracing::debug!("Spiked item expiry disabled");
            return Ok(None);
        }

        let now = Utc::now();
        let cutoff = now - Duration::minutes(self.delete_spiked_minutes);

        run_exclusive(
            self.mutex.as_ref(),
            DELETE_SPIKED_MUTEX,
            self.mutex_ttl,
            self.sweep(cutoff, now),
        )
        .await
    }

    async fn sweep(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> AppResult<SweepReport> {
        tracing::info!("Deleting spiked items expired before {}", cutoff);
        let mut report = SweepReport::default();
        self.expire_events(cutoff, now, &mut report).await?;
        self.expire_planning(cutoff, &mut report).await?;
        tracing::info!("Spiked item expiry finished: {:?}", report);
        Ok(report)
    }

    async fn keep_lease(&self) {
        keep_lease(self.mutex.as_ref(), DELETE_SPIKED_MUTEX, self.mutex_ttl).await;
    }

    async fn expire_events(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> AppResult<()> {
        let mut offset = 0;
        let mut seen_series: HashSet<String> = HashSet::new();

        for _ in 0..self.max_loops {
            let page = self
                .events
                .find_spiked_ended_before(cutoff, offset, self.page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            let last_page = (page.len() as i64) < self.page_size;

            let mut series: HashMap<String, usize> = HashMap::new();
            for event in &page {
                match event.recurrence_id {
                    Some(ref recurrence_id) => *series.entry(recurrence_id.clone()).or_default() += 1,
                    None => {
                        if !self.delete_event(event, report).await {
                            offset += 1;
                        }
                    }
                }
            }

            for (recurrence_id, in_page) in series {
                if !seen_series.insert(recurrence_id.clone()) {
                    // already skipped this run
                    offset += in_page as i64;
                    continue;
                }
                if !self.delete_series(&recurrence_id, cutoff, now, report).await {
                    offset += in_page as i64;
                }
            }

            self.keep_lease().await;
            if last_page {
                break;
            }
        }

        Ok(())
    }

    async fn delete_event(&self, event: &Event, report: &mut SweepReport) -> bool {
        match self.events.delete(&event.id).await {
            Ok(()) => {
                report.events_deleted += 1;
                tracing::info!("Deleted expired spiked event {}", event.id);
                self.notifier
                    .notify("events:expired", json!({ "item": event.id }));
                true
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!("Failed to delete spiked event {}: {:?}", event.id, e);
                false
            }
        }
    }

    /// Delete a series whose latest instance, and every other one, is spiked and expired.
    async fn delete_series(
        &self,
        recurrence_id: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> bool {
        let series = match self.events.find_series(recurrence_id).await {
            Ok(series) => series,
            Err(e) => {
                report.failed += 1;
                tracing::warn!("Failed to load series {}: {:?}", recurrence_id, e);
                return false;
            }
        };
        let Some(latest) = series.last() else {
            return true;
        };

        if !is_series_expired_and_spiked(&series, latest, cutoff, now) {
            report.series_skipped += 1;
            tracing::debug!("Series {} is not fully expired, skipping", recurrence_id);
            return false;
        }

        match self.events.delete_series(recurrence_id).await {
            Ok(deleted) => {
                report.series_deleted += 1;
                report.events_deleted += deleted as usize;
                tracing::info!(
                    "Deleted expired spiked series {} ({} instances)",
                    recurrence_id,
                    deleted
                );
                self.notifier.notify(
                    "events:expired",
                    json!({ "recurrence_id": recurrence_id, "instances": deleted }),
                );
                true
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!("Failed to delete series {}: {:?}", recurrence_id, e);
                false
            }
        }
    }

    async fn expire_planning(&self, cutoff: DateTime<Utc>, report: &mut SweepReport) -> AppResult<()> {
        let mut offset = 0;

        for _ in 0..self.max_loops {
            let page = self
                .planning
                .find_spiked_before(cutoff, offset, self.page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            let last_page = (page.len() as i64) < self.page_size;

            for planning in &page {
                if let Err(e) = self.delete_planning(planning, report).await {
                    report.failed += 1;
                    offset += 1;
                    tracing::warn!("Failed to delete spiked planning item {}: {:?}", planning.id, e);
                }
            }

            self.keep_lease().await;
            if last_page {
                break;
            }
        }

        Ok(())
    }

    /// Assignments go first so a failure never leaves them pointing at a deleted item.
    async fn delete_planning(&self, planning: &Planning, report: &mut SweepReport) -> AppResult<()> {
        let mut assignment_ids = planning.assignment_ids();
        for assignment in self.assignment_store.find_by_planning(&planning.id).await? {
            if !assignment_ids.contains(&assignment.id) {
                assignment_ids.push(assignment.id);
            }
        }

        for assignment_id in &assignment_ids {
            if self.assignments.delete_for_system(assignment_id).await? {
                report.assignments_deleted += 1;
            }
        }

        self.planning.delete(&planning.id).await?;
        report.planning_deleted += 1;
        tracing::info!(
            "Deleted expired spiked planning item {} with {} assignment(s)",
            planning.id,
            assignment_ids.len()
        );
        self.notifier
            .notify("planning:expired", json!({ "item": planning.id }));

        Ok(())
    }
}
