use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{cas_failure, new_etag};
use crate::db::models::{Event, EventRow};
use crate::db::store::EventStore;
use crate::error::{AppError, AppResult};

const EVENT_COLUMNS: &str = r#"
    id, etag, name, recurrence_id,
    dates_start, dates_end, dates_tz, all_day, no_end_time, recurring_rule,
    state, detached, related_plannings,
    lock_user, lock_session, lock_action, lock_time,
    created_at, updated_at
"#;

/// Repository for the `events` table.
#[derive(Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn rows_to_events(rows: Vec<EventRow>) -> AppResult<Vec<Event>> {
        rows.into_iter().map(Event::try_from).collect()
    }
}

fn rule_json(event: &Event) -> AppResult<Option<String>> {
    match event.dates.recurring_rule {
        Some(ref rule) => Ok(Some(serde_json::to_string(rule)?)),
        None => Ok(None),
    }
}

#[async_trait]
impl EventStore for EventRepository {
    async fn find_one(&self, id: &str) -> AppResult<Option<Event>> {
        let sql = format!("SELECT {} FROM events WHERE id = ?", EVENT_COLUMNS);
        let row = sqlx::query_as::<_, EventRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::Database)?;

        row.map(Event::try_from).transpose()
    }

    async fn find_series(&self, recurrence_id: &str) -> AppResult<Vec<Event>> {
        let sql = format!(
            "SELECT {} FROM events WHERE recurrence_id = ? ORDER BY dates_start ASC, id ASC",
            EVENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, EventRow>(&sql)
            .bind(recurrence_id)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::Database)?;

        Self::rows_to_events(rows)
    }

    async fn insert(&self, event: &Event) -> AppResult<Event> {
        let etag = new_etag();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO events (
                id, etag, name, recurrence_id,
                dates_start, dates_end, dates_tz, all_day, no_end_time, recurring_rule,
                state, detached, related_plannings,
                lock_user, lock_session, lock_action, lock_time,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&etag)
        .bind(&event.name)
        .bind(&event.recurrence_id)
        .bind(event.dates.start.naive_utc())
        .bind(event.dates.end.naive_utc())
        .bind(event.dates.tz.name())
        .bind(event.dates.all_day)
        .bind(event.dates.no_end_time)
        .bind(rule_json(event)?)
        .bind(event.state.as_str())
        .bind(event.detached)
        .bind(serde_json::to_string(&event.related_plannings)?)
        .bind(event.lock.as_ref().map(|l| l.user.clone()))
        .bind(event.lock.as_ref().map(|l| l.session.clone()))
        .bind(event.lock.as_ref().map(|l| l.action.clone()))
        .bind(event.lock.as_ref().map(|l| l.time.naive_utc()))
        .bind(now.naive_utc())
        .bind(now.naive_utc())
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        let mut stored = event.clone();
        stored.etag = etag;
        stored.created_at = now;
        stored.updated_at = now;
        Ok(stored)
    }

    async fn update(&self, event: &Event) -> AppResult<Event> {
        let etag = new_etag();
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE events
            SET etag = ?,
                name = ?,
                recurrence_id = ?,
                dates_start = ?,
                dates_end = ?,
                dates_tz = ?,
                all_day = ?,
                no_end_time = ?,
                recurring_rule = ?,
                state = ?,
                detached = ?,
                related_plannings = ?,
                updated_at = ?
            WHERE id = ? AND etag = ?
            "#,
        )
        .bind(&etag)
        .bind(&event.name)
        .bind(&event.recurrence_id)
        .bind(event.dates.start.naive_utc())
        .bind(event.dates.end.naive_utc())
        .bind(event.dates.tz.name())
        .bind(event.dates.all_day)
        .bind(event.dates.no_end_time)
        .bind(rule_json(event)?)
        .bind(event.state.as_str())
        .bind(event.detached)
        .bind(serde_json::to_string(&event.related_plannings)?)
        .bind(now.naive_utc())
        .bind(&event.id)
        .bind(&event.etag)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        if result.rows_affected() == 0 {
            return Err(cas_failure(&self.pool, "events", &event.id).await);
        }

        let mut stored = event.clone();
        stored.etag = etag;
        stored.updated_at = now;
        Ok(stored)
    }

    async fn delete(&self, id: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM events WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }

    async fn delete_series(&self, recurrence_id: &str) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM events WHERE recurrence_id = ?")
            .bind(recurrence_id)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
        Ok(result.rows_affected())
    }

    async fn find_spiked_ended_before(
        &self,
        cutoff: DateTime<Utc>,
        offset: i64,
        limit: i64,
    ) -> AppResult<Vec<Event>> {
        let sql = format!(
            r#"
            SELECT {} FROM events
            WHERE state = 'spiked' AND dates_end < ?
            ORDER BY dates_end ASC, id ASC
            LIMIT ? OFFSET ?
            "#,
            EVENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, EventRow>(&sql)
            .bind(cutoff.naive_utc())
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::Database)?;

        Self::rows_to_events(rows)
    }
}
