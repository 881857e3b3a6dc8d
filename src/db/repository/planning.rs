use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{cas_failure, new_etag};
use crate::db::models::{Planning, PlanningRow};
use crate::db::store::PlanningStore;
use crate::error::{AppError, AppResult};

const PLANNING_COLUMNS: &str = r#"
    id, etag, slugline, planning_date, related_events, coverages, state,
    lock_user, lock_session, lock_action, lock_time,
    created_at, updated_at
"#;

/// Repository for the `planning` table. Coverages and related events are JSON columns.
#[derive(Clone)]
pub struct PlanningRepository {
    pool: SqlitePool,
}

impl PlanningRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlanningStore for PlanningRepository {
    async fn find_one(&self, id: &str) -> AppResult<Option<Planning>> {
        let sql = format!("SELECT {} FROM planning WHERE id = ?", PLANNING_COLUMNS);
        let row = sqlx::query_as::<_, PlanningRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::Database)?;

        row.map(Planning::try_from).transpose()
    }

    async fn insert(&self, planning: &Planning) -> AppResult<Planning> {
        let etag = new_etag();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO planning (
                id, etag, slugline, planning_date, related_events, coverages, state,
                lock_user, lock_session, lock_action, lock_time,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&planning.id)
        .bind(&etag)
        .bind(&planning.slugline)
        .bind(planning.planning_date.naive_utc())
        .bind(serde_json::to_string(&planning.related_events)?)
        .bind(serde_json::to_string(&planning.coverages)?)
        .bind(planning.state.as_str())
        .bind(planning.lock.as_ref().map(|l| l.user.clone()))
        .bind(planning.lock.as_ref().map(|l| l.session.clone()))
        .bind(planning.lock.as_ref().map(|l| l.action.clone()))
        .bind(planning.lock.as_ref().map(|l| l.time.naive_utc()))
        .bind(now.naive_utc())
        .bind(now.naive_utc())
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        let mut stored = planning.clone();
        stored.etag = etag;
        stored.created_at = now;
        stored.updated_at = now;
        Ok(stored)
    }

    async fn update(&self, planning: &Planning) -> AppResult<Planning> {
        let etag = new_etag();
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE planning
            SET etag = ?,
                slugline = ?,
                planning_date = ?,
                related_events = ?,
                coverages = ?,
                state = ?,
                updated_at = ?
            WHERE id = ? AND etag = ?
            "#,
        )
        .bind(&etag)
        .bind(&planning.slugline)
        .bind(planning.planning_date.naive_utc())
        .bind(serde_json::to_string(&planning.related_events)?)
        .bind(serde_json::to_string(&planning.coverages)?)
        .bind(planning.state.as_str())
        .bind(now.naive_utc())
        .bind(&planning.id)
        .bind(&planning.etag)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        if result.rows_affected() == 0 {
            return Err(cas_failure(&self.pool, "planning", &planning.id).await);
        }

        let mut stored = planning.clone();
        stored.etag = etag;
        stored.updated_at = now;
        Ok(stored)
    }

    async fn delete(&self, id: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM planning WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }

    async fn find_spiked_before(
        &self,
        cutoff: DateTime<Utc>,
        offset: i64,
        limit: i64,
    ) -> AppResult<Vec<Planning>> {
        let sql = format!(
            r#"
            SELECT {} FROM planning
            WHERE state = 'spiked' AND planning_date < ?
            ORDER BY planning_date ASC, id ASC
            LIMIT ? OFFSET ?
            "#,
            PLANNING_COLUMNS
        );
        let rows = sqlx::query_as::<_, PlanningRow>(&sql)
            .bind(cutoff.naive_utc())
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::Database)?;

        rows.into_iter().map(Planning::try_from).collect()
    }
}
