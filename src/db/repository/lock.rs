use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use super::new_etag;
use crate::db::models::{Lock, LockResource, LockSnapshot};
use crate::db::store::LockStore;
use crate::error::{AppError, AppResult};

const LOCK_COLUMNS: &str = "id, etag, lock_user, lock_session, lock_action, lock_time";

#[derive(Debug, FromRow)]
struct LockRow {
    id: String,
    etag: String,
    lock_user: Option<String>,
    lock_session: Option<String>,
    lock_action: Option<String>,
    lock_time: Option<NaiveDateTime>,
}

impl From<LockRow> for LockSnapshot {
    fn from(row: LockRow) -> Self {
        LockSnapshot {
            item_id: row.id,
            etag: row.etag,
            lock: Lock::from_columns(
                row.lock_user,
                row.lock_session,
                row.lock_action,
                row.lock_time,
            ),
        }
    }
}

/// Lock columns of `events`, `planning` and `assignments`.
///
/// Every write replaces the document etag so a concurrent document update
/// based on the pre-lock state fails its compare-and-swap.
#[derive(Clone)]
pub struct LockRepository {
    pool: SqlitePool,
}

impl LockRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockStore for LockRepository {
    async fn snapshot(&self, resource: LockResource, id: &str) -> AppResult<Option<LockSnapshot>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?",
            LOCK_COLUMNS,
            resource.table()
        );
        let row = sqlx::query_as::<_, LockRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::Database)?;

        Ok(row.map(LockSnapshot::from))
    }

    async fn compare_and_set(
        &self,
        resource: LockResource,
        id: &str,
        expected_etag: &str,
        lock: Option<&Lock>,
    ) -> AppResult<bool> {
        let sql = format!(
            r#"
            UPDATE {}
            SET lock_user = ?, lock_session = ?, lock_action = ?, lock_time = ?,
                etag = ?, updated_at = ?
            WHERE id = ? AND etag = ?
            "#,
            resource.table()
        );
        let result = sqlx::query(&sql)
            .bind(lock.map(|l| l.user.clone()))
            .bind(lock.map(|l| l.session.clone()))
            .bind(lock.map(|l| l.action.clone()))
            .bind(lock.map(|l| l.time.naive_utc()))
            .bind(new_etag())
            .bind(Utc::now().naive_utc())
            .bind(id)
            .bind(expected_etag)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_locked_before(
        &self,
        resource: LockResource,
        cutoff: DateTime<Utc>,
        offset: i64,
        limit: i64,
    ) -> AppResult<Vec<LockSnapshot>> {
        let sql = format!(
            r#"
            SELECT {} FROM {}
            WHERE lock_time IS NOT NULL AND lock_time < ?
            ORDER BY lock_time ASC, id ASC
            LIMIT ? OFFSET ?
            "#,
            LOCK_COLUMNS,
            resource.table()
        );
        let rows = sqlx::query_as::<_, LockRow>(&sql)
            .bind(cutoff.naive_utc())
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::Database)?;

        Ok(rows.into_iter().map(LockSnapshot::from).collect())
    }

    async fn clear_if_unchanged(
        &self,
        resource: LockResource,
        id: &str,
        lock: &Lock,
    ) -> AppResult<bool> {
        let sql = format!(
            r#"
            UPDATE {}
            SET lock_user = NULL, lock_session = NULL, lock_action = NULL, lock_time = NULL,
                etag = ?, updated_at = ?
            WHERE id = ? AND lock_session = ? AND lock_time = ?
            "#,
            resource.table()
        );
        let result = sqlx::query(&sql)
            .bind(new_etag())
            .bind(Utc::now().naive_utc())
            .bind(id)
            .bind(&lock.session)
            .bind(lock.time.naive_utc())
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_series_locks(&self, recurrence_id: &str) -> AppResult<Vec<LockSnapshot>> {
        let sql = format!(
            "SELECT {} FROM events WHERE recurrence_id = ? ORDER BY dates_start ASC",
            LOCK_COLUMNS
        );
        let rows = sqlx::query_as::<_, LockRow>(&sql)
            .bind(recurrence_id)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::Database)?;

        Ok(rows.into_iter().map(LockSnapshot::from).collect())
    }
}
