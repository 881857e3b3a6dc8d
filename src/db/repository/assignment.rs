use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use super::{cas_failure, new_etag};
use crate::db::models::{Assignment, AssignmentRow};
use crate::db::store::AssignmentStore;
use crate::error::{AppError, AppResult};

const ASSIGNMENT_COLUMNS: &str = r#"
    id, etag, planning_item, coverage_item, state,
    assigned_user, assigned_desk, assignor_user, contact,
    accepted, to_delete,
    lock_user, lock_session, lock_action, lock_time,
    created_at, updated_at
"#;

/// Repository for the `assignments` table.
///
/// The `(planning_item, coverage_item)` unique index backs the one-assignment-per-coverage rule.
#[derive(Clone)]
pub struct AssignmentRepository {
    pool: SqlitePool,
}

impl AssignmentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_many(&self, sql: &str, binds: &[&str]) -> AppResult<Vec<Assignment>> {
        let mut query = sqlx::query_as::<_, AssignmentRow>(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::Database)?;

        rows.into_iter().map(Assignment::try_from).collect()
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.message().contains("UNIQUE constraint failed"),
        _ => false,
    }
}

#[async_trait]
impl AssignmentStore for AssignmentRepository {
    async fn find_one(&self, id: &str) -> AppResult<Option<Assignment>> {
        let sql = format!("SELECT {} FROM assignments WHERE id = ?", ASSIGNMENT_COLUMNS);
        Ok(self.fetch_many(&sql, &[id]).await?.into_iter().next())
    }

    async fn find_by_planning(&self, planning_id: &str) -> AppResult<Vec<Assignment>> {
        let sql = format!(
            "SELECT {} FROM assignments WHERE planning_item = ? ORDER BY created_at ASC",
            ASSIGNMENT_COLUMNS
        );
        self.fetch_many(&sql, &[planning_id]).await
    }

    async fn insert(&self, assignment: &Assignment) -> AppResult<Assignment> {
        let etag = new_etag();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO assignments (
                id, etag, planning_item, coverage_item, state,
                assigned_user, assigned_desk, assignor_user, contact,
                accepted, to_delete,
                lock_user, lock_session, lock_action, lock_time,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&assignment.id)
        .bind(&etag)
        .bind(&assignment.planning_item)
        .bind(&assignment.coverage_item)
        .bind(assignment.assigned_to.state.as_str())
        .bind(&assignment.assigned_to.user)
        .bind(&assignment.assigned_to.desk)
        .bind(&assignment.assigned_to.assignor_user)
        .bind(&assignment.assigned_to.contact)
        .bind(assignment.accepted)
        .bind(assignment.to_delete)
        .bind(assignment.lock.as_ref().map(|l| l.user.clone()))
        .bind(assignment.lock.as_ref().map(|l| l.session.clone()))
        .bind(assignment.lock.as_ref().map(|l| l.action.clone()))
        .bind(assignment.lock.as_ref().map(|l| l.time.naive_utc()))
        .bind(now.naive_utc())
        .bind(now.naive_utc())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Validation(format!(
                    "Coverage {} of planning item {} already has an assignment",
                    assignment.coverage_item, assignment.planning_item
                ))
            } else {
                AppError::Database(e)
            }
        })?;

        let mut stored = assignment.clone();
        stored.etag = etag;
        stored.created_at = now;
        stored.updated_at = now;
        Ok(stored)
    }

    async fn update(&self, assignment: &Assignment) -> AppResult<Assignment> {
        let etag = new_etag();
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE assignments
            SET etag = ?,
                state = ?,
                assigned_user = ?,
                assigned_desk = ?,
                assignor_user = ?,
                contact = ?,
                accepted = ?,
                to_delete = ?,
                updated_at = ?
            WHERE id = ? AND etag = ?
            "#,
        )
        .bind(&etag)
        .bind(assignment.assigned_to.state.as_str())
        .bind(&assignment.assigned_to.user)
        .bind(&assignment.assigned_to.desk)
        .bind(&assignment.assigned_to.assignor_user)
        .bind(&assignment.assigned_to.contact)
        .bind(assignment.accepted)
        .bind(assignment.to_delete)
        .bind(now.naive_utc())
        .bind(&assignment.id)
        .bind(&assignment.etag)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        if result.rows_affected() == 0 {
            return Err(cas_failure(&self.pool, "assignments", &assignment.id).await);
        }

        let mut stored = assignment.clone();
        stored.etag = etag;
        stored.updated_at = now;
        Ok(stored)
    }

    async fn delete(&self, id: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM assignments WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }

    async fn find_marked_for_delete(&self, offset: i64, limit: i64) -> AppResult<Vec<Assignment>> {
        let sql = format!(
            "SELECT {} FROM assignments WHERE to_delete = 1 ORDER BY updated_at ASC, id ASC LIMIT ? OFFSET ?",
            ASSIGNMENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, AssignmentRow>(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::Database)?;

        rows.into_iter().map(Assignment::try_from).collect()
    }
}
