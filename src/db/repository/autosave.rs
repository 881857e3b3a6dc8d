use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::models::{Autosave, LockResource};
use crate::db::store::AutosaveStore;
use crate::error::{AppError, AppResult};

/// Repository for `autosaves`: one draft per (resource, item).
#[derive(Clone)]
pub struct AutosaveRepository {
    pool: SqlitePool,
}

impl AutosaveRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AutosaveStore for AutosaveRepository {
    async fn save(
        &self,
        resource: LockResource,
        item_id: &str,
        data: &serde_json::Value,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO autosaves (resource, item_id, data, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(resource, item_id) DO UPDATE SET
                data = excluded.data,
                created_at = excluded.created_at
            "#,
        )
        .bind(resource.as_str())
        .bind(item_id)
        .bind(data.to_string())
        .bind(Utc::now().naive_utc())
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(())
    }

    async fn find(&self, resource: LockResource, item_id: &str) -> AppResult<Option<Autosave>> {
        let row = sqlx::query_as::<_, Autosave>(
            r#"
            SELECT resource, item_id, data, created_at
            FROM autosaves
            WHERE resource = ? AND item_id = ?
            "#,
        )
        .bind(resource.as_str())
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(row)
    }

    async fn delete(&self, resource: LockResource, item_id: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM autosaves WHERE resource = ? AND item_id = ?")
            .bind(resource.as_str())
            .bind(item_id)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
        Ok(result.rows_affected() > 0)
    }
}
