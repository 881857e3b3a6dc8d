use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateHistoryEntry, HistoryEntry};
use crate::db::store::HistoryStore;
use crate::error::{AppError, AppResult};

/// Repository for the append-only `history` table.
#[derive(Clone)]
pub struct HistoryRepository {
    pool: SqlitePool,
}

impl HistoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryStore for HistoryRepository {
    async fn record(&self, entry: CreateHistoryEntry) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO history (
                id, resource, item_id, operation, user_id, session_id, update_json, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(entry.resource)
        .bind(entry.item_id)
        .bind(entry.operation)
        .bind(entry.user_id)
        .bind(entry.session_id)
        .bind(entry.update.to_string())
        .bind(Utc::now().naive_utc())
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(())
    }

    async fn find_for_item(&self, resource: &str, item_id: &str) -> AppResult<Vec<HistoryEntry>> {
        let rows = sqlx::query_as::<_, HistoryEntry>(
            r#"
            SELECT id, resource, item_id, operation, user_id, session_id, update_json, created_at
            FROM history
            WHERE resource = ? AND item_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(resource)
        .bind(item_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows)
    }
}
