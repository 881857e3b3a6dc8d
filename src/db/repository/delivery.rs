use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateDelivery, Delivery};
use crate::db::store::DeliveryStore;
use crate::error::{AppError, AppResult};

/// Repository for the `deliveries` table.
#[derive(Clone)]
pub struct DeliveryRepository {
    pool: SqlitePool,
}

impl DeliveryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryStore for DeliveryRepository {
    async fn find_by_assignment(&self, assignment_id: &str) -> AppResult<Vec<Delivery>> {
        let rows = sqlx::query_as::<_, Delivery>(
            r#"
            SELECT id, item_id, assignment_id, planning_id, coverage_id,
                   item_state, sequence_no, created_at
            FROM deliveries
            WHERE assignment_id = ?
            ORDER BY sequence_no ASC, created_at ASC
            "#,
        )
        .bind(assignment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    async fn insert(&self, create: CreateDelivery) -> AppResult<Delivery> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, Delivery>(
            r#"
            INSERT INTO deliveries (
                id, item_id, assignment_id, planning_id, coverage_id,
                item_state, sequence_no, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING
                id, item_id, assignment_id, planning_id, coverage_id,
                item_state, sequence_no, created_at
            "#,
        )
        .bind(id)
        .bind(&create.item_id)
        .bind(&create.assignment_id)
        .bind(create.planning_id)
        .bind(create.coverage_id)
        .bind(create.item_state)
        .bind(create.sequence_no)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.message().contains("UNIQUE constraint failed") => {
                AppError::Validation(format!(
                    "Content item {} is already delivered for assignment {}",
                    create.item_id, create.assignment_id
                ))
            }
            other => AppError::Database(other),
        })?;

        Ok(row)
    }

    async fn delete(&self, id: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM deliveries WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }
}
