use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::store::MutexLease;
use crate::error::{AppError, AppResult};

/// Expiring mutex backed by the `mutexes` table.
///
/// A lease is taken by inserting the key, or by overwriting a row whose
/// `expires_at` has passed. Each instance carries its own owner token, so two
/// processes (or two `SqliteMutexLease` values) never share a lease.
#[derive(Clone)]
pub struct SqliteMutexLease {
    pool: SqlitePool,
    owner: String,
}

impl SqliteMutexLease {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            owner: Uuid::new_v4().to_string(),
        }
    }
}

#[async_trait]
impl MutexLease for SqliteMutexLease {
    async fn acquire(&self, key: &str, ttl: Duration) -> AppResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO mutexes (key, owner, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
            WHERE mutexes.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(&self.owner)
        .bind((now + ttl).naive_utc())
        .bind(now.naive_utc())
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, key: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM mutexes WHERE key = ? AND owner = ?")
            .bind(key)
            .bind(&self.owner)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }

    async fn extend(&self, key: &str, ttl: Duration) -> AppResult<bool> {
        let result = sqlx::query("UPDATE mutexes SET expires_at = ? WHERE key = ? AND owner = ?")
            .bind((Utc::now() + ttl).naive_utc())
            .bind(key)
            .bind(&self.owner)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
        Ok(result.rows_affected() > 0)
    }
}
