use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{cas_failure, new_etag};
use crate::db::models::{Contact, ContentItem, CreateContentItem};
use crate::db::store::{ContactStore, ContentStore};
use crate::error::{AppError, AppResult};

const CONTENT_COLUMNS: &str = r#"
    id, etag, slugline, item_type, state, assignment_id,
    rewrite_of, rewritten_by, created_at, updated_at
"#;

/// Repository for `content_items`, the local view of the content repository.
#[derive(Clone)]
pub struct ContentRepository {
    pool: SqlitePool,
}

impl ContentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContentStore for ContentRepository {
    async fn find_one(&self, id: &str) -> AppResult<Option<ContentItem>> {
        let sql = format!("SELECT {} FROM content_items WHERE id = ?", CONTENT_COLUMNS);
        let row = sqlx::query_as::<_, ContentItem>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row)
    }

    async fn insert(&self, create: CreateContentItem) -> AppResult<ContentItem> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let sql = format!(
            r#"
            INSERT INTO content_items (
                id, etag, slugline, item_type, state, assignment_id,
                rewrite_of, rewritten_by, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, NULL, ?, NULL, ?, ?)
            RETURNING {}
            "#,
            CONTENT_COLUMNS
        );
        let item = sqlx::query_as::<_, ContentItem>(&sql)
            .bind(&id)
            .bind(new_etag())
            .bind(create.slugline)
            .bind(create.item_type)
            .bind(create.state)
            .bind(&create.rewrite_of)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::Database)?;

        if let Some(ref predecessor) = create.rewrite_of {
            sqlx::query(
                "UPDATE content_items SET rewritten_by = ?, etag = ?, updated_at = ? WHERE id = ?",
            )
            .bind(&id)
            .bind(new_etag())
            .bind(now)
            .bind(predecessor)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
        }

        Ok(item)
    }

    async fn update(&self, item: &ContentItem) -> AppResult<ContentItem> {
        let etag = new_etag();
        let now = Utc::now().naive_utc();

        let result = sqlx::query(
            r#"
            UPDATE content_items
            SET etag = ?, state = ?, assignment_id = ?, rewritten_by = ?, updated_at = ?
            WHERE id = ? AND etag = ?
            "#,
        )
        .bind(&etag)
        .bind(&item.state)
        .bind(&item.assignment_id)
        .bind(&item.rewritten_by)
        .bind(now)
        .bind(&item.id)
        .bind(&item.etag)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        if result.rows_affected() == 0 {
            return Err(cas_failure(&self.pool, "content_items", &item.id).await);
        }

        let mut stored = item.clone();
        stored.etag = etag;
        stored.updated_at = now;
        Ok(stored)
    }
}

/// Repository for the `contacts` table.
#[derive(Clone)]
pub struct ContactRepository {
    pool: SqlitePool,
}

impl ContactRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContactStore for ContactRepository {
    async fn find_one(&self, id: &str) -> AppResult<Option<Contact>> {
        let row = sqlx::query_as::<_, Contact>(
            "SELECT id, first_name, last_name, organisation, created_at FROM contacts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(row)
    }

    async fn insert(&self, contact: &Contact) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO contacts (id, first_name, last_name, organisation, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&contact.id)
        .bind(&contact.first_name)
        .bind(&contact.last_name)
        .bind(&contact.organisation)
        .bind(contact.created_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(())
    }
}
