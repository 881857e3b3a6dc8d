pub mod assignment;
pub mod autosave;
pub mod content;
pub mod delivery;
pub mod event;
pub mod history;
pub mod lock;
pub mod mutex;
pub mod planning;

pub use assignment::AssignmentRepository;
pub use autosave::AutosaveRepository;
pub use content::{ContactRepository, ContentRepository};
pub use delivery::DeliveryRepository;
pub use event::EventRepository;
pub use history::HistoryRepository;
pub use lock::LockRepository;
pub use mutex::SqliteMutexLease;
pub use planning::PlanningRepository;

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::AppError;

/// Fresh concurrency token for a document write.
pub(crate) fn new_etag() -> String {
    Uuid::new_v4().to_string()
}

/// Explain a compare-and-swap that matched no row: the document is either gone
/// or was written by someone else since it was read.
pub(crate) async fn cas_failure(pool: &SqlitePool, table: &str, id: &str) -> AppError {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE id = ?", table);
    match sqlx::query_scalar::<_, i64>(&sql)
        .bind(id)
        .fetch_one(pool)
        .await
    {
        Ok(0) => AppError::NotFound(format!("{} item {} not found", table, id)),
        Ok(_) => AppError::Conflict(format!(
            "{} item {} was modified concurrently (etag mismatch)",
            table, id
        )),
        Err(e) => AppError::Database(e),
    }
}
