use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// Delivery: produced content fulfilling an assignment
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub item_id: String,
    pub assignment_id: String,
    pub planning_id: String,
    pub coverage_id: String,
    pub item_state: String,
    /// Position of the item within its rewrite chain (0 for the first linked item).
    pub sequence_no: i64,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDelivery {
    pub item_id: String,
    pub assignment_id: String,
    pub planning_id: String,
    pub coverage_id: String,
    pub item_state: String,
    pub sequence_no: i64,
}
