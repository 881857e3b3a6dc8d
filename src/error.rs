use serde::Serialize;

use crate::db::models::Lock;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{resource} item {item_id} is locked by user {} (session {})", holder.user, holder.session)]
    ItemLocked {
        resource: String,
        item_id: String,
        holder: Box<Lock>,
    },

    #[error("Not the lock owner: {0}")]
    NotLockOwner(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error shape handed to callers that render errors (CLI output, notification payloads).
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AppError {
    /// HTTP-equivalent status for the error class.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::NotFound(_) => 404,
            AppError::BadRequest(_) => 400,
            AppError::Conflict(_) => 409,
            AppError::Validation(_) => 400,
            AppError::ItemLocked { .. } => 423,
            AppError::NotLockOwner(_) => 403,
            AppError::Configuration(_)
            | AppError::Internal(_)
            | AppError::Database(_)
            | AppError::Serialization(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Configuration(_) => "CONFIG_ERROR",
            AppError::ItemLocked { .. } => "ITEM_LOCKED",
            AppError::NotLockOwner(_) => "NOT_LOCK_OWNER",
            AppError::Internal(_) => "INTERNAL_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Render the error for an outer surface. Internal details are logged, not exposed.
    pub fn to_body(&self) -> ErrorBody {
        let (message, details) = match self {
            AppError::NotFound(msg)
            | AppError::BadRequest(msg)
            | AppError::Conflict(msg)
            | AppError::Validation(msg)
            | AppError::NotLockOwner(msg) => (msg.clone(), None),
            AppError::ItemLocked { holder, .. } => (
                self.to_string(),
                Some(serde_json::json!({
                    "lock_user": holder.user,
                    "lock_session": holder.session,
                    "lock_action": holder.action,
                    "lock_time": holder.time,
                })),
            ),
            AppError::Configuration(msg) => {
                tracing::error!("Configuration error: {}", msg);
                ("Server configuration error".to_string(), None)
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                ("A database error occurred".to_string(), None)
            }
            AppError::Serialization(e) => {
                tracing::error!("Serialization error: {:?}", e);
                ("A serialization error occurred".to_string(), None)
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                ("An internal error occurred".to_string(), None)
            }
        };

        ErrorBody {
            code: self.code().to_string(),
            message,
            details,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
