use crate::core::types::{RecordId, UserId};
use crate::session::EditState;
use thiserror::Error;

/// Failures reported by a [`RecordStore`](crate::storage::RecordStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Row '{id}' not found in table '{table}'")]
    NotFound { table: String, id: String },

    #[error("Row '{id}' in table '{table}' was modified since it was read")]
    StaleWrite { table: String, id: String },

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown rpc '{0}'")]
    UnknownRpc(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Lock error: {0}")]
    LockPoisoned(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockPoisoned(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Domain-facing error taxonomy for edit sessions and the services around them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EditError {
    #[error("No record is loaded")]
    NotLoaded,

    #[error("Record '{0}' not found")]
    NotFound(RecordId),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Lock unavailable{}", holder.as_ref().map(|h| format!(" (held by '{h}')")).unwrap_or_default())]
    LockUnavailable { holder: Option<UserId> },

    #[error("Record '{record_id}' was changed by someone else; reload before saving")]
    Conflict { record_id: RecordId },

    #[error("Cannot {operation} while {state}")]
    InvalidTransition {
        operation: &'static str,
        state: EditState,
    },
}

pub type Result<T> = std::result::Result<T, EditError>;

impl From<StoreError> for EditError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::StaleWrite { id, .. } => Self::Conflict {
                record_id: RecordId::new(id),
            },
            StoreError::NotFound { id, .. } => Self::NotFound(RecordId::new(id)),
            other => Self::Persistence(other.to_string()),
        }
    }
}

impl EditError {
    /// Whether retrying the same operation from the same state can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}
