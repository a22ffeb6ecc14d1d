//! Error types for key issuance storage

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Backing store unreachable, query failed, or deadline exceeded
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Conditional insert found an existing record for this user
    #[error("Key already issued for user {user_id}")]
    DuplicateIssuance { user_id: i64 },
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        StoreError::StorageUnavailable(msg.into())
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::DuplicateIssuance { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::StorageUnavailable(e.to_string())
    }
}
