//! `/start` handling: turn an issuance attempt into the reply text

use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::KeyIssuanceStore;

pub const ALREADY_ISSUED_REPLY: &str = "You have already received a unique key.";
pub const FAILURE_REPLY: &str = "Something went wrong. Please try again later.";

/// Result of a start request for one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A key was generated and recorded for the first time
    Issued(String),
    /// The user already holds a key
    AlreadyIssued,
}

impl StartOutcome {
    pub fn reply_text(&self) -> String {
        match self {
            StartOutcome::Issued(key) => format!("Your unique key: {}", key),
            StartOutcome::AlreadyIssued => ALREADY_ISSUED_REPLY.to_string(),
        }
    }
}

/// Issues keys through the store on behalf of the messaging layer
#[derive(Clone)]
pub struct KeyIssuer {
    store: KeyIssuanceStore,
}

impl KeyIssuer {
    pub fn new(store: KeyIssuanceStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &KeyIssuanceStore {
        &self.store
    }

    /// Issue a key for `user_id` unless one exists.
    ///
    /// Storage failures are returned as-is; nothing is retried.
    pub async fn start(&self, user_id: i64) -> Result<StartOutcome, StoreError> {
        match self.store.issue_key(user_id).await {
            Ok(key) => {
                info!(user_id, "Issued unique key");
                Ok(StartOutcome::Issued(key))
            }
            Err(StoreError::DuplicateIssuance { .. }) => {
                debug!(user_id, "User already holds a key");
                Ok(StartOutcome::AlreadyIssued)
            }
            Err(e) => Err(e),
        }
    }

    /// Reply text for a `/start` from `user_id`
    pub async fn handle_start_command(&self, user_id: i64) -> Result<String, StoreError> {
        self.start(user_id).await.map(|outcome| outcome.reply_text())
    }
}
