//! Storage error types

use std::fmt;

use thiserror::Error;

use crate::coordinator::InitializationState;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database initialization failed: {0}")]
    Initialization(InitFailure),

    #[error("Database engine is not connected")]
    NotConnected,

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),
}

impl StorageError {
    pub fn is_initialization(&self) -> bool {
        matches!(self, StorageError::Initialization(_))
    }
}

/// Outcome of a failed initialization attempt.
///
/// Cloned to every caller that was waiting on the same in-flight attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitFailure {
    /// The state the coordinator was in when the step failed.
    pub stage: InitializationState,
    pub message: String,
}

impl InitFailure {
    pub fn new(stage: InitializationState, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

impl fmt::Display for InitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (during {})", self.message, self.stage)
    }
}

impl From<InitFailure> for StorageError {
    fn from(failure: InitFailure) -> Self {
        StorageError::Initialization(failure)
    }
}
