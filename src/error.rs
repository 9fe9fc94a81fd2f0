//! Error types for story-memory

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for story-memory operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for collaborator (vector store, embedder) calls
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in story-memory
#[derive(Error, Debug)]
pub enum Error {
    /// Input failed a required-content contract. Fix the input, don't retry.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A collaborator call failed or timed out.
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn vector_db(msg: impl Into<String>) -> Self {
        Self::Storage(StorageError::vector_db(msg))
    }

    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Storage(StorageError::embedding(msg))
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Rejected input. Every variant names the requirement that was not met.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no file:line reference found in {len} chars of narrative (expected e.g. src/lib.rs:10-42)")]
    MissingTraceability { len: usize },

    #[error("required field `{field}` is missing or empty")]
    MissingField { field: &'static str },

    #[error("invalid importance `{0}`, expected one of: low, medium, high, critical")]
    InvalidImportance(String),

    #[error("`{field}` is {len} chars, the maximum is {max}")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

/// Collaborator failures: the system is degraded, the input was fine.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Vector database error: {0}")]
    VectorDb(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("{operation} timed out after {limit:?}")]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },

    #[error("collection `{0}` does not exist in the vector store")]
    MissingCollection(String),

    #[error("vector store is unhealthy: {0}")]
    Unhealthy(String),

    /// Shards listed in `written` stay in the store; nothing is rolled back.
    #[error("wrote {} of {total} shards before failing: {source}", .written.len())]
    PartialWrite {
        written: Vec<Uuid>,
        total: usize,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    pub fn vector_db(msg: impl Into<String>) -> Self {
        Self::VectorDb(msg.into())
    }

    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    /// Shard ids that were durably written before the failure.
    pub fn written(&self) -> &[Uuid] {
        match self {
            Self::PartialWrite { written, .. } => written,
            _ => &[],
        }
    }
}
