/// Error types for the chat sync core
use thiserror::Error;

/// Failure reported by a document store backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Record {id} not found in {collection}")]
    NotFound { collection: String, id: String },

    #[error("Backend error: {0}")]
    Backend(String),
}

/// A record that does not match its entity schema
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed record {record_id}: {reason}")]
pub struct ParseError {
    pub record_id: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Subscription {stream} failed: {source}")]
    Subscription {
        stream: String,
        #[source]
        source: StoreError,
    },

    #[error("Chat session is closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, SyncError>;
