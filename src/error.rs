//! Error types for the sync engine

use thiserror::Error;

/// Result type alias using the engine's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by local store, queue and orchestrator operations
#[derive(Error, Debug)]
pub enum Error {
    /// Local SQLite failure
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client construction or transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Report or operation missing from the local store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Report is blocked on an unresolved version conflict
    #[error("Report {0} has an unresolved version conflict")]
    Conflicted(String),

    /// Cloud request failed in a way worth retrying later
    #[error("Cloud unavailable: {0}")]
    Transient(String),

    #[error("Local store lock poisoned")]
    LockPoisoned,

    /// Orchestrator is shutting down
    #[error("Sync engine is shutting down")]
    Shutdown,
}

/// Sync failures surfaced to the user (never absorbed silently)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncFailure {
    /// The cloud no longer has the report; local copy is kept until the user decides
    #[error("Report {report_id} no longer exists in the cloud")]
    RemoteNotFound { report_id: String },

    /// Retry ceiling reached; the operation is preserved for manual retry
    #[error("Operation {op_id} abandoned after {attempts} attempts: {last_error}")]
    Abandoned {
        op_id: String,
        attempts: u32,
        last_error: String,
    },
}
