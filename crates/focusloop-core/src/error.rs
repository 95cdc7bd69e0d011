//! Core error types for focusloop-core.
//!
//! This module defines the error hierarchy using thiserror. Validation and
//! state errors are returned synchronously to callers; capture and
//! persistence errors are reported through events and never stop the timer.

use std::path::PathBuf;
use thiserror::Error;

use crate::session::SessionState;

/// Core error type for focusloop-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Bad plan or settings
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Operation not valid in the current scheduler state
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Analytics store failures
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Screen capture or text extraction failures
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Analytics store errors.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Database is locked
    #[error("Database is locked")]
    Locked,

    /// A stored value could not be decoded
    #[error("Corrupt value in column '{column}': {message}")]
    Corrupt { column: String, message: String },

    /// The store mutex was poisoned by a panicking writer
    #[error("Store lock poisoned")]
    Poisoned,
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Unknown dot-path key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Could not determine or create the data directory
    #[error("Data directory unavailable: {0}")]
    DataDir(String),
}

/// Validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Empty collection
    #[error("Empty collection: {0}")]
    EmptyCollection(String),

    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    /// Unknown task id
    #[error("Unknown task: {0}")]
    UnknownTask(String),
}

impl ValidationError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        ValidationError::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Operation rejected because of the scheduler's current state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("'{operation}' is not allowed while {state:?}")]
    InvalidOperation {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTaskTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Task {0} is not pending or active")]
    TaskNotSwitchable(String),

    #[error("Session runner has stopped")]
    RunnerStopped,
}

/// Capture failures. Always transient from the session's point of view.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Screen capture failed: {0}")]
    CaptureFailed(String),

    #[error("Text extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Capture timed out after {0}s")]
    Timeout(u64),

    #[error("Capture worker failed: {0}")]
    Worker(String),
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _msg) => {
                if e.code == rusqlite::ErrorCode::DatabaseLocked
                    || e.code == rusqlite::ErrorCode::DatabaseBusy
                {
                    PersistenceError::Locked
                } else {
                    PersistenceError::QueryFailed(err.to_string())
                }
            }
            _ => PersistenceError::QueryFailed(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Persistence(err.into())
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
