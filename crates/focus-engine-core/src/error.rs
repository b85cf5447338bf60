//! Core error types for focus-engine-core.
//!
//! Every fallible engine operation reports through one of the enums below.
//! None of them is fatal to a running session: persistence and scheduling
//! failures degrade guarantees, they never abort a transition.

use std::path::PathBuf;
use thiserror::Error;

use crate::timer::TimerState;

/// Core error type for focus-engine-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// State machine rejected an operation
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Recovery snapshot or outcome ledger errors
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Background scheduler errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

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

/// Errors raised by the session state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Operation invoked outside its valid source state
    #[error("Cannot {operation} while {state}")]
    InvalidStateTransition {
        operation: &'static str,
        state: TimerState,
    },

    /// Planned duration must be strictly positive
    #[error("Planned duration must be greater than zero")]
    InvalidDuration,

    /// Outcome requested for a session that has not terminated
    #[error("Session {0} has not been finalized")]
    SessionNotFinalized(String),
}

/// Errors from the recovery store and outcome ledger.
#[derive(Error, Debug, Clone)]
pub enum PersistenceError {
    /// Snapshot or outcome could not be written durably
    #[error("Persistence write failed: {0}")]
    WriteFailed(String),

    /// Stored data could not be read
    #[error("Persistence read failed: {0}")]
    ReadFailed(String),

    /// Stored data was unreadable
    #[error("Stored record is corrupt: {0}")]
    Corrupt(String),

    /// Snapshot was written by an incompatible schema
    #[error("Unsupported snapshot version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// Errors from a background scheduler backend.
///
/// A platform that merely refuses to arm a wake reports a
/// [`CapabilityWarning`](crate::scheduler::CapabilityWarning) instead.
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    /// Scheduler backend is not usable at all
    #[error("Background scheduler unavailable: {0}")]
    Unavailable(String),
}

/// Database-specific errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
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

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Unknown configuration key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(inner, _msg) => {
                if inner.code == rusqlite::ErrorCode::DatabaseLocked
                    || inner.code == rusqlite::ErrorCode::DatabaseBusy
                {
                    DatabaseError::Locked
                } else {
                    DatabaseError::QueryFailed(err.to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<DatabaseError> for PersistenceError {
    fn from(err: DatabaseError) -> Self {
        PersistenceError::WriteFailed(err.to_string())
    }
}
