// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by where they surface in the pipeline and carry
//! enough context to tell an operator which table or message failed.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Database` | Depends | sqlx errors: I/O and pool timeouts are transient, SQL errors are not |
//! | `Transport` | Yes | The publish/subscribe collaborator rejected or dropped a call |
//! | `Config` | No | Missing or invalid configuration key, unknown mapper/dialect |
//! | `Apply` | No | A message could not be applied to the destination |
//! | `UnknownCommand` | No | Message command outside the supported set |
//! | `UnknownAction` | No | Row action outside INSERT/UPDATE/DELETE |
//! | `TableExists` | No | CREATE conflict with overwrite disabled |
//! | `Codec` | No | Malformed change message |
//! | `Decompression` | No | Corrupted zstd payload |
//! | `Dump` | No | The dump file sink failed |
//! | `InvalidState` | No | State machine violation (agent or slave session) |
//! | `Shutdown` | No | Agent is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! The change scheduler is the only component that retries on its own. It
//! retries every error, but uses [`ReplicationError::is_retryable()`] to decide
//! the log level. Apply failures are always handed back to the caller; the
//! transport decides about redelivery.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during capture, conversion, or apply.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Error from the underlying SQL driver or connection pool.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    ///
    /// Fatal at startup - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A message could not be applied; the transaction was rolled back.
    #[error("Apply error ({table}): {message}")]
    Apply { table: String, message: String },

    /// The message command is not one the writer understands.
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    /// A row carried an action other than INSERT, UPDATE or DELETE.
    #[error("Unknown action '{action}' for table '{table}'")]
    UnknownAction { table: String, action: String },

    /// CREATE for a table that already exists while overwriting is disabled.
    #[error("Table '{0}' already exists and 'replication.overwriteTables' is false")]
    TableExists(String),

    /// Malformed change message (bad JSON, missing attribute, bad row image).
    #[error("Codec error: {0}")]
    Codec(String),

    /// Zstd decompression failure.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// The dump file sink could not store a payload.
    #[error("Dump error ({name}): {message}")]
    Dump { name: String, message: String },

    /// The publish/subscribe collaborator failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// State machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create an apply error for a table.
    pub fn apply(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Apply {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Check if this error is a transient condition worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(e) => is_transient_sqlx_error(e),
            Self::Transport(_) => true,
            Self::Config(_) => false,
            Self::Apply { .. } => false,
            Self::UnknownCommand(_) => false,
            Self::UnknownAction { .. } => false,
            Self::TableExists(_) => false,
            Self::Codec(_) => false,
            Self::Decompression(_) => false,
            Self::Dump { .. } => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

/// Connection-level sqlx failures (as opposed to SQL the database rejected).
fn is_transient_sqlx_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(_) => is_sqlite_busy_error(e),
        _ => false,
    }
}

/// Check if an error is a retryable SQLite busy/locked error
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}
