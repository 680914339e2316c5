//! Error taxonomy for every stage that touches a database or the filesystem.
//!
//! Lower-level errors are classified here, at the stage boundary, so nothing
//! leaves this crate as a raw driver error.

use std::fmt;

use rusqlite::ErrorCode;
use salesync_config::ConfigError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Missing connection or parameter, invalid config. Raised before any IO.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Lock timeout or dropped connection, after retries were exhausted.
    #[error("Transient database error during {operation} after {attempts} attempt(s): {message}")]
    TransientDb {
        operation: String,
        attempts: u32,
        message: String,
    },

    /// Missing or unrecoverable constraint, invalid partition identifier.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Any other database failure.
    #[error("Database error during {operation}: {message}")]
    Database { operation: String, message: String },

    /// A mutation batch failed; earlier batches stay committed.
    #[error(
        "Batch {batch_index} (rows {first_row}-{last_row}) failed after {batches_applied} batch(es) were applied: {message}"
    )]
    PartialBatch {
        batch_index: usize,
        first_row: u64,
        last_row: u64,
        batches_applied: usize,
        message: String,
    },

    #[error("Export failed: {0}")]
    Export(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Cancellation observed at a batch boundary.
    #[error("Run cancelled")]
    Cancelled,
}

/// Stable, serializable error class reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    TransientDb,
    Schema,
    PartialBatch,
    Database,
    Export,
    Io,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::TransientDb => "transient_db",
            Self::Schema => "schema",
            Self::PartialBatch => "partial_batch",
            Self::Database => "database",
            Self::Export => "export",
            Self::Io => "io",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl SyncError {
    pub fn configuration(message: impl Into<String>) -> Self {
        SyncError::Configuration(message.into())
    }

    pub fn schema(message: impl Into<String>) -> Self {
        SyncError::Schema(message.into())
    }

    pub fn export(message: impl Into<String>) -> Self {
        SyncError::Export(message.into())
    }

    /// Classify a SQLite error raised during `operation`.
    pub fn from_sqlite(operation: &str, err: rusqlite::Error) -> Self {
        let message = err.to_string();
        if is_transient_sqlite(&err) {
            SyncError::TransientDb {
                operation: operation.to_string(),
                attempts: 1,
                message,
            }
        } else if is_schema_sqlite(&err) {
            SyncError::Schema(format!("{operation}: {message}"))
        } else {
            SyncError::Database {
                operation: operation.to_string(),
                message,
            }
        }
    }

    /// Pool checkout timed out or the manager could not connect.
    pub fn from_pool(operation: &str, err: r2d2::Error) -> Self {
        SyncError::TransientDb {
            operation: operation.to_string(),
            attempts: 1,
            message: err.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientDb { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Configuration(_) => ErrorKind::Configuration,
            SyncError::TransientDb { .. } => ErrorKind::TransientDb,
            SyncError::Schema(_) => ErrorKind::Schema,
            SyncError::Database { .. } => ErrorKind::Database,
            SyncError::PartialBatch { .. } => ErrorKind::PartialBatch,
            SyncError::Export(_) => ErrorKind::Export,
            SyncError::Io(_) => ErrorKind::Io,
            SyncError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        SyncError::Configuration(err.to_string())
    }
}

impl From<csv::Error> for SyncError {
    fn from(err: csv::Error) -> Self {
        SyncError::Export(format!("csv: {err}"))
    }
}

impl From<rust_xlsxwriter::XlsxError> for SyncError {
    fn from(err: rust_xlsxwriter::XlsxError) -> Self {
        SyncError::Export(format!("xlsx: {err}"))
    }
}

fn is_transient_sqlite(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen
        ),
        _ => false,
    }
}

fn is_schema_sqlite(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, msg) => {
            e.code == ErrorCode::ConstraintViolation
                || msg
                    .as_deref()
                    .is_some_and(|m| m.contains("no such table") || m.contains("no such column"))
        }
        _ => false,
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
