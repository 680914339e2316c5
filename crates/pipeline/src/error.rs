use salesync_config::ConfigError;
use salesync_io::{ErrorKind, SyncError};
use serde::Serialize;
use thiserror::Error;

/// What a failed run reports to its caller. Details beyond the kind and the
/// message are logged.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("{kind}: {message}")]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl RunFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<SyncError> for RunFailure {
    fn from(err: SyncError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<ConfigError> for RunFailure {
    fn from(err: ConfigError) -> Self {
        Self::new(ErrorKind::Configuration, err.to_string())
    }
}
