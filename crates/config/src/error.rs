use std::path::PathBuf;

use salesync_recon::ReconError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML parse / deserialization error.
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is missing or out of range.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// Engine section rejected by the reconciliation engine.
    #[error("{0}")]
    Engine(#[from] ReconError),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid(message.into())
    }
}
