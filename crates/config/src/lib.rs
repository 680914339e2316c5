// Configuration loading

pub mod error;
pub mod settings;

pub use error::ConfigError;
pub use settings::{
    is_plain_identifier, BatchConfig, ColumnMapping, DestinationConfig, ExportConfig,
    RetryConfig, SourceConfig, StagingConfig, SyncConfig, WindowConfig, YearRange,
    IDENTIFIER_PATTERN,
};
