use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use chrono::NaiveDate;
use regex::Regex;
use salesync_recon::EngineConfig;
use serde::Deserialize;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Everything one sync or report run needs, validated once on load.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    /// Default window when a run request does not name one.
    #[serde(default)]
    pub window: Option<WindowConfig>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub columns: ColumnMapping,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub staging: StagingConfig,
}

// ---------------------------------------------------------------------------
// Source + destination
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Source identifier, embedded in export artifact names.
    pub id: String,
    pub path: PathBuf,
    /// Extraction query. Must bind the window as `:start` and `:end`.
    pub query: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    pub path: PathBuf,
    /// Partition tables are named `<prefix>_<year>_<fact|dev>`.
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Partition years a run may touch.
    #[serde(default)]
    pub years: YearRange,
    #[serde(default = "default_audit_table")]
    pub audit_table: String,
}

fn default_table_prefix() -> String {
    "infoventas".into()
}

fn default_pool_size() -> u32 {
    4
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_audit_table() -> String {
    "sync_audit".into()
}

impl DestinationConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct YearRange {
    pub first: i32,
    pub last: i32,
}

impl Default for YearRange {
    fn default() -> Self {
        Self {
            first: 2000,
            last: 2100,
        }
    }
}

impl YearRange {
    pub fn contains(&self, year: i32) -> bool {
        (self.first..=self.last).contains(&year)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct WindowConfig {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

// ---------------------------------------------------------------------------
// Batching + retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub extract_size: usize,
    #[serde(default = "default_batch_size")]
    pub mutate_size: usize,
    /// Extracted batches buffered between the producer thread and the
    /// classifier.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_batch_size() -> usize {
    50_000
}

fn default_queue_depth() -> usize {
    4
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            extract_size: default_batch_size(),
            mutate_size: default_batch_size(),
            queue_depth: default_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Column mapping
// ---------------------------------------------------------------------------

/// Source result-set column for each sale line field.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ColumnMapping {
    pub client: String,
    pub agent: String,
    pub product: String,
    pub document: String,
    pub line_type: String,
    pub line_seq: Option<String>,
    pub sale_date: String,
    pub quantity: String,
    pub net_amount: String,
    pub cost: String,
    /// Descriptive `"code - name"` columns split into `<col>_code` and
    /// `<col>_name`.
    pub code_name_columns: Vec<String>,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            client: "client_code".into(),
            agent: "agent_code".into(),
            product: "product_code".into(),
            document: "document_number".into(),
            line_type: "line_type".into(),
            line_seq: None,
            sale_date: "sale_date".into(),
            quantity: "quantity".into(),
            net_amount: "net_amount".into(),
            cost: "cost".into(),
            code_name_columns: Vec::new(),
        }
    }
}

impl ColumnMapping {
    /// Columns with a fixed meaning; everything else is descriptive.
    pub fn mapped(&self) -> Vec<&str> {
        let mut cols = vec![
            self.client.as_str(),
            self.agent.as_str(),
            self.product.as_str(),
            self.document.as_str(),
            self.line_type.as_str(),
            self.sale_date.as_str(),
            self.quantity.as_str(),
            self.net_amount.as_str(),
            self.cost.as_str(),
        ];
        if let Some(seq) = &self.line_seq {
            cols.push(seq.as_str());
        }
        cols
    }
}

// ---------------------------------------------------------------------------
// Export + staging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Row count at which exports switch from a workbook to CSV files.
    #[serde(default = "default_csv_threshold")]
    pub csv_threshold: u64,
    #[serde(default = "default_batch_size")]
    pub chunk_size: usize,
}

fn default_output_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("salesync")
        .join("exports")
}

fn default_csv_threshold() -> u64 {
    1_000_000
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            csv_threshold: default_csv_threshold(),
            chunk_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StagingConfig {
    /// Parent directory for per-run staging stores. System temp when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl StagingConfig {
    pub fn dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

// ---------------------------------------------------------------------------
// Load + Validate
// ---------------------------------------------------------------------------

impl SyncConfig {
    /// Default config file location.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("salesync")
            .join("sync.toml")
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.id.trim().is_empty() {
            return Err(ConfigError::invalid("source.id is required"));
        }
        if self.source.path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("source.path is required"));
        }
        if self.destination.path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("destination.path is required"));
        }
        for param in [":start", ":end"] {
            if !self.source.query.contains(param) {
                return Err(ConfigError::invalid(format!(
                    "source.query must bind the window parameter {param}"
                )));
            }
        }

        if !is_plain_identifier(&self.destination.table_prefix) {
            return Err(ConfigError::invalid(format!(
                "destination.table_prefix '{}' must start with a lowercase letter and contain only [a-z0-9_]",
                self.destination.table_prefix
            )));
        }
        if !is_plain_identifier(&self.destination.audit_table) {
            return Err(ConfigError::invalid(format!(
                "destination.audit_table '{}' must start with a lowercase letter and contain only [a-z0-9_]",
                self.destination.audit_table
            )));
        }
        if self.destination.pool_size == 0 {
            return Err(ConfigError::invalid("destination.pool_size must be at least 1"));
        }
        if self.destination.years.first > self.destination.years.last {
            return Err(ConfigError::invalid(format!(
                "destination.years: first ({}) is after last ({})",
                self.destination.years.first, self.destination.years.last
            )));
        }

        if let Some(window) = &self.window {
            if window.start > window.end {
                return Err(ConfigError::invalid(format!(
                    "window.start {} is after window.end {}",
                    window.start, window.end
                )));
            }
        }

        for (name, value) in [
            ("batch.extract_size", self.batch.extract_size),
            ("batch.mutate_size", self.batch.mutate_size),
            ("batch.queue_depth", self.batch.queue_depth),
            ("export.chunk_size", self.export.chunk_size),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(format!("{name} must be at least 1")));
            }
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::invalid("retry.attempts must be at least 1"));
        }
        if self.export.csv_threshold == 0 {
            return Err(ConfigError::invalid("export.csv_threshold must be at least 1"));
        }

        let mapped = self.columns.mapped();
        if let Some(blank) = mapped.iter().find(|c| c.trim().is_empty()) {
            return Err(ConfigError::invalid(format!(
                "columns: mapped column names cannot be blank (got {blank:?})"
            )));
        }
        for (i, col) in mapped.iter().enumerate() {
            if mapped[i + 1..].contains(col) {
                return Err(ConfigError::invalid(format!(
                    "columns: '{col}' is mapped to more than one field"
                )));
            }
        }

        self.engine.validate()?;
        Ok(())
    }
}

/// Allow-list for table names taken from configuration: lowercase ASCII,
/// at most 48 characters.
pub const IDENTIFIER_PATTERN: &str = "^[a-z][a-z0-9_]{0,47}$";

static PLAIN_IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(IDENTIFIER_PATTERN).expect("IDENTIFIER_PATTERN is a valid regex pattern")
});

pub fn is_plain_identifier(name: &str) -> bool {
    PLAIN_IDENTIFIER.is_match(name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[source]
id = "DATAZENITH"
path = "/data/source.db"
query = "SELECT * FROM ventas WHERE fecha BETWEEN :start AND :end"

[destination]
path = "/data/warehouse.db"
"#;

    #[test]
    fn parse_minimal_fills_defaults() {
        let config = SyncConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.source.id, "DATAZENITH");
        assert_eq!(config.destination.table_prefix, "infoventas");
        assert_eq!(config.destination.pool_size, 4);
        assert_eq!(config.destination.audit_table, "sync_audit");
        assert_eq!(config.batch.extract_size, 50_000);
        assert_eq!(config.batch.mutate_size, 50_000);
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.retry.delay(), Duration::from_secs(1));
        assert_eq!(config.export.csv_threshold, 1_000_000);
        assert_eq!(config.engine.tolerance.reconciliation, 100.0);
        assert_eq!(config.columns.client, "client_code");
        assert!(config.window.is_none());
    }

    #[test]
    fn parse_full_sections() {
        let input = format!(
            r#"{MINIMAL}
[window]
start = "2025-01-01"
end = "2025-01-31"

[engine]
include_line_seq = true
duplicate_warning_limit = 10

[engine.tolerance]
reconciliation = 50.0

[engine.routes]
confirmed = ["0", "F"]
returns = ["1", "D"]

[batch]
extract_size = 1000
queue_depth = 2

[columns]
client = "Cod. cliente"
line_seq = "Linea"
code_name_columns = ["Vendedor"]
"#
        );
        let config = SyncConfig::from_toml(&input).unwrap();
        let window = config.window.unwrap();
        assert_eq!(window.start.to_string(), "2025-01-01");
        assert!(config.engine.include_line_seq);
        assert_eq!(config.engine.duplicate_warning_limit, 10);
        assert_eq!(config.engine.tolerance.reconciliation, 50.0);
        assert_eq!(config.engine.routes.returns, vec!["1", "D"]);
        assert_eq!(config.batch.extract_size, 1000);
        assert_eq!(config.batch.mutate_size, 50_000);
        assert_eq!(config.columns.client, "Cod. cliente");
        assert_eq!(config.columns.agent, "agent_code");
        assert_eq!(config.columns.line_seq.as_deref(), Some("Linea"));
    }

    #[test]
    fn rejects_query_without_window_binding() {
        let input = MINIMAL.replace(":end", "'2025-12-31'");
        let err = SyncConfig::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains(":end"), "{err}");
    }

    #[test]
    fn rejects_unsafe_table_prefix() {
        let input = format!("{MINIMAL}table_prefix = \"ventas; DROP TABLE x\"\n");
        let err = SyncConfig::from_toml(&input).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn plain_identifier_bounds() {
        assert!(is_plain_identifier("infoventas"));
        assert!(is_plain_identifier(&format!("a{}", "b".repeat(47))));
        assert!(!is_plain_identifier(&format!("a{}", "b".repeat(48))));
        for name in ["", "Ventas", "1abc", "v\"x", "ventas\n"] {
            assert!(!is_plain_identifier(name), "{name:?} accepted");
        }
    }

    #[test]
    fn rejects_inverted_window() {
        let input = format!("{MINIMAL}\n[window]\nstart = \"2025-02-01\"\nend = \"2025-01-01\"\n");
        assert!(SyncConfig::from_toml(&input).is_err());
    }

    #[test]
    fn rejects_zero_batch_size() {
        let input = format!("{MINIMAL}\n[batch]\nmutate_size = 0\n");
        let err = SyncConfig::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("batch.mutate_size"));
    }

    #[test]
    fn rejects_column_mapped_twice() {
        let input = format!("{MINIMAL}\n[columns]\nagent = \"client_code\"\n");
        let err = SyncConfig::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("client_code"));
    }

    #[test]
    fn surfaces_engine_validation() {
        let input = format!("{MINIMAL}\n[engine.routes]\nconfirmed = [\"0\"]\nreturns = [\"0\"]\n");
        let err = SyncConfig::from_toml(&input).unwrap_err();
        assert!(matches!(err, ConfigError::Engine(_)));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = SyncConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        fs::write(&path, MINIMAL).unwrap();
        assert_eq!(SyncConfig::load(&path).unwrap().source.id, "DATAZENITH");
    }
}
