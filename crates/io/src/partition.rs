//! Partition table naming and identifier quoting.
//!
//! Destination data is split per year and route into tables named
//! `<prefix>_<year>_<fact|dev>`. Identifiers cannot be bound as statement
//! parameters, so every name is checked against an allow-list pattern and a
//! configured year range, then quoted, before it is interpolated into SQL.

use salesync_config::{is_plain_identifier, YearRange, IDENTIFIER_PATTERN};
use salesync_recon::{DateWindow, Route};

use crate::error::{Result, SyncError};

/// Maximum identifier length accepted by `quote_ident`.
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Validate an identifier for security issues.
///
/// Rejects empty names, names containing null bytes, and names longer than
/// `MAX_IDENTIFIER_LENGTH`.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SyncError::schema("identifier cannot be empty"));
    }
    if name.contains('\0') {
        return Err(SyncError::schema(format!(
            "identifier contains a null byte: {name:?}"
        )));
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(SyncError::schema(format!(
            "identifier exceeds {MAX_IDENTIFIER_LENGTH} bytes: {name:?}"
        )));
    }
    Ok(())
}

/// Quote a SQLite identifier, doubling embedded double quotes.
pub fn quote_ident(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// A resolved, validated partition table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionTable {
    pub route: Route,
    pub year: i32,
    name: String,
}

impl PartitionTable {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name ready for interpolation.
    pub fn quoted(&self) -> String {
        // The name is built from a checked prefix, a year and a fixed suffix.
        format!("\"{}\"", self.name)
    }
}

#[derive(Debug, Clone)]
pub struct PartitionResolver {
    prefix: String,
    years: YearRange,
}

impl PartitionResolver {
    pub fn new(prefix: &str, years: YearRange) -> Result<Self> {
        if !is_plain_identifier(prefix) {
            return Err(SyncError::schema(format!(
                "table prefix {prefix:?} does not match {IDENTIFIER_PATTERN}"
            )));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            years,
        })
    }

    pub fn resolve(&self, route: Route, year: i32) -> Result<PartitionTable> {
        if !self.years.contains(year) {
            return Err(SyncError::schema(format!(
                "year {year} is outside the allowed partition range {}-{}",
                self.years.first, self.years.last
            )));
        }
        let name = format!("{}_{}_{}", self.prefix, year, route.suffix());
        validate_identifier(&name)?;
        Ok(PartitionTable { route, year, name })
    }

    /// Every partition of `route` the window touches, oldest first.
    pub fn for_window(&self, route: Route, window: &DateWindow) -> Result<Vec<PartitionTable>> {
        window.years().map(|year| self.resolve(route, year)).collect()
    }
}
