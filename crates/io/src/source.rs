//! Queryable sources and the generic result-set types flowing through
//! extraction, staging and export.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, OpenFlags, Statement, ToSql};
use salesync_recon::normalize::coerce_number;
use salesync_recon::DateWindow;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SyncError};

// ---------------------------------------------------------------------------
// Cells + batches
// ---------------------------------------------------------------------------

/// A single result-set value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Text rendering; `None` for null.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Cell::Null => None,
            Cell::Int(i) => Some(Cow::Owned(i.to_string())),
            Cell::Real(f) => Some(Cow::Owned(f.to_string())),
            Cell::Text(s) => Some(Cow::Borrowed(s)),
        }
    }

    /// Numeric value; text is coerced from either decimal style.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Null => None,
            Cell::Int(i) => Some(*i as f64),
            Cell::Real(f) => f.is_finite().then_some(*f),
            Cell::Text(s) => coerce_number(s),
        }
    }

    /// Date from ISO text (optionally with a time part), `dd/mm/yyyy`, or a
    /// `yyyymmdd` integer.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Cell::Text(s) => parse_date(s.trim()),
            Cell::Int(i) => NaiveDate::parse_from_str(&i.to_string(), "%Y%m%d").ok(),
            _ => None,
        }
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|dt| dt.date()))
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").map(|dt| dt.date()))
        .or_else(|_| NaiveDate::parse_from_str(s, "%d/%m/%Y"))
        .ok()
}

impl From<Value> for Cell {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Cell::Null,
            Value::Integer(i) => Cell::Int(i),
            Value::Real(f) => Cell::Real(f),
            Value::Text(s) => Cell::Text(s),
            Value::Blob(b) => Cell::Text(String::from_utf8_lossy(&b).into_owned()),
        }
    }
}

impl ToSql for Cell {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Cell::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Cell::Int(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Cell::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            Cell::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

/// Column names plus a bounded slice of rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl ResultBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// A source that can return any slice of its (deterministically ordered)
/// result set. Each call is one blocking fetch.
pub trait BatchSource {
    fn fetch(&mut self, offset: u64, limit: usize) -> Result<ResultBatch>;
}

/// Runs a query against a SQLite file, binding the window as `:start` and
/// `:end`, and pages through it with `LIMIT`/`OFFSET`.
///
/// The connection is opened lazily and dropped after a failure, so a retry
/// reconnects.
pub struct SqliteSource {
    path: PathBuf,
    query: String,
    window: DateWindow,
    busy_timeout: Duration,
    conn: Option<Connection>,
}

impl SqliteSource {
    pub fn new(path: &Path, query: &str, window: DateWindow) -> Result<Self> {
        let query = query.trim().trim_end_matches(';').trim();
        if query.is_empty() {
            return Err(SyncError::configuration("source query is empty"));
        }
        Ok(Self {
            path: path.to_path_buf(),
            query: query.to_string(),
            window,
            busy_timeout: Duration::from_secs(5),
            conn: None,
        })
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    fn connection(&mut self) -> Result<&Connection> {
        if self.conn.is_none() {
            let conn = Connection::open_with_flags(
                &self.path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| SyncError::from_sqlite("open source", e))?;
            conn.busy_timeout(self.busy_timeout)
                .map_err(|e| SyncError::from_sqlite("open source", e))?;
            debug!("Opened source {:?}", self.path);
            self.conn = Some(conn);
        }
        self.conn
            .as_ref()
            .ok_or_else(|| SyncError::configuration("source connection unavailable"))
    }

    fn run_page(&mut self, offset: u64, limit: usize) -> Result<ResultBatch> {
        let sql = format!(
            "SELECT * FROM ({}) LIMIT :limit OFFSET :offset",
            self.query
        );
        let start = self.window.start.to_string();
        let end = self.window.end.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let conn = self.connection()?;

        let map = |e| SyncError::from_sqlite("fetch source batch", e);
        let mut stmt = conn.prepare(&sql).map_err(map)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let binds: [(&str, &dyn ToSql); 4] = [
            (":start", &start),
            (":end", &end),
            (":limit", &limit),
            (":offset", &offset),
        ];
        bind_present(&mut stmt, &binds).map_err(map)?;

        let mut rows = Vec::new();
        let mut cursor = stmt.raw_query();
        while let Some(row) = cursor.next().map_err(map)? {
            let mut cells = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                let value: Value = row.get(i).map_err(map)?;
                cells.push(Cell::from(value));
            }
            rows.push(cells);
        }
        Ok(ResultBatch { columns, rows })
    }

    /// Number of rows the windowed query returns.
    pub fn count_rows(&mut self) -> Result<u64> {
        let result = self.run_count();
        if result.is_err() {
            self.conn = None;
        }
        result
    }

    fn run_count(&mut self) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM ({})", self.query);
        let start = self.window.start.to_string();
        let end = self.window.end.to_string();
        let conn = self.connection()?;

        let map = |e| SyncError::from_sqlite("count source rows", e);
        let mut stmt = conn.prepare(&sql).map_err(map)?;
        let binds: [(&str, &dyn ToSql); 2] = [(":start", &start), (":end", &end)];
        bind_present(&mut stmt, &binds).map_err(map)?;
        let mut cursor = stmt.raw_query();
        let count: i64 = match cursor.next().map_err(map)? {
            Some(row) => row.get(0).map_err(map)?,
            None => 0,
        };
        Ok(count.max(0) as u64)
    }
}

/// Bind the named parameters the statement actually uses.
fn bind_present(stmt: &mut Statement<'_>, binds: &[(&str, &dyn ToSql)]) -> rusqlite::Result<()> {
    for (name, value) in binds {
        if let Some(idx) = stmt.parameter_index(name)? {
            stmt.raw_bind_parameter(idx, *value)?;
        }
    }
    Ok(())
}

impl BatchSource for SqliteSource {
    fn fetch(&mut self, offset: u64, limit: usize) -> Result<ResultBatch> {
        let result = self.run_page(offset, limit);
        if result.is_err() {
            self.conn = None;
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
