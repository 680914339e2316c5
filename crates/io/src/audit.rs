//! Persistence of reconciliation decisions.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rusqlite::{params, Connection};
use salesync_recon::{Decision, Route};
use serde::Serialize;
use tracing::info;

use crate::error::{Result, SyncError};
use crate::partition::quote_ident;

/// One row of the audit table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub run_date: DateTime<Utc>,
    pub period_month: u32,
    pub period_year: i32,
    pub staging_count: u64,
    pub staging_sum: f64,
    pub existing_count_confirmed: u64,
    pub existing_sum_confirmed: f64,
    pub existing_count_returns: u64,
    pub existing_sum_returns: f64,
    pub decision: String,
    /// `OK` or `ERROR`.
    pub status: String,
    pub message: String,
    pub duplicate_group_count: u64,
    pub action_taken: String,
}

impl AuditRecord {
    /// `period` is the earliest staged sale date, or the window start when
    /// nothing was staged.
    pub fn from_decision(decision: &Decision, period: NaiveDate, run_date: DateTime<Utc>) -> Self {
        let staging = decision.totals.staging_total();
        let confirmed = decision.totals.existing.get(Route::Confirmed);
        let returns = decision.totals.existing.get(Route::Returns);
        Self {
            run_date,
            period_month: period.month(),
            period_year: period.year(),
            staging_count: staging.record_count,
            staging_sum: staging.sum_net_amount,
            existing_count_confirmed: confirmed.record_count,
            existing_sum_confirmed: confirmed.sum_net_amount,
            existing_count_returns: returns.record_count,
            existing_sum_returns: returns.sum_net_amount,
            decision: decision.kind.to_string(),
            status: decision.kind.status().to_string(),
            message: decision.message.clone(),
            duplicate_group_count: decision.duplicate_groups,
            action_taken: decision.kind.action_taken().to_string(),
        }
    }
}

pub fn ensure_table(conn: &Connection, name: &str) -> Result<()> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id INTEGER PRIMARY KEY,
            run_date TEXT NOT NULL,
            period_month INTEGER NOT NULL,
            period_year INTEGER NOT NULL,
            staging_count INTEGER NOT NULL,
            staging_sum REAL NOT NULL,
            existing_count_confirmed INTEGER NOT NULL,
            existing_sum_confirmed REAL NOT NULL,
            existing_count_returns INTEGER NOT NULL,
            existing_sum_returns REAL NOT NULL,
            decision TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('OK', 'ERROR')),
            message TEXT NOT NULL,
            duplicate_group_count INTEGER NOT NULL,
            action_taken TEXT NOT NULL
        )",
        quote_ident(name)?
    );
    conn.execute_batch(&sql)
        .map_err(|e| SyncError::from_sqlite("create audit table", e))
}

/// Append `record` to the audit table, creating it if needed. Returns the
/// new row id.
pub fn record(conn: &Connection, table: &str, record: &AuditRecord) -> Result<i64> {
    ensure_table(conn, table)?;
    let sql = format!(
        "INSERT INTO {} (run_date, period_month, period_year, staging_count, staging_sum,
            existing_count_confirmed, existing_sum_confirmed, existing_count_returns,
            existing_sum_returns, decision, status, message, duplicate_group_count, action_taken)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        quote_ident(table)?
    );
    conn.execute(
        &sql,
        params![
            record.run_date.to_rfc3339(),
            record.period_month,
            record.period_year,
            record.staging_count as i64,
            record.staging_sum,
            record.existing_count_confirmed as i64,
            record.existing_sum_confirmed,
            record.existing_count_returns as i64,
            record.existing_sum_returns,
            record.decision,
            record.status,
            record.message,
            record.duplicate_group_count as i64,
            record.action_taken,
        ],
    )
    .map_err(|e| SyncError::from_sqlite("write audit record", e))?;
    let id = conn.last_insert_rowid();
    info!(
        "Audit {} recorded for {}-{:02}: {}",
        record.decision, record.period_year, record.period_month, record.action_taken
    );
    Ok(id)
}
