//! Destination DDL and unique-key verification.

use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension};
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::partition::{quote_ident, PartitionTable};

/// Columns of the composite-key unique index, in key order.
pub const KEY_COLUMNS: [&str; 6] = [
    "client_code",
    "agent_code",
    "product_code",
    "document_number",
    "line_type",
    "line_seq",
];

const PARTITION_COLUMNS: &str = r#"
    id INTEGER PRIMARY KEY,
    client_code TEXT NOT NULL,
    agent_code TEXT NOT NULL,
    product_code TEXT NOT NULL,
    document_number TEXT NOT NULL,
    line_type TEXT NOT NULL,
    line_seq TEXT NOT NULL DEFAULT '',
    sale_date TEXT NOT NULL,        -- YYYY-MM-DD
    quantity REAL NOT NULL,
    net_amount REAL NOT NULL,
    cost REAL NOT NULL,
    descriptive TEXT NOT NULL DEFAULT '{}',  -- JSON object
    updated_at TEXT NOT NULL
"#;

pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(|e| SyncError::from_sqlite("inspect schema", e))
}

/// Create a missing partition and make sure its composite-key index exists.
pub fn ensure_partition(conn: &Connection, table: &PartitionTable) -> Result<()> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        table.quoted(),
        PARTITION_COLUMNS
    );
    conn.execute_batch(&sql)
        .map_err(|e| SyncError::from_sqlite("create partition", e))?;
    ensure_unique_key(conn, table.name())?;
    let date_index = quote_ident(&format!("{}_sale_date", table.name()))?;
    conn.execute_batch(&format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} (sale_date)",
        date_index,
        table.quoted()
    ))
    .map_err(|e| SyncError::from_sqlite("create date index", e))
}

/// Verify that `table` has a unique index over exactly the key columns.
///
/// A missing index is created. If creation fails because rows already share
/// a key, the run aborts with instructions instead of writing into a table
/// where insert-or-ignore would not be idempotent.
pub fn ensure_unique_key(conn: &Connection, table: &str) -> Result<()> {
    if has_key_index(conn, table)? {
        return Ok(());
    }

    let index = quote_ident(&format!("{table}_key"))?;
    let sql = format!(
        "CREATE UNIQUE INDEX {} ON {} ({})",
        index,
        quote_ident(table)?,
        KEY_COLUMNS.join(", ")
    );
    match conn.execute_batch(&sql) {
        Ok(()) => {
            info!("Created composite-key index on {}", table);
            Ok(())
        }
        Err(e) => {
            warn!("Cannot create composite-key index on {}: {}", table, e);
            Err(SyncError::schema(format!(
                "table {table} has no unique index on ({}) and one cannot be created ({e}); \
                 remove rows sharing a composite key from {table} and rerun",
                KEY_COLUMNS.join(", ")
            )))
        }
    }
}

fn has_key_index(conn: &Connection, table: &str) -> Result<bool> {
    let wanted: BTreeSet<&str> = KEY_COLUMNS.iter().copied().collect();
    let mut list = conn
        .prepare(r#"SELECT name FROM pragma_index_list(?1) WHERE "unique" = 1"#)
        .map_err(|e| SyncError::from_sqlite("inspect indexes", e))?;
    let indexes: Vec<String> = list
        .query_map([table], |r| r.get(0))
        .and_then(|rows| rows.collect())
        .map_err(|e| SyncError::from_sqlite("inspect indexes", e))?;

    let mut info = conn
        .prepare("SELECT name FROM pragma_index_info(?1)")
        .map_err(|e| SyncError::from_sqlite("inspect indexes", e))?;
    for index in indexes {
        let columns: Vec<String> = info
            .query_map([&index], |r| r.get(0))
            .and_then(|rows| rows.collect())
            .map_err(|e| SyncError::from_sqlite("inspect indexes", e))?;
        let got: BTreeSet<&str> = columns.iter().map(String::as_str).collect();
        if got == wanted {
            return Ok(true);
        }
    }
    Ok(false)
}
