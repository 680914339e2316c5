//! Private, per-run staging store.
//!
//! Each run gets its own SQLite file inside a fresh temporary directory, so
//! concurrent runs never share staging state. Records are kept as JSON
//! payloads grouped under a tag and read back in insertion order. Dropping
//! the area deletes the directory, on success and on failure alike.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::TempDir;
use tracing::debug;

use crate::error::{Result, SyncError};

const STAGING_SCHEMA: &str = r#"
    CREATE TABLE staged (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        tag TEXT NOT NULL,
        key TEXT,
        weight REAL,
        payload TEXT NOT NULL
    );
    CREATE INDEX staged_tag ON staged (tag, seq);
    CREATE UNIQUE INDEX staged_key ON staged (tag, key) WHERE key IS NOT NULL;
    CREATE TABLE staged_columns (
        tag TEXT PRIMARY KEY,
        columns TEXT NOT NULL
    );
"#;

pub struct StagingArea {
    // Closed before the directory is removed.
    conn: Connection,
    dir: TempDir,
}

impl StagingArea {
    /// Create a staging area under `parent`.
    pub fn create(parent: &Path) -> Result<Self> {
        std::fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new()
            .prefix("salesync-staging-")
            .tempdir_in(parent)?;
        let conn = Connection::open(dir.path().join("staging.db"))
            .map_err(|e| SyncError::from_sqlite("open staging", e))?;
        conn.execute_batch("PRAGMA journal_mode = OFF; PRAGMA synchronous = OFF;")
            .map_err(|e| SyncError::from_sqlite("open staging", e))?;
        conn.execute_batch(STAGING_SCHEMA)
            .map_err(|e| SyncError::from_sqlite("create staging", e))?;
        debug!("Created staging area {:?}", dir.path());
        Ok(Self { conn, dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Append `records` under `tag` in one transaction.
    pub fn put<T: Serialize>(&mut self, tag: &str, records: &[T]) -> Result<usize> {
        let map = |e| SyncError::from_sqlite("write staging", e);
        let tx = self.conn.transaction().map_err(map)?;
        {
            let mut stmt = tx
                .prepare_cached("INSERT INTO staged (tag, payload) VALUES (?1, ?2)")
                .map_err(map)?;
            for record in records {
                let payload = serde_json::to_string(record)
                    .map_err(|e| SyncError::export(format!("stage record: {e}")))?;
                stmt.execute(params![tag, payload]).map_err(map)?;
            }
        }
        tx.commit().map_err(map)?;
        Ok(records.len())
    }

    /// Stage `(key, weight, record)` entries under `tag`, keeping one record
    /// per key across every call for the life of the area.
    ///
    /// A later record replaces the kept one only when its weight is strictly
    /// larger; ties keep the earlier record. The kept record stays at the
    /// position where its key was first seen.
    pub fn put_keyed<K, T, I>(&mut self, tag: &str, records: I) -> Result<usize>
    where
        K: Serialize,
        T: Serialize,
        I: IntoIterator<Item = (K, f64, T)>,
    {
        let map = |e| SyncError::from_sqlite("write staging", e);
        let tx = self.conn.transaction().map_err(map)?;
        let mut written = 0;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO staged (tag, key, weight, payload) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(tag, key) WHERE key IS NOT NULL DO UPDATE
                     SET weight = excluded.weight, payload = excluded.payload
                     WHERE excluded.weight > staged.weight",
                )
                .map_err(map)?;
            for (key, weight, record) in records {
                let key = serde_json::to_string(&key)
                    .map_err(|e| SyncError::export(format!("stage key: {e}")))?;
                let payload = serde_json::to_string(&record)
                    .map_err(|e| SyncError::export(format!("stage record: {e}")))?;
                stmt.execute(params![tag, key, weight, payload]).map_err(map)?;
                written += 1;
            }
        }
        tx.commit().map_err(map)?;
        Ok(written)
    }

    pub fn count(&self, tag: &str) -> Result<u64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM staged WHERE tag = ?1", [tag], |r| {
                r.get::<_, i64>(0)
            })
            .map(|n| n as u64)
            .map_err(|e| SyncError::from_sqlite("count staging", e))
    }

    pub fn set_columns(&self, tag: &str, columns: &[String]) -> Result<()> {
        let json = serde_json::to_string(columns)
            .map_err(|e| SyncError::export(format!("stage columns: {e}")))?;
        self.conn
            .execute(
                "INSERT INTO staged_columns (tag, columns) VALUES (?1, ?2)
                 ON CONFLICT(tag) DO UPDATE SET columns = excluded.columns",
                params![tag, json],
            )
            .map(|_| ())
            .map_err(|e| SyncError::from_sqlite("write staging", e))
    }

    /// Columns recorded for `tag`, empty when none were set.
    pub fn columns(&self, tag: &str) -> Result<Vec<String>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT columns FROM staged_columns WHERE tag = ?1",
                [tag],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| SyncError::from_sqlite("read staging", e))?;
        match json {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| SyncError::export(format!("staged columns for {tag}: {e}"))),
            None => Ok(Vec::new()),
        }
    }

    /// Read `tag` back in insertion order, `batch_size` records at a time.
    pub fn scan<T: DeserializeOwned>(&self, tag: &str, batch_size: usize) -> StagedBatches<'_, T> {
        StagedBatches {
            conn: &self.conn,
            tag: tag.to_string(),
            batch_size: batch_size.max(1),
            after: 0,
            done: false,
            _marker: std::marker::PhantomData,
        }
    }

    /// Remove the staging directory now, reporting any failure.
    pub fn dispose(self) -> Result<()> {
        let Self { conn, dir } = self;
        let path: PathBuf = dir.path().to_path_buf();
        conn.close()
            .map_err(|(_, e)| SyncError::from_sqlite("close staging", e))?;
        dir.close()?;
        debug!("Removed staging area {:?}", path);
        Ok(())
    }
}

/// Keyset-paged reader over one tag.
pub struct StagedBatches<'a, T> {
    conn: &'a Connection,
    tag: String,
    batch_size: usize,
    after: i64,
    done: bool,
    _marker: std::marker::PhantomData<T>,
}

impl<T: DeserializeOwned> StagedBatches<'_, T> {
    fn read_page(&mut self) -> Result<Vec<T>> {
        let map = |e| SyncError::from_sqlite("read staging", e);
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT seq, payload FROM staged WHERE tag = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
            )
            .map_err(map)?;
        let rows: Vec<(i64, String)> = stmt
            .query_map(
                params![self.tag, self.after, self.batch_size as i64],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .and_then(|rows| rows.collect())
            .map_err(map)?;

        let mut out = Vec::with_capacity(rows.len());
        for (seq, payload) in rows {
            let record = serde_json::from_str(&payload)
                .map_err(|e| SyncError::export(format!("staged record {seq}: {e}")))?;
            out.push(record);
            self.after = seq;
        }
        Ok(out)
    }
}

impl<T: DeserializeOwned> Iterator for StagedBatches<'_, T> {
    type Item = Result<Vec<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_page() {
            Ok(page) => {
                if page.len() < self.batch_size {
                    self.done = true;
                }
                (!page.is_empty()).then_some(Ok(page))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
