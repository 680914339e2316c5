//! Shared connection pool for the destination store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use salesync_config::DestinationConfig;
use tracing::debug;

use crate::error::{Result, SyncError};

pub type PooledConn = PooledConnection<SqliteConnectionManager>;

/// Constructed by the caller and handed to each orchestrator; the only state
/// concurrent runs share.
#[derive(Clone)]
pub struct DestinationPool {
    inner: r2d2::Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl DestinationPool {
    pub fn open(config: &DestinationConfig) -> Result<Self> {
        Self::with_options(&config.path, config.pool_size, config.busy_timeout())
    }

    pub fn with_options(path: &Path, max_size: u32, busy_timeout: Duration) -> Result<Self> {
        if max_size == 0 {
            return Err(SyncError::configuration("destination pool size must be at least 1"));
        }
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            conn.pragma_update(None, "foreign_keys", true)
        });
        let inner = r2d2::Pool::builder()
            .max_size(max_size)
            .connection_timeout(busy_timeout.max(Duration::from_secs(1)))
            .build(manager)
            .map_err(|e| SyncError::from_pool("open destination pool", e))?;
        debug!("Opened destination pool at {:?} (max {} connections)", path, max_size);
        Ok(Self {
            inner,
            path: path.to_path_buf(),
        })
    }

    /// Check out a connection. Return it (drop it) after one batch operation.
    pub fn get(&self) -> Result<PooledConn> {
        self.inner
            .get()
            .map_err(|e| SyncError::from_pool("checkout destination connection", e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn concurrent_checkout_and_return() {
        let dir = tempdir().unwrap();
        let pool =
            DestinationPool::with_options(&dir.path().join("dest.db"), 2, Duration::from_secs(2))
                .unwrap();
        pool.get()
            .unwrap()
            .execute_batch("CREATE TABLE t (n INTEGER)")
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let conn = pool.get().unwrap();
                    conn.execute("INSERT INTO t (n) VALUES (?1)", [i]).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let count: i64 = pool
            .get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn zero_size_is_configuration_error() {
        let dir = tempdir().unwrap();
        let err = DestinationPool::with_options(&dir.path().join("d.db"), 0, Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::Configuration(_)));
    }
}
