//! Connection management and the busy-retry transaction wrapper.

use std::path::Path;
use std::time::{Duration, Instant};

use dmgr_error::{DmgrError, Result};
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use tracing::{debug, trace};

use crate::ddl;

/// Total time budget for retrying a busy transaction.
const BUSY_RETRY_BUDGET: Duration = Duration::from_secs(5);
/// First backoff step; doubles up to [`MAX_BACKOFF`].
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(320);
/// SQLite-side busy handler timeout.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A catalog database handle. Writers get WAL + NORMAL synchronous;
/// readers are strictly read-only with `query_only` and
/// `trusted_schema=OFF`.
pub struct Catalog {
    conn: Connection,
    writable: bool,
}

impl Catalog {
    /// Open (creating if needed) a writable catalog and run DDL.
    pub fn open_rw(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA temp_store = MEMORY;",
        )?;
        ddl::init_schema(&conn)?;
        debug!(path = %path.display(), "catalog opened read-write");
        Ok(Self {
            conn,
            writable: true,
        })
    }

    /// Open an existing catalog read-only.
    pub fn open_ro(path: &Path) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA query_only = ON;
             PRAGMA trusted_schema = OFF;",
        )?;
        debug!(path = %path.display(), "catalog opened read-only");
        Ok(Self {
            conn,
            writable: false,
        })
    }

    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.writable
    }

    /// Read-side access to the raw connection.
    #[must_use]
    pub const fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside an IMMEDIATE transaction, retrying the whole closure
    /// on busy/locked with bounded exponential backoff. The closure must
    /// therefore be safe to re-run; it only ever commits once.
    pub fn with_immediate_tx<T>(
        &mut self,
        mut f: impl FnMut(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        if !self.writable {
            return Err(DmgrError::internal(
                "mutating transaction on a read-only catalog",
            ));
        }
        let deadline = Instant::now() + BUSY_RETRY_BUDGET;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let attempt: Result<T> = (|| {
                let tx = self
                    .conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)?;
                let out = f(&tx)?;
                tx.commit()?;
                Ok(out)
            })();
            match attempt {
                Ok(v) => return Ok(v),
                Err(err) if err.is_retryable_busy() => {
                    if Instant::now() + backoff > deadline {
                        return Err(DmgrError::Busy);
                    }
                    trace!(backoff_ms = backoff.as_millis() as u64, "catalog busy, backing off");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rw_initializes_schema() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("catalog.db");
        let cat = Catalog::open_rw(&path).unwrap();
        let n: i64 = cat
            .conn()
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'parts'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn read_only_refuses_mutation() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("catalog.db");
        drop(Catalog::open_rw(&path).unwrap());

        let mut ro = Catalog::open_ro(&path).unwrap();
        let err = ro.with_immediate_tx(|_| Ok(())).unwrap_err();
        assert!(matches!(err, DmgrError::Internal(_)));
        let err = ro
            .conn()
            .execute("INSERT INTO meta (key, value) VALUES ('x', 'y')", []);
        assert!(err.is_err(), "query_only must reject writes");
    }

    #[test]
    fn transaction_commits_and_rolls_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("catalog.db");
        let mut cat = Catalog::open_rw(&path).unwrap();

        cat.with_immediate_tx(|tx| {
            tx.execute("INSERT INTO meta (key, value) VALUES ('a', '1')", [])?;
            Ok(())
        })
        .unwrap();

        let failed: Result<()> = cat.with_immediate_tx(|tx| {
            tx.execute("INSERT INTO meta (key, value) VALUES ('b', '2')", [])?;
            Err(DmgrError::internal("abort on purpose"))
        });
        assert!(failed.is_err());

        let count: i64 = cat
            .conn()
            .query_row("SELECT count(*) FROM meta", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1, "rolled-back insert must not persist");
    }
}
