//! The crash-safe staging queue.
//!
//! Rows that outgrow a writer's in-memory buffer (or every row, in
//! durable mode) persist here before compaction. The database runs with
//! `synchronous=FULL` so an acknowledged enqueue survives power loss. A
//! compactor claims the oldest contiguous prefix of a subset's groups by
//! token, seals it into a part, and deletes the claim only after the
//! catalog transaction commits; claims of crashed writers age out and are
//! reclaimed.

pub mod payload;

use std::path::Path;
use std::time::Duration;

use dmgr_error::{DmgrError, Result};
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{debug, trace};
use uuid::Uuid;

pub use payload::StagedPayload;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS staging (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    subset_uuid          TEXT NOT NULL,
    n_rows               INTEGER NOT NULL,
    created_at_epoch_us  INTEGER NOT NULL,
    payload              BLOB NOT NULL,
    claimed_by           TEXT,
    claimed_at           INTEGER
);
CREATE INDEX IF NOT EXISTS idx_staging_subset ON staging (subset_uuid, id);
CREATE INDEX IF NOT EXISTS idx_staging_claims ON staging (claimed_by) WHERE claimed_by IS NOT NULL;
";

/// One claimed staged group.
#[derive(Debug, Clone)]
pub struct StagedGroup {
    pub id: i64,
    pub subset_uuid: Uuid,
    pub n_rows: i64,
    pub created_at_epoch_us: i64,
    pub payload: Vec<u8>,
}

/// Durable queue handle, one per dataset root (`staging.db`).
pub struct StagingQueue {
    conn: Connection,
}

impl StagingQueue {
    /// Open (creating if needed) the staging database. Durability first:
    /// WAL for concurrency, `synchronous=FULL` so enqueues are crash-proof.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;
             PRAGMA temp_store = MEMORY;",
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        debug!(path = %path.display(), "staging queue opened");
        Ok(Self { conn })
    }

    /// Persist one group. Returns its queue id.
    pub fn enqueue(
        &mut self,
        subset_uuid: Uuid,
        n_rows: i64,
        created_at_epoch_us: i64,
        payload: &[u8],
    ) -> Result<i64> {
        if n_rows <= 0 {
            return Err(DmgrError::internal("staged group must contain rows"));
        }
        self.conn.execute(
            "INSERT INTO staging (subset_uuid, n_rows, created_at_epoch_us, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![subset_uuid.to_string(), n_rows, created_at_epoch_us, payload],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Claim the oldest contiguous prefix of unclaimed groups for
    /// `subset_uuid` whose cumulative row count first meets or exceeds
    /// `part_rows`. A single oversize group stands alone. With
    /// `allow_partial` (shutdown drain), whatever is pending is claimed
    /// even below the threshold. Returns the claimed groups, oldest first;
    /// empty when there is not enough to claim.
    pub fn select_and_claim_prefix(
        &mut self,
        subset_uuid: Uuid,
        part_rows: i64,
        token: &str,
        allow_partial: bool,
        now_epoch_us: i64,
    ) -> Result<Vec<StagedGroup>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut claimed = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT id, n_rows, created_at_epoch_us, payload FROM staging
                 WHERE subset_uuid = ?1 AND claimed_by IS NULL
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![subset_uuid.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })?;

            let mut total = 0_i64;
            for row in rows {
                let (id, n_rows, created, payload) = row?;
                claimed.push(StagedGroup {
                    id,
                    subset_uuid,
                    n_rows,
                    created_at_epoch_us: created,
                    payload,
                });
                total += n_rows;
                if total >= part_rows {
                    break;
                }
            }
            if claimed.is_empty() || (total < part_rows && !allow_partial) {
                return Ok(Vec::new());
            }
        }

        for group in &claimed {
            let updated = tx.execute(
                "UPDATE staging SET claimed_by = ?1, claimed_at = ?2
                 WHERE id = ?3 AND claimed_by IS NULL",
                params![token, now_epoch_us, group.id],
            )?;
            if updated != 1 {
                return Err(DmgrError::internal(
                    "staged group claimed out from under an immediate transaction",
                ));
            }
        }
        tx.commit()?;
        trace!(
            subset = %subset_uuid,
            groups = claimed.len(),
            token,
            "claimed staging prefix"
        );
        Ok(claimed)
    }

    /// Drop a token's claimed groups after their part was published.
    pub fn delete_claimed(&mut self, token: &str) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM staging WHERE claimed_by = ?1",
            params![token],
        )?;
        Ok(removed)
    }

    /// Release a token's claims without deleting (failed seal).
    pub fn release_claim(&mut self, token: &str) -> Result<usize> {
        let released = self.conn.execute(
            "UPDATE staging SET claimed_by = NULL, claimed_at = NULL WHERE claimed_by = ?1",
            params![token],
        )?;
        Ok(released)
    }

    /// Null out claims older than the cutoff so a crashed writer's work
    /// becomes eligible again. Returns how many groups were released.
    pub fn reclaim_stale(&mut self, stale_after: Duration, now_epoch_us: i64) -> Result<usize> {
        let cutoff = now_epoch_us - (stale_after.as_micros() as i64);
        let released = self.conn.execute(
            "UPDATE staging SET claimed_by = NULL, claimed_at = NULL
             WHERE claimed_by IS NOT NULL AND claimed_at < ?1",
            params![cutoff],
        )?;
        if released > 0 {
            debug!(released, "reclaimed stale staging claims");
        }
        Ok(released)
    }

    /// Subsets with the oldest unclaimed group, oldest first. Drives the
    /// shutdown drain.
    pub fn hot_subsets(&self, limit: usize) -> Result<Vec<Uuid>> {
        let mut stmt = self.conn.prepare(
            "SELECT subset_uuid, MIN(id) AS oldest FROM staging
             WHERE claimed_by IS NULL
             GROUP BY subset_uuid ORDER BY oldest LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            let text = row?;
            out.push(Uuid::parse_str(&text).map_err(|_| {
                DmgrError::Corrupt(format!("malformed subset uuid in staging: {text:?}"))
            })?);
        }
        Ok(out)
    }

    /// Unclaimed rows pending for one subset.
    pub fn pending_rows(&self, subset_uuid: Uuid) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(SUM(n_rows), 0) FROM staging
             WHERE subset_uuid = ?1 AND claimed_by IS NULL",
            params![subset_uuid.to_string()],
            |row| row.get(0),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (tempfile::TempDir, StagingQueue) {
        let dir = tempfile::TempDir::new().unwrap();
        let q = StagingQueue::open(&dir.path().join("staging.db")).unwrap();
        (dir, q)
    }

    const SUBSET: Uuid = Uuid::from_u128(42);

    #[test]
    fn claim_waits_for_enough_rows() {
        let (_dir, mut q) = queue();
        q.enqueue(SUBSET, 30, 1, b"a").unwrap();
        q.enqueue(SUBSET, 30, 2, b"b").unwrap();

        let none = q
            .select_and_claim_prefix(SUBSET, 100, "t1", false, 10)
            .unwrap();
        assert!(none.is_empty(), "60 rows must not satisfy part_rows=100");

        q.enqueue(SUBSET, 50, 3, b"c").unwrap();
        let got = q
            .select_and_claim_prefix(SUBSET, 100, "t1", false, 10)
            .unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got.iter().map(|g| g.n_rows).sum::<i64>(), 110);
        assert_eq!(got[0].payload, b"a");
    }

    #[test]
    fn oversize_group_stands_alone() {
        let (_dir, mut q) = queue();
        q.enqueue(SUBSET, 500, 1, b"big").unwrap();
        q.enqueue(SUBSET, 10, 2, b"small").unwrap();

        let got = q
            .select_and_claim_prefix(SUBSET, 100, "t1", false, 10)
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].n_rows, 500);
        assert_eq!(q.pending_rows(SUBSET).unwrap(), 10);
    }

    #[test]
    fn claimed_groups_are_invisible_to_other_tokens() {
        let (_dir, mut q) = queue();
        q.enqueue(SUBSET, 100, 1, b"a").unwrap();
        let first = q
            .select_and_claim_prefix(SUBSET, 100, "t1", false, 10)
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = q
            .select_and_claim_prefix(SUBSET, 100, "t2", false, 11)
            .unwrap();
        assert!(second.is_empty());
        assert_eq!(q.pending_rows(SUBSET).unwrap(), 0);
    }

    #[test]
    fn delete_and_release_claims() {
        let (_dir, mut q) = queue();
        q.enqueue(SUBSET, 100, 1, b"a").unwrap();
        q.select_and_claim_prefix(SUBSET, 100, "t1", false, 10)
            .unwrap();

        assert_eq!(q.release_claim("t1").unwrap(), 1);
        assert_eq!(q.pending_rows(SUBSET).unwrap(), 100);

        q.select_and_claim_prefix(SUBSET, 100, "t2", false, 20)
            .unwrap();
        assert_eq!(q.delete_claimed("t2").unwrap(), 1);
        assert_eq!(q.pending_rows(SUBSET).unwrap(), 0);
    }

    #[test]
    fn stale_claims_are_reclaimed() {
        let (_dir, mut q) = queue();
        q.enqueue(SUBSET, 100, 1, b"a").unwrap();
        let now = 1_000_000_000_i64;
        q.select_and_claim_prefix(SUBSET, 100, "dead", false, now)
            .unwrap();

        let later = now + Duration::from_secs(301).as_micros() as i64;
        let released = q
            .reclaim_stale(Duration::from_secs(300), later)
            .unwrap();
        assert_eq!(released, 1);

        let got = q
            .select_and_claim_prefix(SUBSET, 100, "alive", false, later)
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn partial_claim_for_drain() {
        let (_dir, mut q) = queue();
        q.enqueue(SUBSET, 7, 1, b"tail").unwrap();
        let got = q
            .select_and_claim_prefix(SUBSET, 100, "drain", true, 10)
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].n_rows, 7);
    }

    #[test]
    fn hot_subsets_orders_by_oldest() {
        let (_dir, mut q) = queue();
        let other = Uuid::from_u128(7);
        q.enqueue(other, 1, 1, b"x").unwrap();
        q.enqueue(SUBSET, 1, 2, b"y").unwrap();
        assert_eq!(q.hot_subsets(10).unwrap(), vec![other, SUBSET]);
        assert_eq!(q.hot_subsets(1).unwrap(), vec![other]);
    }
}
