//! Optional tamper-evident hash chain over the change feed.
//!
//! Each recorded batch appends `entry_hash = blake2b-128(prev_hash ⧺ bid ⧺
//! sort(part_uuid ⧺ content_hash) ⧺ created_at ⧺ salt)`. The head is
//! readable for external anchoring; verification walks the feed in commit
//! order and recomputes every link.

use dmgr_error::{DmgrError, Result};
use dmgr_hash::blake2b_128_hex;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use uuid::Uuid;

use crate::ddl::{meta_get, meta_set};
use crate::parts::NewBatch;

const CHAIN_HEAD_KEY: &str = "chain_head";

/// A computed chain link.
#[derive(Debug, Clone)]
pub struct ChainEntry {
    pub prev: String,
    pub hash: String,
}

/// Enable the tamper chain for this catalog, creating a random salt on
/// first call. Disabled catalogs simply never get a `tamper_cfg` row.
pub fn enable_tamper_chain(tx: &Transaction<'_>) -> Result<()> {
    let mut salt = vec![0_u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    tx.execute(
        "INSERT OR IGNORE INTO tamper_cfg (id, enabled, salt) VALUES (1, 1, ?1)",
        params![salt],
    )?;
    tx.execute("UPDATE tamper_cfg SET enabled = 1 WHERE id = 1", [])?;
    Ok(())
}

fn chain_salt(conn: &Connection) -> Result<Option<Vec<u8>>> {
    Ok(conn
        .query_row(
            "SELECT salt FROM tamper_cfg WHERE id = 1 AND enabled = 1",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

/// Deterministic link hash: part identifiers are sorted before hashing so
/// batch membership order never matters.
#[must_use]
pub fn entry_hash(
    prev: &str,
    bid: &str,
    parts: &[(Uuid, String)],
    created_at_epoch: i64,
    salt: &[u8],
) -> String {
    let mut ids: Vec<String> = parts
        .iter()
        .map(|(part, hash)| format!("{part}{hash}"))
        .collect();
    ids.sort_unstable();

    let mut buf = Vec::with_capacity(64 + ids.len() * 64);
    buf.extend_from_slice(prev.as_bytes());
    buf.extend_from_slice(bid.as_bytes());
    for id in &ids {
        buf.extend_from_slice(id.as_bytes());
    }
    buf.extend_from_slice(created_at_epoch.to_string().as_bytes());
    buf.extend_from_slice(salt);
    blake2b_128_hex(&buf)
}

/// Extend the chain for one new batch, when enabled. Updates the stored
/// head; returns `None` when the chain is off.
pub fn extend(tx: &Transaction<'_>, batch: &NewBatch) -> Result<Option<ChainEntry>> {
    let Some(salt) = chain_salt(tx)? else {
        return Ok(None);
    };
    let prev = meta_get(tx, CHAIN_HEAD_KEY)?.unwrap_or_default();
    let hash = entry_hash(
        &prev,
        &batch.bid,
        &batch.parts,
        batch.created_at_epoch,
        &salt,
    );
    meta_set(tx, CHAIN_HEAD_KEY, &hash)?;
    Ok(Some(ChainEntry { prev, hash }))
}

/// The current chain head, for external anchoring.
pub fn chain_head(conn: &Connection) -> Result<Option<String>> {
    meta_get(conn, CHAIN_HEAD_KEY)
}

/// Verification outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub entries: usize,
    pub head: Option<String>,
    /// First batch whose recomputed hash diverges, if any.
    pub broken_at: Option<String>,
}

/// Recompute every link in commit order.
pub fn verify_chain(conn: &Connection) -> Result<ChainReport> {
    let Some(salt) = chain_salt(conn)? else {
        return Ok(ChainReport {
            entries: 0,
            head: None,
            broken_at: None,
        });
    };

    let mut stmt = conn.prepare(
        "SELECT bid, created_at_epoch, prev_hash, entry_hash FROM batches
         WHERE entry_hash IS NOT NULL ORDER BY rowid",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut prev = String::new();
    let mut entries = 0_usize;
    let mut head = None;
    for row in rows {
        let (bid, created_at, recorded_prev, recorded_hash) = row?;
        let members = crate::parts::batch_members(conn, &bid)?;
        let expected = entry_hash(&prev, &bid, &members, created_at, &salt);
        let recorded_prev = recorded_prev.unwrap_or_default();
        if recorded_prev != prev || expected != recorded_hash {
            return Ok(ChainReport {
                entries,
                head,
                broken_at: Some(bid),
            });
        }
        prev.clone_from(&recorded_hash);
        head = Some(recorded_hash);
        entries += 1;
    }

    let stored_head = chain_head(conn)?;
    if entries > 0 && stored_head != head {
        return Err(DmgrError::Corrupt(
            "chain head disagrees with last entry".to_owned(),
        ));
    }
    Ok(ChainReport {
        entries,
        head,
        broken_at: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Catalog;
    use crate::parts::record_batch;

    fn chained_catalog() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cat = Catalog::open_rw(&dir.path().join("catalog.db")).unwrap();
        cat.with_immediate_tx(|tx| enable_tamper_chain(tx)).unwrap();
        (dir, cat)
    }

    fn batch(bid: &str, parts: Vec<(Uuid, String)>) -> NewBatch {
        NewBatch {
            bid: bid.to_owned(),
            producer_id: Uuid::from_u128(9),
            created_at_epoch: 1_700_000_000_000_000,
            schema_fingerprint: "fp".to_owned(),
            parts,
        }
    }

    #[test]
    fn entry_hash_is_order_independent() {
        let a = (Uuid::from_u128(1), "aa".to_owned());
        let b = (Uuid::from_u128(2), "bb".to_owned());
        let fwd = entry_hash("", "bid", &[a.clone(), b.clone()], 1, b"salt");
        let rev = entry_hash("", "bid", &[b, a], 1, b"salt");
        assert_eq!(fwd, rev);
    }

    #[test]
    fn chain_extends_and_verifies() {
        let (_dir, mut cat) = chained_catalog();
        for i in 0..3_u32 {
            let b = batch(
                &format!("bid-{i}"),
                vec![(Uuid::from_u128(u128::from(i)), format!("hash-{i}"))],
            );
            let entry = cat.with_immediate_tx(|tx| record_batch(tx, &b)).unwrap();
            assert!(entry.is_some());
        }
        let report = verify_chain(cat.conn()).unwrap();
        assert_eq!(report.entries, 3);
        assert!(report.broken_at.is_none());
        assert_eq!(report.head, chain_head(cat.conn()).unwrap());
    }

    #[test]
    fn tampered_feed_is_detected() {
        let (_dir, mut cat) = chained_catalog();
        for i in 0..2_u32 {
            let b = batch(
                &format!("bid-{i}"),
                vec![(Uuid::from_u128(u128::from(i)), format!("hash-{i}"))],
            );
            cat.with_immediate_tx(|tx| record_batch(tx, &b)).unwrap();
        }
        cat.with_immediate_tx(|tx| {
            tx.execute(
                "UPDATE batch_parts SET content_hash = 'forged' WHERE bid = 'bid-0'",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let report = verify_chain(cat.conn()).unwrap();
        assert_eq!(report.broken_at.as_deref(), Some("bid-0"));
    }

    #[test]
    fn disabled_chain_records_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cat = Catalog::open_rw(&dir.path().join("catalog.db")).unwrap();
        let entry = cat
            .with_immediate_tx(|tx| record_batch(tx, &batch("b", vec![])))
            .unwrap();
        assert!(entry.is_none());
        let report = verify_chain(cat.conn()).unwrap();
        assert_eq!(report.entries, 0);
    }
}
