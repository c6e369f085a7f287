//! Part rows, the change feed, and the merge log.

use dmgr_error::{DmgrError, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use uuid::Uuid;

use crate::chain;
use crate::ddl::parse_uuid;

/// Everything the catalog records about one sealed part.
#[derive(Debug, Clone, PartialEq)]
pub struct PartRow {
    pub part_uuid: Uuid,
    pub subset_uuid: Uuid,
    pub n_rows: i64,
    pub scheme_version: u32,
    pub file_relpath: String,
    pub content_hash: String,
    pub producer_id: Uuid,
    pub batch_id: String,
    pub created_at_epoch: i64,
    pub part_stats_json: Option<String>,
    pub marked_for_deletion: bool,
    pub enc_version: i64,
    pub key_ref: Option<String>,
    pub nonce: Option<Vec<u8>>,
    pub tag: Option<Vec<u8>>,
    pub plaintext_size: Option<i64>,
}

/// Insert payload for [`publish_part`].
#[derive(Debug, Clone)]
pub struct NewPart {
    pub part_uuid: Uuid,
    pub subset_uuid: Uuid,
    pub n_rows: i64,
    pub scheme_version: u32,
    pub file_relpath: String,
    pub content_hash: String,
    pub producer_id: Uuid,
    pub batch_id: String,
    pub created_at_epoch: i64,
    pub part_stats_json: Option<String>,
    pub enc_version: i64,
    pub key_ref: Option<String>,
    pub nonce: Option<Vec<u8>>,
    pub tag: Option<Vec<u8>>,
    pub plaintext_size: i64,
}

/// Result of a publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Inserted,
    /// The `(subset_uuid, content_hash)` pair already exists; publication
    /// is a no-op and this is the surviving part.
    AlreadyPresent { part_uuid: Uuid },
}

/// Insert a part row. Hitting the `(subset_uuid, content_hash)` UNIQUE is
/// not an error; it reports the already-present part instead.
pub fn publish_part(tx: &Transaction<'_>, part: &NewPart) -> Result<PublishOutcome> {
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO parts (
             part_uuid, subset_uuid, n_rows, scheme_version, file_relpath,
             content_hash, producer_id, batch_id, created_at_epoch,
             part_stats_json, marked_for_deletion, enc_version, key_ref,
             nonce, tag, plaintext_size)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?12, ?13, ?14, ?15)",
        params![
            part.part_uuid.to_string(),
            part.subset_uuid.to_string(),
            part.n_rows,
            part.scheme_version,
            part.file_relpath,
            part.content_hash,
            part.producer_id.to_string(),
            part.batch_id,
            part.created_at_epoch,
            part.part_stats_json,
            part.enc_version,
            part.key_ref,
            part.nonce,
            part.tag,
            part.plaintext_size,
        ],
    )?;
    if inserted == 1 {
        return Ok(PublishOutcome::Inserted);
    }
    let existing: String = tx.query_row(
        "SELECT part_uuid FROM parts WHERE subset_uuid = ?1 AND content_hash = ?2",
        params![part.subset_uuid.to_string(), part.content_hash],
        |row| row.get(0),
    )?;
    Ok(PublishOutcome::AlreadyPresent {
        part_uuid: parse_uuid(&existing)?,
    })
}

/// One change-feed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRow {
    pub bid: String,
    pub producer_id: Uuid,
    pub created_at_epoch: i64,
    pub schema_fingerprint: String,
    pub prev_hash: Option<String>,
    pub entry_hash: Option<String>,
}

/// Payload for [`record_batch`].
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub bid: String,
    pub producer_id: Uuid,
    pub created_at_epoch: i64,
    pub schema_fingerprint: String,
    /// `(part_uuid, content_hash)` membership.
    pub parts: Vec<(Uuid, String)>,
}

/// Record one committed batch in the change feed, extending the tamper
/// chain when it is enabled. Returns the entry hash, if chained.
pub fn record_batch(tx: &Transaction<'_>, batch: &NewBatch) -> Result<Option<String>> {
    let entry = chain::extend(tx, batch)?;
    tx.execute(
        "INSERT INTO batches (bid, producer_id, created_at_epoch, schema_fingerprint,
                              prev_hash, entry_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            batch.bid,
            batch.producer_id.to_string(),
            batch.created_at_epoch,
            batch.schema_fingerprint,
            entry.as_ref().map(|e| e.prev.clone()),
            entry.as_ref().map(|e| e.hash.clone()),
        ],
    )?;
    for (part_uuid, content_hash) in &batch.parts {
        tx.execute(
            "INSERT INTO batch_parts (bid, part_uuid, content_hash) VALUES (?1, ?2, ?3)",
            params![batch.bid, part_uuid.to_string(), content_hash],
        )?;
    }
    Ok(entry.map(|e| e.hash))
}

fn row_to_part(row: &rusqlite::Row<'_>) -> rusqlite::Result<PartRow> {
    Ok(PartRow {
        part_uuid: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        subset_uuid: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
        n_rows: row.get(2)?,
        scheme_version: row.get(3)?,
        file_relpath: row.get(4)?,
        content_hash: row.get(5)?,
        producer_id: Uuid::parse_str(&row.get::<_, String>(6)?).unwrap_or_default(),
        batch_id: row.get(7)?,
        created_at_epoch: row.get(8)?,
        part_stats_json: row.get(9)?,
        marked_for_deletion: row.get::<_, i64>(10)? != 0,
        enc_version: row.get(11)?,
        key_ref: row.get(12)?,
        nonce: row.get(13)?,
        tag: row.get(14)?,
        plaintext_size: row.get(15)?,
    })
}

const PART_COLUMNS: &str = "part_uuid, subset_uuid, n_rows, scheme_version, file_relpath,
     content_hash, producer_id, batch_id, created_at_epoch, part_stats_json,
     marked_for_deletion, enc_version, key_ref, nonce, tag, plaintext_size";

/// Look up a part by its dedup identity.
pub fn part_by_hash(
    conn: &Connection,
    subset_uuid: Uuid,
    content_hash: &str,
) -> Result<Option<PartRow>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {PART_COLUMNS} FROM parts WHERE subset_uuid = ?1 AND content_hash = ?2"
            ),
            params![subset_uuid.to_string(), content_hash],
            row_to_part,
        )
        .optional()?)
}

/// Parts of one subset in publication order.
pub fn parts_of_subset(
    conn: &Connection,
    subset_uuid: Uuid,
    live_only: bool,
) -> Result<Vec<PartRow>> {
    let sql = if live_only {
        format!(
            "SELECT {PART_COLUMNS} FROM parts
             WHERE subset_uuid = ?1 AND marked_for_deletion = 0
             ORDER BY created_at_epoch, part_uuid"
        )
    } else {
        format!(
            "SELECT {PART_COLUMNS} FROM parts WHERE subset_uuid = ?1
             ORDER BY created_at_epoch, part_uuid"
        )
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![subset_uuid.to_string()], row_to_part)?;
    collect_parts(rows)
}

/// Parts of one batch.
pub fn parts_of_batch(conn: &Connection, bid: &str) -> Result<Vec<PartRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PART_COLUMNS} FROM parts WHERE batch_id = ?1 ORDER BY created_at_epoch, part_uuid"
    ))?;
    let rows = stmt.query_map(params![bid], row_to_part)?;
    collect_parts(rows)
}

/// Every part row in the catalog.
pub fn all_parts(conn: &Connection) -> Result<Vec<PartRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PART_COLUMNS} FROM parts ORDER BY created_at_epoch, part_uuid"
    ))?;
    let rows = stmt.query_map([], row_to_part)?;
    collect_parts(rows)
}

/// Parts soft-deleted and awaiting GC.
pub fn marked_parts(conn: &Connection) -> Result<Vec<PartRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PART_COLUMNS} FROM parts WHERE marked_for_deletion = 1"
    ))?;
    let rows = stmt.query_map([], row_to_part)?;
    collect_parts(rows)
}

fn collect_parts(
    rows: impl Iterator<Item = rusqlite::Result<PartRow>>,
) -> Result<Vec<PartRow>> {
    let mut out = Vec::new();
    for row in rows {
        let part = row?;
        if part.part_uuid.is_nil() {
            return Err(DmgrError::Corrupt("malformed part uuid in catalog".to_owned()));
        }
        out.push(part);
    }
    Ok(out)
}

/// Soft-delete one part.
pub fn mark_part_deleted(tx: &Transaction<'_>, part_uuid: Uuid) -> Result<()> {
    tx.execute(
        "UPDATE parts SET marked_for_deletion = 1 WHERE part_uuid = ?1",
        params![part_uuid.to_string()],
    )?;
    Ok(())
}

/// Hard-delete one part row (GC commit path).
pub fn delete_part_row(tx: &Transaction<'_>, part_uuid: Uuid) -> Result<()> {
    tx.execute(
        "DELETE FROM parts WHERE part_uuid = ?1",
        params![part_uuid.to_string()],
    )?;
    Ok(())
}

/// Change feed in commit order.
pub fn list_batches(conn: &Connection) -> Result<Vec<BatchRow>> {
    let mut stmt = conn.prepare(
        "SELECT bid, producer_id, created_at_epoch, schema_fingerprint, prev_hash, entry_hash
         FROM batches ORDER BY rowid",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (bid, producer, created, fingerprint, prev, entry) = row?;
        out.push(BatchRow {
            bid,
            producer_id: parse_uuid(&producer)?,
            created_at_epoch: created,
            schema_fingerprint: fingerprint,
            prev_hash: prev,
            entry_hash: entry,
        });
    }
    Ok(out)
}

/// `(part_uuid, content_hash)` membership of one batch, from the feed.
pub fn batch_members(conn: &Connection, bid: &str) -> Result<Vec<(Uuid, String)>> {
    let mut stmt = conn.prepare(
        "SELECT part_uuid, content_hash FROM batch_parts WHERE bid = ?1 ORDER BY part_uuid",
    )?;
    let rows = stmt.query_map(params![bid], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (part, hash) = row?;
        out.push((parse_uuid(&part)?, hash));
    }
    Ok(out)
}

/// Whether `(producer_id, bid)` was already applied locally.
pub fn merge_log_contains(conn: &Connection, producer_id: Uuid, bid: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM merge_log WHERE producer_id = ?1 AND bid = ?2",
            params![producer_id.to_string(), bid],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Record a replayed batch in the merge log.
pub fn record_merge(
    tx: &Transaction<'_>,
    producer_id: Uuid,
    bid: &str,
    merged_at_epoch: i64,
) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO merge_log (producer_id, bid, merged_at_epoch)
         VALUES (?1, ?2, ?3)",
        params![producer_id.to_string(), bid, merged_at_epoch],
    )?;
    Ok(())
}
