//! Schema DDL, the dataset registry, and the `meta` key/value table.

use dmgr_error::{DmgrError, Result};
use dmgr_types::{now_epoch_us, SchemaDocument, StorageScheme};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use uuid::Uuid;

/// Fixed (non-key) tables. Per-key subset columns are added separately by
/// [`crate::subsets::ensure_key_columns`].
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS datasets (
    dataset_uuid        TEXT PRIMARY KEY,
    alias               TEXT NOT NULL UNIQUE,
    created_at_epoch    INTEGER NOT NULL,
    schema_json         TEXT NOT NULL,
    schema_fingerprint  TEXT NOT NULL,
    scheme_json         TEXT NOT NULL,
    producer_id         TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS meta (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS subsets (
    subset_uuid          TEXT PRIMARY KEY,
    dataset_uuid         TEXT NOT NULL REFERENCES datasets(dataset_uuid),
    created_at_epoch     INTEGER NOT NULL,
    marked_for_deletion  INTEGER NOT NULL DEFAULT 0,
    total_rows           INTEGER NOT NULL DEFAULT 0,
    raw_keys_json        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS parts (
    part_uuid            TEXT PRIMARY KEY,
    subset_uuid          TEXT NOT NULL REFERENCES subsets(subset_uuid),
    n_rows               INTEGER NOT NULL,
    scheme_version       INTEGER NOT NULL,
    file_relpath         TEXT NOT NULL,
    content_hash         TEXT NOT NULL,
    producer_id          TEXT NOT NULL,
    batch_id             TEXT NOT NULL,
    created_at_epoch     INTEGER NOT NULL,
    part_stats_json      TEXT,
    marked_for_deletion  INTEGER NOT NULL DEFAULT 0,
    enc_version          INTEGER NOT NULL DEFAULT 0,
    key_ref              TEXT,
    nonce                BLOB,
    tag                  BLOB,
    plaintext_size       INTEGER,
    UNIQUE (subset_uuid, content_hash)
);
CREATE INDEX IF NOT EXISTS idx_parts_batch ON parts (batch_id);
CREATE INDEX IF NOT EXISTS idx_parts_live
    ON parts (subset_uuid, created_at_epoch, part_uuid)
    WHERE marked_for_deletion = 0;
CREATE TABLE IF NOT EXISTS batches (
    bid                 TEXT PRIMARY KEY,
    producer_id         TEXT NOT NULL,
    created_at_epoch    INTEGER NOT NULL,
    schema_fingerprint  TEXT NOT NULL,
    prev_hash           TEXT,
    entry_hash          TEXT
);
CREATE TABLE IF NOT EXISTS batch_parts (
    bid           TEXT NOT NULL REFERENCES batches(bid),
    part_uuid     TEXT NOT NULL,
    content_hash  TEXT NOT NULL,
    PRIMARY KEY (bid, part_uuid)
);
CREATE TABLE IF NOT EXISTS merge_log (
    producer_id      TEXT NOT NULL,
    bid              TEXT NOT NULL,
    merged_at_epoch  INTEGER NOT NULL,
    PRIMARY KEY (producer_id, bid)
);
CREATE TABLE IF NOT EXISTS tamper_cfg (
    id       INTEGER PRIMARY KEY CHECK (id = 1),
    enabled  INTEGER NOT NULL,
    salt     BLOB NOT NULL
);
";

/// Create all fixed tables. Idempotent.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// One row of the dataset registry, with the schema document and scheme
/// parsed out of their JSON columns.
#[derive(Debug, Clone)]
pub struct DatasetRow {
    pub dataset_uuid: Uuid,
    pub alias: String,
    pub created_at_epoch: i64,
    pub schema: SchemaDocument,
    pub schema_fingerprint: String,
    pub scheme: StorageScheme,
    pub producer_id: Uuid,
}

fn row_to_dataset(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, i64, String, String, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn parse_dataset(
    (uuid, alias, created, schema_json, fingerprint, scheme_json, producer): (
        String,
        String,
        i64,
        String,
        String,
        String,
        String,
    ),
) -> Result<DatasetRow> {
    Ok(DatasetRow {
        dataset_uuid: parse_uuid(&uuid)?,
        alias,
        created_at_epoch: created,
        schema: serde_json::from_str(&schema_json)?,
        schema_fingerprint: fingerprint,
        scheme: serde_json::from_str(&scheme_json)?,
        producer_id: parse_uuid(&producer)?,
    })
}

pub(crate) fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text)
        .map_err(|_| DmgrError::Corrupt(format!("malformed uuid in catalog: {text:?}")))
}

/// Fetch a dataset by alias.
pub fn get_dataset(conn: &Connection, alias: &str) -> Result<Option<DatasetRow>> {
    let found = conn
        .query_row(
            "SELECT dataset_uuid, alias, created_at_epoch, schema_json,
                    schema_fingerprint, scheme_json, producer_id
             FROM datasets WHERE alias = ?1",
            params![alias],
            row_to_dataset,
        )
        .optional()?;
    found.map(parse_dataset).transpose()
}

/// All registered datasets.
pub fn list_datasets(conn: &Connection) -> Result<Vec<DatasetRow>> {
    let mut stmt = conn.prepare(
        "SELECT dataset_uuid, alias, created_at_epoch, schema_json,
                schema_fingerprint, scheme_json, producer_id
         FROM datasets ORDER BY created_at_epoch, alias",
    )?;
    let rows = stmt.query_map([], row_to_dataset)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(parse_dataset(row?)?);
    }
    Ok(out)
}

/// Register a dataset under `alias` if absent and return its row.
///
/// An existing row wins: the stored schema document is authoritative for
/// a reopened dataset, and a caller handing in a document whose
/// fingerprint differs from the stored one gets `SchemaMismatch` (widening
/// goes through [`update_schema_doc`], never through reopening).
pub fn ensure_dataset(
    tx: &Transaction<'_>,
    alias: &str,
    doc: &SchemaDocument,
    scheme: &StorageScheme,
    accept_stored: bool,
) -> Result<DatasetRow> {
    if let Some(existing) = get_dataset(tx, alias)? {
        if !accept_stored {
            let offered = dmgr_hash::schema_fingerprint(doc)?;
            if offered != existing.schema_fingerprint {
                return Err(DmgrError::SchemaMismatch(format!(
                    "dataset {alias:?} exists with fingerprint {}, offered {offered}",
                    existing.schema_fingerprint
                )));
            }
        }
        return Ok(existing);
    }

    doc.validate()?;
    scheme.validate()?;
    let row = DatasetRow {
        dataset_uuid: Uuid::new_v4(),
        alias: alias.to_owned(),
        created_at_epoch: now_epoch_us(),
        schema: doc.clone(),
        schema_fingerprint: dmgr_hash::schema_fingerprint(doc)?,
        scheme: scheme.clone(),
        producer_id: Uuid::new_v4(),
    };
    tx.execute(
        "INSERT INTO datasets (dataset_uuid, alias, created_at_epoch, schema_json,
                               schema_fingerprint, scheme_json, producer_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            row.dataset_uuid.to_string(),
            row.alias,
            row.created_at_epoch,
            serde_json::to_string(doc)?,
            row.schema_fingerprint,
            serde_json::to_string(scheme)?,
            row.producer_id.to_string(),
        ],
    )?;
    Ok(row)
}

/// Persist a widened (or just-locked) schema document and its new
/// fingerprint. Must run in the same transaction as the batch that caused
/// the change.
pub fn update_schema_doc(
    tx: &Transaction<'_>,
    dataset_uuid: Uuid,
    doc: &SchemaDocument,
) -> Result<String> {
    let fingerprint = dmgr_hash::schema_fingerprint(doc)?;
    let updated = tx.execute(
        "UPDATE datasets SET schema_json = ?1, schema_fingerprint = ?2 WHERE dataset_uuid = ?3",
        params![
            serde_json::to_string(doc)?,
            fingerprint,
            dataset_uuid.to_string()
        ],
    )?;
    if updated != 1 {
        return Err(DmgrError::internal(format!(
            "schema update touched {updated} dataset rows"
        )));
    }
    Ok(fingerprint)
}

/// Read a `meta` value.
pub fn meta_get(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

/// Upsert a `meta` value.
pub fn meta_set(tx: &Transaction<'_>, key: &str, value: &str) -> Result<()> {
    tx.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Meta key recording whether a dataset's canonical dtype is locked.
#[must_use]
pub fn schema_locked_key(dataset_uuid: Uuid) -> String {
    format!("schema_locked:{dataset_uuid}")
}

/// Aggregate counters for one dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatasetStats {
    pub subsets: i64,
    pub live_parts: i64,
    pub total_rows: i64,
    pub batches: i64,
}

/// Count live subsets, parts, rows, and batches for a dataset.
pub fn dataset_stats(conn: &Connection, dataset_uuid: Uuid) -> Result<DatasetStats> {
    let uuid = dataset_uuid.to_string();
    let (subsets, total_rows): (i64, i64) = conn.query_row(
        "SELECT count(*), COALESCE(SUM(total_rows), 0) FROM subsets
         WHERE dataset_uuid = ?1 AND marked_for_deletion = 0",
        params![uuid],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let live_parts: i64 = conn.query_row(
        "SELECT count(*) FROM parts
         JOIN subsets USING (subset_uuid)
         WHERE subsets.dataset_uuid = ?1 AND parts.marked_for_deletion = 0",
        params![uuid],
        |row| row.get(0),
    )?;
    let batches: i64 = conn.query_row("SELECT count(*) FROM batches", [], |row| row.get(0))?;
    Ok(DatasetStats {
        subsets,
        live_parts,
        total_rows,
        batches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Catalog;
    use dmgr_types::schema_doc::{EncryptionPolicy, KeyField, PartConfig};
    use dmgr_types::KeyType;
    use std::collections::BTreeMap;

    fn doc() -> SchemaDocument {
        SchemaDocument {
            key_schema: vec![KeyField {
                name: "run".into(),
                ktype: KeyType::Integer,
            }],
            key_order: vec!["run".into()],
            dtype_descr: vec![],
            part_config: PartConfig::default(),
            quantization: BTreeMap::new(),
            jagged: BTreeMap::new(),
            encryption: EncryptionPolicy::default(),
        }
    }

    #[test]
    fn ensure_dataset_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cat = Catalog::open_rw(&dir.path().join("catalog.db")).unwrap();
        let d = doc();
        let scheme = StorageScheme::default();

        let first = cat
            .with_immediate_tx(|tx| ensure_dataset(tx, "ds", &d, &scheme, false))
            .unwrap();
        let second = cat
            .with_immediate_tx(|tx| ensure_dataset(tx, "ds", &d, &scheme, false))
            .unwrap();
        assert_eq!(first.dataset_uuid, second.dataset_uuid);
        assert_eq!(first.producer_id, second.producer_id);
        assert_eq!(list_datasets(cat.conn()).unwrap().len(), 1);
    }

    #[test]
    fn conflicting_schema_on_reopen_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cat = Catalog::open_rw(&dir.path().join("catalog.db")).unwrap();
        let scheme = StorageScheme::default();
        cat.with_immediate_tx(|tx| ensure_dataset(tx, "ds", &doc(), &scheme, false))
            .unwrap();

        let mut other = doc();
        other.key_schema.push(KeyField {
            name: "extra".into(),
            ktype: KeyType::Text,
        });
        other.key_order.push("extra".into());
        let err = cat
            .with_immediate_tx(|tx| ensure_dataset(tx, "ds", &other, &scheme, false))
            .unwrap_err();
        assert!(matches!(err, DmgrError::SchemaMismatch(_)));

        // accept_stored loads the stored document instead.
        let loaded = cat
            .with_immediate_tx(|tx| ensure_dataset(tx, "ds", &other, &scheme, true))
            .unwrap();
        assert_eq!(loaded.schema, doc());
    }

    #[test]
    fn schema_update_bumps_fingerprint() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cat = Catalog::open_rw(&dir.path().join("catalog.db")).unwrap();
        let scheme = StorageScheme::default();
        let row = cat
            .with_immediate_tx(|tx| ensure_dataset(tx, "ds", &doc(), &scheme, false))
            .unwrap();

        let mut widened = doc();
        widened.key_schema.push(KeyField {
            name: "w".into(),
            ktype: KeyType::Integer,
        });
        widened.key_order.push("w".into());
        let new_fp = cat
            .with_immediate_tx(|tx| update_schema_doc(tx, row.dataset_uuid, &widened))
            .unwrap();
        assert_ne!(new_fp, row.schema_fingerprint);

        let reloaded = get_dataset(cat.conn(), "ds").unwrap().unwrap();
        assert_eq!(reloaded.schema_fingerprint, new_fp);
    }

    #[test]
    fn meta_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cat = Catalog::open_rw(&dir.path().join("catalog.db")).unwrap();
        cat.with_immediate_tx(|tx| meta_set(tx, "k", "v1")).unwrap();
        cat.with_immediate_tx(|tx| meta_set(tx, "k", "v2")).unwrap();
        assert_eq!(meta_get(cat.conn(), "k").unwrap().as_deref(), Some("v2"));
        assert_eq!(meta_get(cat.conn(), "missing").unwrap(), None);
    }
}
