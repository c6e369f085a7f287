//! Subset rows: dynamic identity columns, creation, and lookup.
//!
//! Each key in `key_order` contributes a raw column (REAL/INTEGER/TEXT)
//! and, for REAL keys, derived `<k>_s` / `<k>_q` identity columns. The
//! composite UNIQUE index over the identity columns is what enforces "two
//! subsets cannot share an identity tuple". Raw REAL specials store as
//! NULL (SQLite has no NaN), which also keeps them out of BETWEEN ranges.

use std::collections::BTreeSet;

use dmgr_error::{DmgrError, Result};
use dmgr_identity::{classify_real, quantize, KeyIdentityCol, NormalizedKeys, SpecialClass};
use dmgr_types::{KeyType, KeyValue, SchemaDocument};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::ddl::parse_uuid;

/// Columns fixed by the DDL; key names may not collide with them.
const RESERVED_COLUMNS: &[&str] = &[
    "subset_uuid",
    "dataset_uuid",
    "created_at_epoch",
    "marked_for_deletion",
    "total_rows",
    "raw_keys_json",
];

fn quoted(name: &str) -> String {
    format!("\"{name}\"")
}

/// Identity column names for one key, in identity-tuple order.
fn identity_columns(name: &str, ktype: KeyType) -> Vec<String> {
    match ktype {
        KeyType::Real => vec![format!("{name}_s"), format!("{name}_q")],
        KeyType::Integer | KeyType::Text | KeyType::Boolean => vec![name.to_owned()],
    }
}

/// Add raw and `_s`/`_q` columns for every declared key and create the
/// composite UNIQUE identity index. Idempotent ALTERs.
pub fn ensure_key_columns(tx: &Transaction<'_>, doc: &SchemaDocument) -> Result<()> {
    let mut existing = BTreeSet::new();
    {
        let mut stmt = tx.prepare("SELECT name FROM pragma_table_info('subsets')")?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for name in names {
            existing.insert(name?);
        }
    }

    let mut index_cols = vec!["dataset_uuid".to_owned()];
    for key_name in &doc.key_order {
        let field = doc
            .key_field(key_name)
            .ok_or_else(|| DmgrError::internal("key_order names undeclared key"))?;
        if RESERVED_COLUMNS.contains(&key_name.as_str()) {
            return Err(DmgrError::InvalidKeyValue(format!(
                "key name {key_name:?} collides with a reserved column"
            )));
        }
        let mut wanted: Vec<(String, &str)> = match field.ktype {
            KeyType::Real => vec![
                (key_name.clone(), "REAL"),
                (format!("{key_name}_s"), "INTEGER"),
                (format!("{key_name}_q"), "INTEGER"),
            ],
            KeyType::Integer | KeyType::Boolean => vec![(key_name.clone(), "INTEGER")],
            KeyType::Text => vec![(key_name.clone(), "TEXT")],
        };
        for (col, sql_type) in wanted.drain(..) {
            if doc.key_field(&col).is_some() && col != *key_name {
                return Err(DmgrError::InvalidKeyValue(format!(
                    "derived column {col:?} collides with a declared key"
                )));
            }
            if !existing.contains(&col) {
                tx.execute(
                    &format!("ALTER TABLE subsets ADD COLUMN {} {sql_type}", quoted(&col)),
                    [],
                )?;
                existing.insert(col);
            }
        }
        index_cols.extend(identity_columns(key_name, field.ktype).iter().map(|c| quoted(c)));
    }

    // Datasets with different key schemas share this table (merge forks),
    // so the index name must be specific to its column list.
    let column_list = index_cols.join(", ");
    let index_name = format!(
        "idx_subsets_identity_{}",
        &dmgr_hash::blake2b_128_hex(column_list.as_bytes())[..12]
    );
    tx.execute(
        &format!("CREATE UNIQUE INDEX IF NOT EXISTS {index_name} ON subsets ({column_list})"),
        [],
    )?;
    Ok(())
}

/// Summary row returned by lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsetSummary {
    pub subset_uuid: Uuid,
    pub created_at_epoch: i64,
    pub marked_for_deletion: bool,
    pub total_rows: i64,
    pub raw_keys_json: String,
}

/// INSERT OR IGNORE followed by an identity check. Returns whether the
/// subset was created by this call.
///
/// Distinct raw REAL values collapsing onto one quantized identity are
/// intentional and keep the first-seen snapshot; a stored row whose
/// identity columns disagree with the offered tuple is an
/// `IdentityConflict` (digest collision or catalog tampering).
pub fn get_or_create_subset(
    tx: &Transaction<'_>,
    dataset_uuid: Uuid,
    nk: &NormalizedKeys,
    created_at_epoch: i64,
) -> Result<bool> {
    let mut columns = vec![
        "subset_uuid".to_owned(),
        "dataset_uuid".to_owned(),
        "created_at_epoch".to_owned(),
        "raw_keys_json".to_owned(),
    ];
    let mut values: Vec<Value> = vec![
        Value::Text(nk.subset_uuid.to_string()),
        Value::Text(dataset_uuid.to_string()),
        Value::Integer(created_at_epoch),
        Value::Text(nk.raw_keys_json()?),
    ];
    for col in &nk.cols {
        match col {
            KeyIdentityCol::Real { name, raw, s, q } => {
                columns.push(quoted(name));
                values.push(if raw.is_finite() {
                    Value::Real(*raw)
                } else {
                    Value::Null
                });
                columns.push(quoted(&format!("{name}_s")));
                values.push(Value::Integer(*s));
                columns.push(quoted(&format!("{name}_q")));
                values.push(Value::Integer(*q));
            }
            KeyIdentityCol::Integer { name, v } => {
                columns.push(quoted(name));
                values.push(Value::Integer(*v));
            }
            KeyIdentityCol::Boolean { name, v } => {
                columns.push(quoted(name));
                values.push(Value::Integer(i64::from(*v)));
            }
            KeyIdentityCol::Text { name, v } => {
                columns.push(quoted(name));
                values.push(Value::Text(v.clone()));
            }
        }
    }

    let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT OR IGNORE INTO subsets ({}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    );
    let created = tx.execute(&sql, rusqlite::params_from_iter(values))? == 1;

    if !created {
        verify_stored_identity(tx, nk)?;
    }
    Ok(created)
}

/// Compare the stored identity columns of `nk.subset_uuid` against the
/// offered tuple.
fn verify_stored_identity(tx: &Transaction<'_>, nk: &NormalizedKeys) -> Result<()> {
    for col in &nk.cols {
        let (names, expected): (Vec<String>, Vec<Value>) = match col {
            KeyIdentityCol::Real { name, s, q, .. } => (
                vec![format!("{name}_s"), format!("{name}_q")],
                vec![Value::Integer(*s), Value::Integer(*q)],
            ),
            KeyIdentityCol::Integer { name, v } => {
                (vec![name.clone()], vec![Value::Integer(*v)])
            }
            KeyIdentityCol::Boolean { name, v } => {
                (vec![name.clone()], vec![Value::Integer(i64::from(*v))])
            }
            KeyIdentityCol::Text { name, v } => (vec![name.clone()], vec![Value::Text(v.clone())]),
        };
        for (col_name, want) in names.iter().zip(expected) {
            let got: Value = tx.query_row(
                &format!(
                    "SELECT {} FROM subsets WHERE subset_uuid = ?1",
                    quoted(col_name)
                ),
                params![nk.subset_uuid.to_string()],
                |row| row.get(0),
            )?;
            if got != want {
                return Err(DmgrError::IdentityConflict(format!(
                    "subset {} column {col_name} stored {got:?}, offered {want:?}",
                    nk.subset_uuid
                )));
            }
        }
    }
    Ok(())
}

/// Load one subset summary.
pub fn subset_by_uuid(conn: &Connection, subset_uuid: Uuid) -> Result<Option<SubsetSummary>> {
    conn.query_row(
        "SELECT subset_uuid, created_at_epoch, marked_for_deletion, total_rows, raw_keys_json
         FROM subsets WHERE subset_uuid = ?1",
        params![subset_uuid.to_string()],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        },
    )
    .optional()?
    .map(|(uuid, created, marked, rows, raw)| {
        Ok(SubsetSummary {
            subset_uuid: parse_uuid(&uuid)?,
            created_at_epoch: created,
            marked_for_deletion: marked != 0,
            total_rows: rows,
            raw_keys_json: raw,
        })
    })
    .transpose()
}

/// Lookup filters. Equality on REAL keys goes through the `_s`/`_q`
/// identity columns; ranges use the raw column (NaN and infinities are
/// excluded by their NULL storage).
#[derive(Debug, Clone)]
pub enum SubsetFilter {
    KeyEq { name: String, value: KeyValue },
    KeyRange { name: String, lo: f64, hi: f64 },
    CreatedBetween { lo_us: i64, hi_us: i64 },
    IncludeDeleted,
}

/// Query subsets of one dataset.
pub fn find_subsets(
    conn: &Connection,
    dataset_uuid: Uuid,
    doc: &SchemaDocument,
    filters: &[SubsetFilter],
) -> Result<Vec<SubsetSummary>> {
    let mut clauses = vec!["dataset_uuid = ?".to_owned()];
    let mut binds: Vec<Value> = vec![Value::Text(dataset_uuid.to_string())];
    let mut include_deleted = false;

    for filter in filters {
        match filter {
            SubsetFilter::IncludeDeleted => include_deleted = true,
            SubsetFilter::CreatedBetween { lo_us, hi_us } => {
                clauses.push("created_at_epoch BETWEEN ? AND ?".to_owned());
                binds.push(Value::Integer(*lo_us));
                binds.push(Value::Integer(*hi_us));
            }
            SubsetFilter::KeyRange { name, lo, hi } => {
                let field = known_key(doc, name)?;
                if field.ktype != KeyType::Real {
                    return Err(DmgrError::InvalidKeyValue(format!(
                        "range filter on non-REAL key {name:?}"
                    )));
                }
                clauses.push(format!("{} BETWEEN ? AND ?", quoted(name)));
                binds.push(Value::Real(*lo));
                binds.push(Value::Real(*hi));
            }
            SubsetFilter::KeyEq { name, value } => {
                let field = known_key(doc, name)?;
                if value.key_type() != field.ktype {
                    return Err(DmgrError::InvalidKeyValue(format!(
                        "equality filter on {name:?} has type {}, key is {}",
                        value.key_type().name(),
                        field.ktype.name()
                    )));
                }
                match value {
                    KeyValue::Real(v) => {
                        let class = classify_real(*v);
                        if class == SpecialClass::Normal {
                            let scale =
                                doc.quantization.get(name).copied().ok_or_else(|| {
                                    DmgrError::InvalidKeyValue(format!(
                                        "REAL key {name:?} has no quantization scale"
                                    ))
                                })?;
                            clauses.push(format!(
                                "{} = 0 AND {} = ?",
                                quoted(&format!("{name}_s")),
                                quoted(&format!("{name}_q"))
                            ));
                            binds.push(Value::Integer(quantize(*v, scale)?));
                        } else {
                            clauses.push(format!("{} = ?", quoted(&format!("{name}_s"))));
                            binds.push(Value::Integer(class.code()));
                        }
                    }
                    KeyValue::Integer(v) => {
                        clauses.push(format!("{} = ?", quoted(name)));
                        binds.push(Value::Integer(*v));
                    }
                    KeyValue::Boolean(b) => {
                        clauses.push(format!("{} = ?", quoted(name)));
                        binds.push(Value::Integer(i64::from(*b)));
                    }
                    KeyValue::Text(s) => {
                        clauses.push(format!("{} = ?", quoted(name)));
                        binds.push(Value::Text(s.nfc().collect()));
                    }
                }
            }
        }
    }
    if !include_deleted {
        clauses.push("marked_for_deletion = 0".to_owned());
    }

    let sql = format!(
        "SELECT subset_uuid, created_at_epoch, marked_for_deletion, total_rows, raw_keys_json
         FROM subsets WHERE {} ORDER BY created_at_epoch, subset_uuid",
        clauses.join(" AND ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(binds), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (uuid, created, marked, total, raw) = row?;
        out.push(SubsetSummary {
            subset_uuid: parse_uuid(&uuid)?,
            created_at_epoch: created,
            marked_for_deletion: marked != 0,
            total_rows: total,
            raw_keys_json: raw,
        });
    }
    Ok(out)
}

fn known_key<'d>(
    doc: &'d SchemaDocument,
    name: &str,
) -> Result<&'d dmgr_types::schema_doc::KeyField> {
    doc.key_field(name).ok_or_else(|| {
        DmgrError::InvalidKeyValue(format!("filter names undeclared key {name:?}"))
    })
}

/// Soft-delete one subset.
pub fn mark_subset_deleted(tx: &Transaction<'_>, subset_uuid: Uuid) -> Result<()> {
    tx.execute(
        "UPDATE subsets SET marked_for_deletion = 1 WHERE subset_uuid = ?1",
        params![subset_uuid.to_string()],
    )?;
    Ok(())
}

/// Bump a subset's `total_rows` by `delta`.
pub fn add_rows(tx: &Transaction<'_>, subset_uuid: Uuid, delta: i64) -> Result<()> {
    tx.execute(
        "UPDATE subsets SET total_rows = total_rows + ?1 WHERE subset_uuid = ?2",
        params![delta, subset_uuid.to_string()],
    )?;
    Ok(())
}

/// Recompute `total_rows` from live parts for every subset; returns how
/// many rows changed. Used by GC and fsck.
pub fn reconcile_total_rows(tx: &Transaction<'_>) -> Result<usize> {
    let changed = tx.execute(
        "UPDATE subsets SET total_rows = (
             SELECT COALESCE(SUM(n_rows), 0) FROM parts
             WHERE parts.subset_uuid = subsets.subset_uuid
               AND parts.marked_for_deletion = 0
         )
         WHERE total_rows <> (
             SELECT COALESCE(SUM(n_rows), 0) FROM parts
             WHERE parts.subset_uuid = subsets.subset_uuid
               AND parts.marked_for_deletion = 0
         )",
        [],
    )?;
    Ok(changed)
}

/// Delete soft-deleted subsets that no longer own any parts. Returns how
/// many were removed.
pub fn drop_empty_deleted_subsets(tx: &Transaction<'_>) -> Result<usize> {
    let removed = tx.execute(
        "DELETE FROM subsets
         WHERE marked_for_deletion = 1
           AND NOT EXISTS (SELECT 1 FROM parts WHERE parts.subset_uuid = subsets.subset_uuid)",
        [],
    )?;
    Ok(removed)
}
