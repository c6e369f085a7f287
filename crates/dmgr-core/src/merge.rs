//! Idempotent catalog-to-catalog replication.
//!
//! Replays the source change feed into the destination, batch by batch,
//! each in one destination transaction. `(producer_id, bid)` pairs in the
//! merge log make replays no-ops; `(subset_uuid, content_hash)` makes
//! duplicate parts no-ops. A committed batch is durable; an uncommitted
//! one leaves the destination unchanged.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use dmgr_catalog::parts::{
    batch_members, list_batches, merge_log_contains, parts_of_batch, part_by_hash, publish_part,
    record_batch, record_merge, NewBatch, NewPart, PartRow,
};
use dmgr_catalog::subsets::{add_rows, ensure_key_columns, get_or_create_subset, subset_by_uuid};
use dmgr_catalog::{ddl, Catalog, DatasetRow};
use dmgr_error::{DmgrError, Result};
use dmgr_hash::content_hash_with_spec;
use dmgr_identity::{raw_keys_from_json, KeyNormalizer, NormalizedKeys};
use dmgr_store::{dataset_lock_path, part_relpath, read_part, Lease};
use dmgr_types::now_epoch_us;
use tracing::{debug, info, warn};

/// How part bytes travel from source to destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyMode {
    /// Hardlink; fails across filesystems.
    Hardlink,
    /// Byte copy through a tmp sibling.
    Copy,
    /// Try a hardlink, fall back to a byte copy.
    #[default]
    Auto,
}

/// Merge knobs.
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub copy_mode: CopyMode,
    /// Re-hash every copied file against the recorded content hash.
    pub verify_hash: bool,
    /// On schema/scheme/quantization/encryption mismatch, create a fork
    /// dataset in the destination instead of failing.
    pub allow_schema_mismatch: bool,
    /// Plan only; write nothing.
    pub dry_run: bool,
}

/// What a merge did (or would do, under `dry_run`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeReport {
    pub batches_applied: usize,
    pub parts_copied: usize,
    pub parts_skipped: usize,
    pub forked_alias: Option<String>,
    /// True for a dry run.
    pub planned: bool,
}

/// Replay dataset `alias` from `src_root` into `dst_root`.
pub fn merge_local(
    src_root: &Path,
    dst_root: &Path,
    alias: &str,
    opts: &MergeOptions,
) -> Result<MergeReport> {
    let src_cat = Catalog::open_ro(&src_root.join("catalog.db"))?;
    let src_ds = ddl::get_dataset(src_cat.conn(), alias)?.ok_or_else(|| {
        DmgrError::MergeInvariantViolated(format!("source has no dataset {alias:?}"))
    })?;

    fs::create_dir_all(dst_root)?;
    let _dst_lease = Lease::acquire(&dataset_lock_path(&dst_root.join("locks"), alias))?;
    let mut dst_cat = Catalog::open_rw(&dst_root.join("catalog.db"))?;

    let (target, forked_alias) = resolve_target(&mut dst_cat, alias, &src_ds, opts)?;

    let mut unmerged: Vec<_> = list_batches(src_cat.conn())?
        .into_iter()
        .filter(|b| {
            !merge_log_contains(dst_cat.conn(), b.producer_id, &b.bid).unwrap_or(false)
        })
        .collect();
    unmerged.sort_by_key(|b| (b.created_at_epoch, b.bid.clone()));
    debug!(alias, unmerged = unmerged.len(), "merge plan computed");

    let normalizer = KeyNormalizer::new(&target.schema);
    let mut report = MergeReport {
        forked_alias,
        planned: opts.dry_run,
        ..MergeReport::default()
    };

    for batch in unmerged {
        let src_parts = parts_of_batch(src_cat.conn(), &batch.bid)?;
        let members = batch_members(src_cat.conn(), &batch.bid)?;

        // Resolve identities outside the transaction; it is pure work.
        let mut resolved: Vec<(PartRow, NormalizedKeys)> = Vec::with_capacity(src_parts.len());
        for part in src_parts {
            let subset = subset_by_uuid(src_cat.conn(), part.subset_uuid)?.ok_or_else(|| {
                DmgrError::Corrupt(format!(
                    "source part {} references unknown subset",
                    part.part_uuid
                ))
            })?;
            let keys = raw_keys_from_json(&src_ds.schema, &subset.raw_keys_json)?;
            let nk = normalizer.normalize(&keys)?;
            if nk.subset_uuid != part.subset_uuid {
                return Err(DmgrError::IdentityConflict(format!(
                    "source subset {} does not re-derive from its raw keys",
                    part.subset_uuid
                )));
            }
            resolved.push((part, nk));
        }

        if opts.dry_run {
            for (part, _) in &resolved {
                if part_by_hash(dst_cat.conn(), part.subset_uuid, &part.content_hash)?.is_some() {
                    report.parts_skipped += 1;
                } else {
                    report.parts_copied += 1;
                }
            }
            report.batches_applied += 1;
            continue;
        }

        let batch_row = batch.clone();
        let target_uuid = target.dataset_uuid;
        let target_scheme = target.scheme.clone();
        let target_fingerprint = target.schema_fingerprint.clone();
        let (copied, skipped) = dst_cat.with_immediate_tx(|tx| {
            let mut copied = 0_usize;
            let mut skipped = 0_usize;
            for (part, nk) in &resolved {
                get_or_create_subset(tx, target_uuid, nk, part.created_at_epoch)?;
                if part_by_hash(tx, part.subset_uuid, &part.content_hash)?.is_some() {
                    skipped += 1;
                    continue;
                }
                let relpath =
                    part_relpath(&target_scheme, part.subset_uuid, part.part_uuid)?;
                let src_file = src_root.join(&part.file_relpath);
                let dst_file = dst_root.join(&relpath);
                materialize(&src_file, &dst_file, opts.copy_mode)?;
                if opts.verify_hash {
                    verify_copied(&dst_file, &part.content_hash)?;
                }
                publish_part(
                    tx,
                    &NewPart {
                        part_uuid: part.part_uuid,
                        subset_uuid: part.subset_uuid,
                        n_rows: part.n_rows,
                        scheme_version: target_scheme.version,
                        file_relpath: relpath,
                        content_hash: part.content_hash.clone(),
                        producer_id: part.producer_id,
                        batch_id: batch_row.bid.clone(),
                        created_at_epoch: part.created_at_epoch,
                        part_stats_json: part.part_stats_json.clone(),
                        enc_version: part.enc_version,
                        key_ref: part.key_ref.clone(),
                        nonce: part.nonce.clone(),
                        tag: part.tag.clone(),
                        plaintext_size: part.plaintext_size.unwrap_or(0),
                    },
                )?;
                add_rows(tx, part.subset_uuid, part.n_rows)?;
                copied += 1;
            }
            record_batch(
                tx,
                &NewBatch {
                    bid: batch_row.bid.clone(),
                    producer_id: batch_row.producer_id,
                    created_at_epoch: batch_row.created_at_epoch,
                    schema_fingerprint: target_fingerprint.clone(),
                    parts: members.clone(),
                },
            )?;
            record_merge(tx, batch_row.producer_id, &batch_row.bid, now_epoch_us())?;
            Ok((copied, skipped))
        })?;

        report.parts_copied += copied;
        report.parts_skipped += skipped;
        report.batches_applied += 1;
    }

    info!(
        alias,
        batches = report.batches_applied,
        copied = report.parts_copied,
        skipped = report.parts_skipped,
        dry_run = report.planned,
        "merge finished"
    );
    Ok(report)
}

/// Pick (or create) the destination dataset row, forking on mismatch when
/// allowed.
fn resolve_target(
    dst_cat: &mut Catalog,
    alias: &str,
    src_ds: &DatasetRow,
    opts: &MergeOptions,
) -> Result<(DatasetRow, Option<String>)> {
    let existing = ddl::get_dataset(dst_cat.conn(), alias)?;
    let Some(dst_ds) = existing else {
        // Fresh destination: adopt the source schema wholesale. A dry run
        // plans against the source row without writing anything.
        if opts.dry_run {
            return Ok((src_ds.clone(), None));
        }
        let src_schema = src_ds.schema.clone();
        let src_scheme = src_ds.scheme.clone();
        let row = dst_cat.with_immediate_tx(|tx| {
            let row = ddl::ensure_dataset(tx, alias, &src_schema, &src_scheme, true)?;
            ensure_key_columns(tx, &row.schema)?;
            Ok(row)
        })?;
        return Ok((row, None));
    };

    let mismatch = invariant_mismatch(src_ds, &dst_ds);
    let Some(reason) = mismatch else {
        return Ok((dst_ds, None));
    };
    if !opts.allow_schema_mismatch {
        return Err(DmgrError::MergeInvariantViolated(reason));
    }

    let fork_alias = format!(
        "{alias}-fork-{}",
        &src_ds.producer_id.to_string()[..8]
    );
    warn!(alias, fork = %fork_alias, reason, "schema mismatch, merging into fork");
    if opts.dry_run {
        return Ok((src_ds.clone(), Some(fork_alias)));
    }
    let src_schema = src_ds.schema.clone();
    let src_scheme = src_ds.scheme.clone();
    let fork_alias_arg = fork_alias.clone();
    let row = dst_cat.with_immediate_tx(move |tx| {
        let row = ddl::ensure_dataset(tx, &fork_alias_arg, &src_schema, &src_scheme, true)?;
        ensure_key_columns(tx, &row.schema)?;
        Ok(row)
    })?;
    Ok((row, Some(fork_alias)))
}

/// First mismatching merge invariant, if any.
fn invariant_mismatch(src: &DatasetRow, dst: &DatasetRow) -> Option<String> {
    if src.schema_fingerprint != dst.schema_fingerprint {
        return Some(format!(
            "schema fingerprint {} != {}",
            src.schema_fingerprint, dst.schema_fingerprint
        ));
    }
    if src.scheme.version != dst.scheme.version {
        return Some(format!(
            "storage scheme version {} != {}",
            src.scheme.version, dst.scheme.version
        ));
    }
    if src.schema.quantization != dst.schema.quantization {
        return Some("quantization maps differ".to_owned());
    }
    if src.schema.encryption != dst.schema.encryption {
        return Some("encryption policies differ".to_owned());
    }
    None
}

/// Bring the part bytes across. Safe to re-run: an already-materialized
/// destination is accepted as-is.
fn materialize(src: &Path, dst: &Path, mode: CopyMode) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    if dst.exists() {
        return Ok(());
    }
    match mode {
        CopyMode::Hardlink => link_file(src, dst),
        CopyMode::Copy => copy_file(src, dst),
        CopyMode::Auto => link_file(src, dst).or_else(|_| copy_file(src, dst)),
    }
}

fn link_file(src: &Path, dst: &Path) -> Result<()> {
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Byte copy with the same tmp → fsync → rename discipline as a seal.
fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    let tmp: PathBuf = dst.with_extension("h5.tmp");
    let result = (|| -> Result<()> {
        fs::copy(src, &tmp)?;
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, dst)?;
        if let Some(parent) = dst.parent() {
            fs::File::open(parent)?.sync_all()?;
        }
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Recompute a copied file's content hash from its own embedded specs.
fn verify_copied(path: &Path, expected: &str) -> Result<()> {
    let (attrs, block) = read_part(path)?;
    let actual = content_hash_with_spec(&block, &attrs.dtype_descr, &attrs.jagged)?;
    if actual != expected {
        return Err(DmgrError::ContentHashMismatch {
            expected: expected.to_owned(),
            actual,
        });
    }
    Ok(())
}

/// Keys parsed back from a raw snapshot, for reuse by callers that plan
/// merges themselves.
pub fn snapshot_keys(
    ds: &DatasetRow,
    raw_keys_json: &str,
) -> Result<BTreeMap<String, dmgr_types::KeyValue>> {
    raw_keys_from_json(&ds.schema, raw_keys_json)
}
