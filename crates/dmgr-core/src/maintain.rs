//! GC and fsck: reconciling the catalog with the files on disk.
//!
//! Both run under the dataset lease the handle already holds, so they are
//! exclusive against every writer of this root.

use std::fs;
use std::path::{Path, PathBuf};

use dmgr_catalog::parts::{
    all_parts, delete_part_row, mark_part_deleted, marked_parts, publish_part, record_batch,
    NewBatch, NewPart, PublishOutcome,
};
use dmgr_catalog::subsets::{
    add_rows, drop_empty_deleted_subsets, reconcile_total_rows, subset_by_uuid,
};
use dmgr_error::Result;
use dmgr_hash::content_hash_with_spec;
use dmgr_store::{read_part, sweep_stale_tmp};
use dmgr_types::now_epoch_us;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dataset::Dataset;

/// What a GC pass removed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GcReport {
    pub parts_removed: usize,
    pub subsets_removed: usize,
    pub files_unlinked: usize,
    pub rows_reconciled: usize,
}

/// What an fsck pass found and fixed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FsckReport {
    pub tmp_swept: usize,
    pub orphans_adopted: usize,
    pub orphans_removed: usize,
    /// Live part rows whose file is gone; they are soft-deleted for the
    /// next GC.
    pub missing_files: Vec<Uuid>,
    pub rows_reconciled: usize,
}

impl Dataset {
    /// Physically remove soft-deleted parts and empty soft-deleted
    /// subsets, then reconcile `total_rows`.
    ///
    /// Rows leave the catalog before files leave the disk; a crash in
    /// between leaves an orphan file that the next fsck reclaims.
    pub fn gc(&mut self) -> Result<GcReport> {
        let doomed = marked_parts(self.catalog.conn())?;
        let relpaths: Vec<String> = doomed.iter().map(|p| p.file_relpath.clone()).collect();

        let doomed_ids: Vec<Uuid> = doomed.iter().map(|p| p.part_uuid).collect();
        let (parts_removed, subsets_removed, rows_reconciled) =
            self.catalog.with_immediate_tx(|tx| {
                for part_uuid in &doomed_ids {
                    delete_part_row(tx, *part_uuid)?;
                }
                let reconciled = reconcile_total_rows(tx)?;
                let subsets_removed = drop_empty_deleted_subsets(tx)?;
                Ok((doomed_ids.len(), subsets_removed, reconciled))
            })?;

        let mut files_unlinked = 0_usize;
        for relpath in relpaths {
            if fs::remove_file(self.root.join(&relpath)).is_ok() {
                files_unlinked += 1;
            }
        }

        let report = GcReport {
            parts_removed,
            subsets_removed,
            files_unlinked,
            rows_reconciled,
        };
        info!(?report, "gc commit");
        self.audit.record(
            "gc",
            serde_json::json!({
                "parts_removed": report.parts_removed,
                "subsets_removed": report.subsets_removed,
                "files_unlinked": report.files_unlinked,
            }),
        );
        Ok(report)
    }

    /// Reconcile catalog and filesystem: sweep `*.tmp`, adopt or remove
    /// orphan part files, soft-delete rows whose file is gone, and repair
    /// `total_rows`.
    pub fn fsck(&mut self) -> Result<FsckReport> {
        let mut report = FsckReport::default();
        let subsets_dir = self.root.join("subsets");

        let mut dirs = Vec::new();
        collect_dirs(&subsets_dir, &mut dirs)?;
        for dir in &dirs {
            report.tmp_swept += sweep_stale_tmp(dir, std::time::Duration::ZERO)?;
        }

        let known = all_parts(self.catalog.conn())?;
        let known_paths: std::collections::BTreeMap<PathBuf, Uuid> = known
            .iter()
            .map(|p| (self.root.join(&p.file_relpath), p.part_uuid))
            .collect();

        let mut files = Vec::new();
        collect_files(&subsets_dir, &mut files)?;
        for path in files {
            if known_paths.contains_key(&path) {
                continue;
            }
            if self.try_adopt_orphan(&path)? {
                report.orphans_adopted += 1;
            } else {
                let _ = fs::remove_file(&path);
                report.orphans_removed += 1;
            }
        }

        for part in &known {
            if !self.root.join(&part.file_relpath).exists() {
                report.missing_files.push(part.part_uuid);
            }
        }
        let missing = report.missing_files.clone();
        report.rows_reconciled = self.catalog.with_immediate_tx(|tx| {
            for part_uuid in &missing {
                mark_part_deleted(tx, *part_uuid)?;
            }
            reconcile_total_rows(tx)
        })?;

        info!(
            tmp_swept = report.tmp_swept,
            adopted = report.orphans_adopted,
            removed = report.orphans_removed,
            missing = report.missing_files.len(),
            "fsck finished"
        );
        self.audit.record(
            "fsck",
            serde_json::json!({
                "tmp_swept": report.tmp_swept,
                "orphans_adopted": report.orphans_adopted,
                "orphans_removed": report.orphans_removed,
                "missing_files": report.missing_files.len(),
            }),
        );
        Ok(report)
    }

    /// A part file the catalog does not know: re-insert it when its
    /// embedded attributes check out against a known subset and its
    /// payload re-hashes to the embedded content hash.
    fn try_adopt_orphan(&mut self, path: &Path) -> Result<bool> {
        let Ok((attrs, block)) = read_part(path) else {
            warn!(path = %path.display(), "orphan part file fails to decode");
            return Ok(false);
        };
        if attrs.dataset_uuid != self.info.dataset_uuid {
            return Ok(false);
        }
        if subset_by_uuid(self.catalog.conn(), attrs.subset_uuid)?.is_none() {
            return Ok(false);
        }
        let recomputed = content_hash_with_spec(&block, &attrs.dtype_descr, &attrs.jagged)?;
        if recomputed != attrs.content_hash {
            warn!(path = %path.display(), "orphan part payload does not match its hash");
            return Ok(false);
        }
        let Ok(relpath) = path.strip_prefix(&self.root) else {
            return Ok(false);
        };
        let Some(relpath) = relpath.to_str() else {
            return Ok(false);
        };

        let part = NewPart {
            part_uuid: attrs.part_uuid,
            subset_uuid: attrs.subset_uuid,
            n_rows: attrs.n_rows as i64,
            scheme_version: attrs.scheme_version,
            file_relpath: relpath.to_owned(),
            content_hash: attrs.content_hash.clone(),
            producer_id: self.info.producer_id,
            batch_id: format!("recovered-{}", Uuid::new_v4()),
            created_at_epoch: attrs.created_at_epoch,
            part_stats_json: None,
            enc_version: 0,
            key_ref: None,
            nonce: None,
            tag: None,
            plaintext_size: fs::metadata(path).map(|m| m.len() as i64).unwrap_or(0),
        };
        let fingerprint = self.info.schema_fingerprint.clone();
        let adopted = self.catalog.with_immediate_tx(|tx| {
            match publish_part(tx, &part)? {
                PublishOutcome::AlreadyPresent { .. } => Ok(false),
                PublishOutcome::Inserted => {
                    add_rows(tx, part.subset_uuid, part.n_rows)?;
                    record_batch(
                        tx,
                        &NewBatch {
                            bid: part.batch_id.clone(),
                            producer_id: part.producer_id,
                            created_at_epoch: now_epoch_us(),
                            schema_fingerprint: fingerprint.clone(),
                            parts: vec![(part.part_uuid, part.content_hash.clone())],
                        },
                    )?;
                    Ok(true)
                }
            }
        })?;
        Ok(adopted)
    }
}

fn collect_dirs(root: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if !root.exists() {
        return Ok(());
    }
    out.push(root.to_path_buf());
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            collect_dirs(&entry.path(), out)?;
        }
    }
    Ok(())
}

fn collect_files(root: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if !root.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, out)?;
        } else if path.extension().is_some_and(|e| e == "h5") {
            out.push(path);
        }
    }
    Ok(())
}
