//! Atomic part publication.
//!
//! The publish pipeline is the durability heart of the engine: encode to a
//! `.tmp` sibling, fsync the file, rename over the final name, fsync the
//! containing directory. Any failure after tmp creation removes the tmp
//! before the error surfaces, so a crashed publish is a no-op. Stale tmps
//! left by killed writers are swept on the next publish into the same
//! directory.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use dmgr_error::{DmgrError, Result};
use dmgr_schema::RowBlock;
use dmgr_types::StorageScheme;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::container::{encode_part, PartAttributes};

/// Extension of sealed part files.
pub const PART_EXT: &str = "h5";
const TMP_SUFFIX: &str = ".tmp";

/// What a successful publish hands back for the catalog transaction.
#[derive(Debug, Clone)]
pub struct PartHandle {
    pub part_uuid: Uuid,
    pub file_relpath: String,
    pub n_rows: u64,
    pub created_at_epoch: i64,
    /// Total file size; with `enc_version = 0` this is the plaintext size.
    pub plaintext_size: u64,
}

/// Relative path of a part under the dataset root.
///
/// Depth 0: `subsets/<subset>/parts/v<N>/<part>.h5`. Depth > 0 inserts
/// `depth` segments of `seglen` hex chars drawn from
/// `sha256(subset_uuid ⧺ part_uuid)`.
pub fn part_relpath(scheme: &StorageScheme, subset_uuid: Uuid, part_uuid: Uuid) -> Result<String> {
    scheme.validate()?;
    let mut path = format!("subsets/{subset_uuid}/parts/v{}", scheme.version);
    if scheme.depth > 0 {
        let mut hasher = Sha256::new();
        hasher.update(subset_uuid.to_string().as_bytes());
        hasher.update(part_uuid.to_string().as_bytes());
        let digest = hex::encode(hasher.finalize());
        let seglen = usize::from(scheme.seglen);
        for i in 0..usize::from(scheme.depth) {
            let start = i * seglen;
            let seg = digest.get(start..start + seglen).ok_or_else(|| {
                DmgrError::internal("shard digest shorter than depth * seglen")
            })?;
            path.push('/');
            path.push_str(seg);
        }
    }
    path.push('/');
    path.push_str(&part_uuid.to_string());
    path.push('.');
    path.push_str(PART_EXT);
    Ok(path)
}

/// The additional-authenticated-data image committed at seal time.
///
/// All inputs are fixed now so that enabling AEAD later is a payload
/// change, not a schema change.
#[must_use]
pub fn build_aad(
    dataset_uuid: Uuid,
    subset_uuid: Uuid,
    part_uuid: Uuid,
    schema_fingerprint: &str,
    scheme_version: u32,
    quantization_digest: &str,
    content_hash: &str,
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(160);
    aad.extend_from_slice(dataset_uuid.to_string().as_bytes());
    aad.extend_from_slice(subset_uuid.to_string().as_bytes());
    aad.extend_from_slice(part_uuid.to_string().as_bytes());
    aad.extend_from_slice(schema_fingerprint.as_bytes());
    aad.extend_from_slice(scheme_version.to_string().as_bytes());
    aad.extend_from_slice(quantization_digest.as_bytes());
    aad.extend_from_slice(content_hash.as_bytes());
    aad
}

/// Write and atomically publish one part file.
///
/// `attrs.part_uuid` and the scheme determine the final path. Returns the
/// handle the catalog needs; no database writes happen here.
pub fn write_part(
    dataset_root: &Path,
    scheme: &StorageScheme,
    attrs: &PartAttributes,
    block: &RowBlock,
    tmp_sweep_horizon: Duration,
) -> Result<PartHandle> {
    let relpath = part_relpath(scheme, attrs.subset_uuid, attrs.part_uuid)?;
    let final_path = dataset_root.join(&relpath);
    let dir = final_path
        .parent()
        .ok_or_else(|| DmgrError::internal("part path has no parent"))?;
    fs::create_dir_all(dir)?;

    let swept = sweep_stale_tmp(dir, tmp_sweep_horizon)?;
    if swept > 0 {
        warn!(swept, dir = %dir.display(), "removed stale part tmp files");
    }

    let bytes = encode_part(attrs, block)?;
    let tmp_path = tmp_sibling(&final_path);
    let publish = (|| -> Result<u64> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.flush()?;
        // Backend-level sync first, OS fsync as the fallback; with the
        // std backend both collapse into `sync_all`.
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &final_path)?;
        fsync_dir(dir)?;
        Ok(bytes.len() as u64)
    })();

    match publish {
        Ok(size) => {
            debug!(
                part = %attrs.part_uuid,
                relpath,
                n_rows = attrs.n_rows,
                "part published"
            );
            Ok(PartHandle {
                part_uuid: attrs.part_uuid,
                file_relpath: relpath,
                n_rows: attrs.n_rows,
                created_at_epoch: attrs.created_at_epoch,
                plaintext_size: size,
            })
        }
        Err(err) => {
            let _ = fs::remove_file(&tmp_path);
            Err(err)
        }
    }
}

/// Remove `*.tmp` files in `dir` whose mtime is at least `horizon` old.
/// Returns how many were removed.
pub fn sweep_stale_tmp(dir: &Path, horizon: Duration) -> Result<usize> {
    let mut swept = 0_usize;
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let now = SystemTime::now();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let is_tmp = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(TMP_SUFFIX));
        if !is_tmp {
            continue;
        }
        let old_enough = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|mtime| now.duration_since(mtime).unwrap_or_default() >= horizon)
            .unwrap_or(true);
        if old_enough && fs::remove_file(&path).is_ok() {
            swept += 1;
        }
    }
    Ok(swept)
}

fn tmp_sibling(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(TMP_SUFFIX);
    final_path.with_file_name(name)
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> Result<()> {
    // Directory handles cannot be fsynced portably; rename durability is
    // what the platform gives us.
    Ok(())
}
