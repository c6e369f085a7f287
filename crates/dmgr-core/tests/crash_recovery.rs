//! Crash recovery: stale tmp files are swept, staged rows survive a dead
//! writer, and the recovered state matches a clean run.

mod common;

use common::{geo_config, keys, open_geo, row};
use dmgr_catalog::parts::parts_of_subset;

const ROWS: [(f64, &[i64]); 5] = [
    (1.0, &[1]),
    (2.0, &[1, 2]),
    (3.0, &[]),
    (4.0, &[7]),
    (5.0, &[1, 2, 3]),
];

fn ingest_all(ds: &mut dmgr_core::Dataset) {
    for (v, seq) in ROWS {
        ds.add(&keys(42.0), row(v, seq)).unwrap();
    }
}

#[test]
fn killed_writer_replays_from_staging_to_the_clean_state() {
    // Reference: a run that never crashes.
    let clean_dir = tempfile::TempDir::new().unwrap();
    let mut config = geo_config(clean_dir.path(), 100);
    config.durable_staging = true;
    let mut clean = open_geo(clean_dir.path(), config);
    ingest_all(&mut clean);
    clean.flush().unwrap();
    let clean_subsets = clean.find_subsets(&[]).unwrap();
    let clean_parts =
        parts_of_subset(clean.catalog().conn(), clean_subsets[0].subset_uuid, true).unwrap();
    assert_eq!(clean_parts.len(), 1);

    // Crashing run: rows reach staging, then the writer dies after
    // creating a part tmp but before renaming it.
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = geo_config(dir.path(), 100);
    config.durable_staging = true;
    let subset_uuid = {
        let mut ds = open_geo(dir.path(), config.clone());
        ingest_all(&mut ds);
        let norm = dmgr_identity::KeyNormalizer::new(ds.doc());
        norm.normalize(&keys(42.0)).unwrap().subset_uuid
        // Dropped here without a flush: the simulated kill.
    };
    let parts_dir = dir
        .path()
        .join(format!("subsets/{subset_uuid}/parts/v1"));
    std::fs::create_dir_all(&parts_dir).unwrap();
    std::fs::write(parts_dir.join("half-written.h5.tmp"), b"torn write").unwrap();

    // Restart: sweep, then replay from staging.
    let mut ds = open_geo(dir.path(), config);
    let fsck = ds.fsck().unwrap();
    assert_eq!(fsck.tmp_swept, 1, "the torn tmp must be swept");
    assert!(fsck.missing_files.is_empty());
    ds.flush().unwrap();

    let subsets = ds.find_subsets(&[]).unwrap();
    assert_eq!(subsets.len(), 1);
    assert_eq!(subsets[0].total_rows, 5);
    let parts = parts_of_subset(ds.catalog().conn(), subsets[0].subset_uuid, true).unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(
        parts[0].content_hash, clean_parts[0].content_hash,
        "recovered state must be byte-identical to the clean run"
    );

    // No tmp survives anywhere under the root.
    let mut stack = vec![dir.path().to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in std::fs::read_dir(&d).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                assert!(
                    !path.to_string_lossy().ends_with(".tmp"),
                    "leftover tmp at {path:?}"
                );
            }
        }
    }
}

#[test]
fn orphan_published_file_is_adopted_by_fsck() {
    // A file that was renamed into place, but whose catalog transaction
    // never committed: fsck re-inserts it when its attributes match.
    let dir = tempfile::TempDir::new().unwrap();
    let mut ds = open_geo(dir.path(), geo_config(dir.path(), 2));
    ds.add(&keys(1.0), row(1.0, &[1])).unwrap();
    ds.add(&keys(1.0), row(2.0, &[2])).unwrap();

    let subsets = ds.find_subsets(&[]).unwrap();
    let subset_uuid = subsets[0].subset_uuid;
    let parts = parts_of_subset(ds.catalog().conn(), subset_uuid, true).unwrap();
    let relpath = parts[0].file_relpath.clone();
    let n_rows = parts[0].n_rows;

    // Drop the catalog row but keep the file, then fsck.
    ds.catalog_mut()
        .with_immediate_tx(|tx| {
            dmgr_catalog::parts::delete_part_row(tx, parts[0].part_uuid)?;
            dmgr_catalog::subsets::reconcile_total_rows(tx)?;
            Ok(())
        })
        .unwrap();
    assert!(dir.path().join(&relpath).exists());

    let report = ds.fsck().unwrap();
    assert_eq!(report.orphans_adopted, 1);

    let parts = parts_of_subset(ds.catalog().conn(), subset_uuid, true).unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].n_rows, n_rows);
    let subsets = ds.find_subsets(&[]).unwrap();
    assert_eq!(subsets[0].total_rows, n_rows);
}
