//! Jagged padding, route-independent content hashes, and dedup.

mod common;

use common::{geo_config, keys, open_geo, row};
use dmgr_catalog::parts::{list_batches, parts_of_subset};
use dmgr_core::AddOutcome;
use dmgr_schema::MetaColumn;
use dmgr_store::read_part;

const ROWS: [(f64, &[i64]); 3] = [(1.0, &[1, 2]), (2.0, &[1, 2, 3, 4]), (3.0, &[])];

#[test]
fn jagged_rows_lock_canon_and_pad_with_zeros() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut ds = open_geo(dir.path(), geo_config(dir.path(), 3));

    for (v, seq) in ROWS {
        ds.add(&keys(1.0), row(v, seq)).unwrap();
    }

    // Canonical shape locked to the observed maximum.
    assert_eq!(ds.doc().field("seq").unwrap().shape, vec![4]);

    let subsets = ds.find_subsets(&[]).unwrap();
    let parts = parts_of_subset(ds.catalog().conn(), subsets[0].subset_uuid, true).unwrap();
    assert_eq!(parts.len(), 1);

    let (attrs, block) = read_part(&dir.path().join(&parts[0].file_relpath)).unwrap();
    assert_eq!(attrs.n_rows, 3);
    let seq = &block.fields[1];
    assert_eq!(seq.meta, Some(MetaColumn::Len16(vec![2, 4, 0])));
    // Row 0 = [1, 2, 0, 0] as i32 LE: observed elements then padding.
    assert_eq!(
        seq.fixed_row_bytes(0).unwrap(),
        &[1, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
    );

    // A larger row after lock is DataExceedsCanon.
    let err = ds.add(&keys(1.0), row(9.0, &[1, 2, 3, 4, 5])).unwrap_err();
    assert!(matches!(err, dmgr_error::DmgrError::DataExceedsCanon(_)));
}

#[test]
fn content_hash_is_identical_across_direct_and_staged_routes() {
    let direct_dir = tempfile::TempDir::new().unwrap();
    let mut direct = open_geo(direct_dir.path(), geo_config(direct_dir.path(), 3));
    for (v, seq) in ROWS {
        direct.add(&keys(1.0), row(v, seq)).unwrap();
    }

    let staged_dir = tempfile::TempDir::new().unwrap();
    let mut config = geo_config(staged_dir.path(), 3);
    config.durable_staging = true;
    let mut staged = open_geo(staged_dir.path(), config);
    for (v, seq) in ROWS {
        staged.add(&keys(1.0), row(v, seq)).unwrap();
    }
    staged.flush().unwrap();

    let hash_of = |ds: &dmgr_core::Dataset| {
        let subsets = ds.find_subsets(&[]).unwrap();
        let parts = parts_of_subset(ds.catalog().conn(), subsets[0].subset_uuid, true).unwrap();
        assert_eq!(parts.len(), 1);
        parts[0].content_hash.clone()
    };
    assert_eq!(
        hash_of(&direct),
        hash_of(&staged),
        "direct seal and staging + compaction must agree bit-for-bit"
    );
}

#[test]
fn republishing_identical_rows_is_a_dedup_no_op() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut ds = open_geo(dir.path(), geo_config(dir.path(), 2));

    let first = [
        ds.add(&keys(1.0), row(1.0, &[1])).unwrap(),
        ds.add(&keys(1.0), row(2.0, &[2])).unwrap(),
    ];
    let AddOutcome::Sealed(sealed) = &first[1] else {
        panic!("second row must seal");
    };
    assert!(!sealed[0].deduplicated);

    // Same logical rows again, a separate batch.
    ds.add(&keys(1.0), row(1.0, &[1])).unwrap();
    let outcome = ds.add(&keys(1.0), row(2.0, &[2])).unwrap();
    let AddOutcome::Sealed(second) = outcome else {
        panic!("fourth row must trigger a second seal");
    };
    assert!(second[0].deduplicated, "second publish reports already present");
    assert_eq!(second[0].part_uuid, sealed[0].part_uuid);

    let subsets = ds.find_subsets(&[]).unwrap();
    let parts = parts_of_subset(ds.catalog().conn(), subsets[0].subset_uuid, true).unwrap();
    assert_eq!(parts.len(), 1, "one parts row survives");
    assert_eq!(subsets[0].total_rows, 2, "dedup must not double-count rows");
    assert_eq!(
        list_batches(ds.catalog().conn()).unwrap().len(),
        2,
        "both publishes remain visible as batches"
    );

    // The part directory holds exactly one sealed file.
    let dirpath = dir
        .path()
        .join(&parts[0].file_relpath)
        .parent()
        .unwrap()
        .to_path_buf();
    let files: Vec<_> = std::fs::read_dir(dirpath).unwrap().collect();
    assert_eq!(files.len(), 1);
}
