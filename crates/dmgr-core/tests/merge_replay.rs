//! Merge replay: union-correctness, idempotency, and the schema-mismatch
//! fork.

mod common;

use std::collections::BTreeSet;
use std::path::Path;

use common::{geo_config, keys, open_geo, row};
use dmgr_catalog::parts::all_parts;
use dmgr_catalog::{ddl, Catalog};
use dmgr_core::{merge_local, CopyMode, MergeOptions};
use dmgr_error::DmgrError;

fn distinct_pairs(root: &Path) -> BTreeSet<(String, String)> {
    let cat = Catalog::open_ro(&root.join("catalog.db")).unwrap();
    all_parts(cat.conn())
        .unwrap()
        .into_iter()
        .map(|p| (p.subset_uuid.to_string(), p.content_hash))
        .collect()
}

fn seeded_source(root: &Path) -> BTreeSet<(String, String)> {
    let mut src = open_geo(root, geo_config(root, 2));
    for lat in [1.0, 2.0] {
        src.add(&keys(lat), row(1.0, &[1])).unwrap();
        src.add(&keys(lat), row(2.0, &[1, 2])).unwrap();
    }
    src.flush().unwrap();
    distinct_pairs(root)
}

#[test]
fn merge_is_union_correct_and_idempotent() {
    let src_dir = tempfile::TempDir::new().unwrap();
    let src_pairs = seeded_source(src_dir.path());
    assert_eq!(src_pairs.len(), 2, "two subsets, one part each");

    // Destination starts with its own overlapping content: same first
    // subset rows, plus one of its own.
    let dst_dir = tempfile::TempDir::new().unwrap();
    {
        let mut dst = open_geo(dst_dir.path(), geo_config(dst_dir.path(), 2));
        dst.add(&keys(1.0), row(1.0, &[1])).unwrap();
        dst.add(&keys(1.0), row(2.0, &[1, 2])).unwrap();
        dst.add(&keys(9.0), row(5.0, &[])).unwrap();
        dst.flush().unwrap();
    }
    let dst_pairs = distinct_pairs(dst_dir.path());

    let opts = MergeOptions {
        copy_mode: CopyMode::Auto,
        verify_hash: true,
        ..MergeOptions::default()
    };
    let first = merge_local(src_dir.path(), dst_dir.path(), "geo", &opts).unwrap();
    assert!(first.batches_applied > 0);
    assert_eq!(first.parts_skipped, 1, "the shared part dedups");

    let merged = distinct_pairs(dst_dir.path());
    let union: BTreeSet<_> = src_pairs.union(&dst_pairs).cloned().collect();
    assert_eq!(merged, union, "destination equals src ∪ dst");

    // Files really exist for every live row.
    for part in {
        let cat = Catalog::open_ro(&dst_dir.path().join("catalog.db")).unwrap();
        all_parts(cat.conn()).unwrap()
    } {
        assert!(dst_dir.path().join(&part.file_relpath).exists());
    }

    // Second run replays nothing.
    let second = merge_local(src_dir.path(), dst_dir.path(), "geo", &opts).unwrap();
    assert_eq!(second.batches_applied, 0);
    assert_eq!(second.parts_copied, 0);
    assert_eq!(distinct_pairs(dst_dir.path()), union);
}

#[test]
fn dry_run_plans_without_writing() {
    let src_dir = tempfile::TempDir::new().unwrap();
    seeded_source(src_dir.path());
    let dst_dir = tempfile::TempDir::new().unwrap();

    let opts = MergeOptions {
        dry_run: true,
        ..MergeOptions::default()
    };
    let plan = merge_local(src_dir.path(), dst_dir.path(), "geo", &opts).unwrap();
    assert!(plan.planned);
    assert_eq!(plan.parts_copied, 2);
    assert!(distinct_pairs(dst_dir.path()).is_empty(), "dry run writes no parts");

    // A real run afterwards applies exactly the plan.
    let real = merge_local(
        src_dir.path(),
        dst_dir.path(),
        "geo",
        &MergeOptions::default(),
    )
    .unwrap();
    assert_eq!(real.parts_copied, plan.parts_copied);
}

#[test]
fn schema_mismatch_fails_closed_and_forks_when_allowed() {
    let src_dir = tempfile::TempDir::new().unwrap();
    seeded_source(src_dir.path());

    // Destination dataset of the same alias, different quantization.
    let dst_dir = tempfile::TempDir::new().unwrap();
    {
        let mut config = geo_config(dst_dir.path(), 2);
        config.quantization.insert("lat".to_owned(), 1_000.0);
        let mut dst = open_geo(dst_dir.path(), config);
        dst.add(&keys(3.0), row(1.0, &[1])).unwrap();
        dst.flush().unwrap();
    }
    let dst_before = distinct_pairs(dst_dir.path());

    let err = merge_local(
        src_dir.path(),
        dst_dir.path(),
        "geo",
        &MergeOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, DmgrError::MergeInvariantViolated(_)));

    let opts = MergeOptions {
        allow_schema_mismatch: true,
        verify_hash: true,
        ..MergeOptions::default()
    };
    let report = merge_local(src_dir.path(), dst_dir.path(), "geo", &opts).unwrap();
    let fork_alias = report.forked_alias.expect("mismatch must fork");

    let cat = Catalog::open_ro(&dst_dir.path().join("catalog.db")).unwrap();
    let fork = ddl::get_dataset(cat.conn(), &fork_alias).unwrap().unwrap();
    let original = ddl::get_dataset(cat.conn(), "geo").unwrap().unwrap();
    assert_ne!(fork.dataset_uuid, original.dataset_uuid);

    // Original dataset untouched; fork carries every source batch.
    assert!(distinct_pairs(dst_dir.path()).is_superset(&dst_before));
    let src_cat = Catalog::open_ro(&src_dir.path().join("catalog.db")).unwrap();
    for batch in dmgr_catalog::parts::list_batches(src_cat.conn()).unwrap() {
        assert!(
            dmgr_catalog::parts::merge_log_contains(cat.conn(), batch.producer_id, &batch.bid)
                .unwrap(),
            "fork merge log must contain src bid {}",
            batch.bid
        );
    }
}
