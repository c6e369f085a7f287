//! Shared fixtures for the end-to-end suites.

use std::collections::BTreeMap;
use std::path::Path;

use dmgr_core::Dataset;
use dmgr_types::schema_doc::{BaseDtype, FieldSpec, JaggedSpec, KeyField};
use dmgr_types::{Cell, KeyType, KeyValue, StoreConfig};

/// Route engine tracing into the captured per-test output. Idempotent;
/// later calls lose the race and that is fine.
fn init_logs() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// `lat: REAL` keyed dataset with a scalar float field and a jagged int
/// sequence, quantized at 1e6 like a micro-degree coordinate.
pub fn geo_config(root: &Path, part_rows: u64) -> StoreConfig {
    let mut config = StoreConfig::new(root);
    config.part_rows = part_rows;
    config
        .quantization
        .insert("lat".to_owned(), 1_000_000.0);
    config.jagged.insert(
        "seq".to_owned(),
        JaggedSpec {
            vary_dims: vec![0],
        },
    );
    config
}

pub fn open_geo(root: &Path, config: StoreConfig) -> Dataset {
    init_logs();
    Dataset::open(
        "geo",
        vec![KeyField {
            name: "lat".into(),
            ktype: KeyType::Real,
        }],
        vec![
            FieldSpec {
                name: "value".into(),
                dtype: BaseDtype::Float64,
                shape: vec![],
            },
            FieldSpec {
                name: "seq".into(),
                dtype: BaseDtype::Int32,
                shape: vec![0],
            },
        ],
        config,
    )
    .expect("dataset must open")
}

pub fn keys(lat: f64) -> BTreeMap<String, KeyValue> {
    [("lat".to_owned(), KeyValue::Real(lat))].into_iter().collect()
}

pub fn row(value: f64, seq: &[i64]) -> BTreeMap<String, Cell> {
    [
        ("value".to_owned(), Cell::Real(value)),
        (
            "seq".to_owned(),
            Cell::List(seq.iter().map(|&v| Cell::Int(v)).collect()),
        ),
    ]
    .into_iter()
    .collect()
}
