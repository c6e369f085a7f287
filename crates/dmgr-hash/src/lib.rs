//! Byte-stable content digests.
//!
//! Every digest in the engine is blake2b with a 16-byte output, hex
//! encoded. The content hash of a block is defined over (1) the schema
//! signature, (2) each row's fields in `dtype_descr` order — text as
//! NFC UTF-8 prefixed by an LE u32 byte length, fixed-width fields as
//! their padded little-endian bytes — and (3) each jagged meta array, in
//! the same field order. The routine is identical for an in-memory block
//! and a block decoded from a sealed file, which is what makes the two
//! digests bit-equal.

use std::collections::BTreeMap;

use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use dmgr_error::Result;
use dmgr_schema::{ColumnData, RowBlock};
use dmgr_types::{FieldSpec, JaggedSpec, SchemaDocument};
use serde::Serialize;

type Blake2b128 = Blake2b<U16>;

/// Upper bound on payload bytes fed to the hasher in one gulp. Purely a
/// memory bound; chunk boundaries never change the digest.
pub const MAX_CHUNK_BYTES: usize = 8 * 1024 * 1024;

/// blake2b-128 of raw bytes.
#[must_use]
pub fn blake2b_128(bytes: &[u8]) -> [u8; 16] {
    let mut hasher = Blake2b128::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// blake2b-128 of raw bytes, hex encoded.
#[must_use]
pub fn blake2b_128_hex(bytes: &[u8]) -> String {
    hex::encode(blake2b_128(bytes))
}

/// The schema signature that seeds every content hash: canonical JSON of
/// the `(field_name, base_dtype, shape)` triples plus the jagged spec.
pub fn schema_signature(
    dtype_descr: &[FieldSpec],
    jagged: &BTreeMap<String, JaggedSpec>,
) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct Signature<'a> {
        dtype_descr: &'a [FieldSpec],
        jagged: &'a BTreeMap<String, JaggedSpec>,
    }
    Ok(serde_json::to_vec(&Signature {
        dtype_descr,
        jagged,
    })?)
}

/// Fingerprint of a whole schema document: blake2b-128 of its canonical
/// JSON, hex encoded. Gates merge compatibility.
pub fn schema_fingerprint(doc: &SchemaDocument) -> Result<String> {
    Ok(blake2b_128_hex(&doc.canonical_json()?))
}

/// Digest of a quantization map, one of the committed AAD inputs.
pub fn quantization_digest(quantization: &BTreeMap<String, f64>) -> Result<String> {
    Ok(blake2b_128_hex(&serde_json::to_vec(quantization)?))
}

/// Content hash of a padded columnar block.
///
/// The coordinator passes the locked document's `dtype_descr` and
/// `jagged`, and the part reader passes the specs embedded in the file,
/// so both sides hash the same signature.
pub fn content_hash_with_spec(
    block: &RowBlock,
    dtype_descr: &[FieldSpec],
    jagged: &BTreeMap<String, JaggedSpec>,
) -> Result<String> {
    let mut hasher = Blake2b128::new();
    hasher.update(schema_signature(dtype_descr, jagged)?);

    for row in 0..block.n_rows {
        for field in &block.fields {
            match &field.data {
                ColumnData::Fixed(_) => {
                    hasher.update(field.fixed_row_bytes(row)?);
                }
                ColumnData::Text(_) => {
                    for cell in field.text_row(row)? {
                        let len = cell.len() as u32;
                        hasher.update(len.to_le_bytes());
                        hasher.update(cell.as_bytes());
                    }
                }
            }
        }
    }

    for field in &block.fields {
        if let Some(meta) = &field.meta {
            hasher.update(meta.raw_le_bytes());
        }
    }

    let digest: [u8; 16] = hasher.finalize().into();
    Ok(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmgr_schema::{registry::SchemaRegistry, RowBlockBuilder};
    use dmgr_types::schema_doc::{
        BaseDtype, EncryptionPolicy, KeyField, PartConfig,
    };
    use dmgr_types::{Cell, KeyType};

    fn doc() -> SchemaDocument {
        SchemaDocument {
            key_schema: vec![KeyField {
                name: "run".into(),
                ktype: KeyType::Integer,
            }],
            key_order: vec!["run".into()],
            dtype_descr: vec![
                FieldSpec {
                    name: "value".into(),
                    dtype: BaseDtype::Float64,
                    shape: vec![],
                },
                FieldSpec {
                    name: "seq".into(),
                    dtype: BaseDtype::Int32,
                    shape: vec![4],
                },
                FieldSpec {
                    name: "tag".into(),
                    dtype: BaseDtype::Utf8 { max_bytes: 8 },
                    shape: vec![],
                },
            ],
            part_config: PartConfig::default(),
            quantization: BTreeMap::new(),
            jagged: [(
                "seq".to_owned(),
                JaggedSpec {
                    vary_dims: vec![0],
                },
            )]
            .into_iter()
            .collect(),
            encryption: EncryptionPolicy::default(),
        }
    }

    fn block(rows: &[(f64, &[i64], &str)]) -> RowBlock {
        let d = doc();
        let reg = SchemaRegistry::new(d.clone(), true).unwrap();
        let mut builder = RowBlockBuilder::new(reg.doc());
        for (v, s, t) in rows {
            let row: BTreeMap<String, Cell> = [
                ("value".to_owned(), Cell::Real(*v)),
                (
                    "seq".to_owned(),
                    Cell::List(s.iter().map(|&x| Cell::Int(x)).collect()),
                ),
                ("tag".to_owned(), Cell::Text((*t).to_owned())),
            ]
            .into_iter()
            .collect();
            builder.push(reg.prepare_row(row).unwrap());
        }
        builder.build().unwrap()
    }

    fn hash(rows: &[(f64, &[i64], &str)]) -> String {
        let d = doc();
        content_hash_with_spec(&block(rows), &d.dtype_descr, &d.jagged).unwrap()
    }

    #[test]
    fn identical_rows_hash_identically() {
        let rows: &[(f64, &[i64], &str)] = &[(1.0, &[1, 2], "a"), (2.0, &[], "bb")];
        assert_eq!(hash(rows), hash(rows));
    }

    #[test]
    fn row_order_matters() {
        let a = hash(&[(1.0, &[1], "a"), (2.0, &[2], "b")]);
        let b = hash(&[(2.0, &[2], "b"), (1.0, &[1], "a")]);
        assert_ne!(a, b);
    }

    #[test]
    fn padding_is_part_of_the_hash() {
        // Same logical elements, different observed lengths: the meta
        // arrays differ, so the digests must differ.
        let a = hash(&[(1.0, &[1, 0], "a")]);
        let b = hash(&[(1.0, &[1], "a")]);
        assert_ne!(a, b);
    }

    #[test]
    fn signature_covers_dtype() {
        let d = doc();
        let blk = block(&[(1.0, &[1], "a")]);
        let baseline = content_hash_with_spec(&blk, &d.dtype_descr, &d.jagged).unwrap();

        let mut widened = d.dtype_descr.clone();
        widened[2].dtype = BaseDtype::Utf8 { max_bytes: 16 };
        let changed = content_hash_with_spec(&blk, &widened, &d.jagged).unwrap();
        assert_ne!(baseline, changed);
    }

    #[test]
    fn empty_block_hash_is_signature_only() {
        let d = doc();
        let blk = block(&[]);
        let got = content_hash_with_spec(&blk, &d.dtype_descr, &d.jagged).unwrap();

        let mut hasher = Blake2b128::new();
        hasher.update(schema_signature(&d.dtype_descr, &d.jagged).unwrap());
        // No jagged meta bytes: zero rows produce empty meta arrays.
        let digest: [u8; 16] = hasher.finalize().into();
        assert_eq!(got, hex::encode(digest));
    }

    #[test]
    fn quantization_digest_is_order_insensitive() {
        let a: BTreeMap<String, f64> =
            [("lat".to_owned(), 1.0e6), ("lon".to_owned(), 1.0e3)].into_iter().collect();
        let b: BTreeMap<String, f64> =
            [("lon".to_owned(), 1.0e3), ("lat".to_owned(), 1.0e6)].into_iter().collect();
        assert_eq!(
            quantization_digest(&a).unwrap(),
            quantization_digest(&b).unwrap()
        );
    }
}
