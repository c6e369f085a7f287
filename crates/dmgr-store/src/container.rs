//! The default part container codec.
//!
//! A part file is self-describing: its embedded attribute block carries
//! everything needed to re-derive the content hash without opening the
//! catalog. Layout, all integers little-endian:
//!
//! ```text
//! magic "DMGRPRT1"
//! u32 attr_len | attr JSON (PartAttributes)
//! per field, dtype order:
//!   u8 kind (0 fixed, 1 text) | u64 payload_len | payload
//!     fixed: raw padded column bytes
//!     text:  per element u32 byte_len | bytes
//! per jagged field, dtype order:
//!   u8 meta kind (0 len16, 1 len32, 2 shape16, 3 shape32)
//!   u64 byte_len | raw bytes
//! u64 payload_total  (length check)
//! ```

use std::collections::BTreeMap;
use std::io::Read;

use dmgr_error::{DmgrError, Result};
use dmgr_schema::{ColumnData, FieldColumn, MetaColumn, RowBlock};
use dmgr_types::{FieldSpec, JaggedSpec};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub(crate) const MAGIC: &[u8; 8] = b"DMGRPRT1";

const KIND_FIXED: u8 = 0;
const KIND_TEXT: u8 = 1;

/// Attributes embedded in every part file, readable without the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartAttributes {
    pub part_uuid: Uuid,
    pub subset_uuid: Uuid,
    pub dataset_uuid: Uuid,
    /// Microseconds since the Unix epoch.
    pub created_at_epoch: i64,
    pub n_rows: u64,
    pub scheme_version: u32,
    pub content_hash: String,
    /// Raw key snapshot of the owning subset, JSON.
    pub subset_keys_json: String,
    /// Canonical dtype at seal time; makes the file self-describing.
    pub dtype_descr: Vec<FieldSpec>,
    pub jagged: BTreeMap<String, JaggedSpec>,
}

/// Serialize a block with its attributes into the container byte image.
pub fn encode_part(attrs: &PartAttributes, block: &RowBlock) -> Result<Vec<u8>> {
    if attrs.n_rows as usize != block.n_rows {
        return Err(DmgrError::internal(format!(
            "attribute n_rows {} disagrees with block {}",
            attrs.n_rows, block.n_rows
        )));
    }
    let attr_json = serde_json::to_vec(attrs)?;
    let mut out = Vec::with_capacity(attr_json.len() + 1024);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(attr_json.len() as u32).to_le_bytes());
    out.extend_from_slice(&attr_json);

    let payload_start = out.len();
    for field in &block.fields {
        match &field.data {
            ColumnData::Fixed(bytes) => {
                out.push(KIND_FIXED);
                out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
                out.extend_from_slice(bytes);
            }
            ColumnData::Text(cells) => {
                out.push(KIND_TEXT);
                let body: Vec<u8> = cells
                    .iter()
                    .flat_map(|s| {
                        let mut e = (s.len() as u32).to_le_bytes().to_vec();
                        e.extend_from_slice(s.as_bytes());
                        e
                    })
                    .collect();
                out.extend_from_slice(&(body.len() as u64).to_le_bytes());
                out.extend_from_slice(&body);
            }
        }
    }
    for field in &block.fields {
        if let Some(meta) = &field.meta {
            let (kind, bytes) = match meta {
                MetaColumn::Len16(_) => (0_u8, meta.raw_le_bytes()),
                MetaColumn::Len32(_) => (1, meta.raw_le_bytes()),
                MetaColumn::Shape16(_) => (2, meta.raw_le_bytes()),
                MetaColumn::Shape32(_) => (3, meta.raw_le_bytes()),
            };
            out.push(kind);
            out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
            out.extend_from_slice(&bytes);
        }
    }
    let payload_total = (out.len() - payload_start) as u64;
    out.extend_from_slice(&payload_total.to_le_bytes());
    Ok(out)
}

/// Decode a container byte image back into attributes and a block.
pub fn decode_part(bytes: &[u8]) -> Result<(PartAttributes, RowBlock)> {
    let mut cur = Cursor { bytes, pos: 0 };
    let magic = cur.take(8)?;
    if magic != MAGIC {
        return Err(DmgrError::Corrupt("bad part magic".to_owned()));
    }
    let attr_len = cur.u32()? as usize;
    let attrs: PartAttributes = serde_json::from_slice(cur.take(attr_len)?)?;
    let payload_start = cur.pos;

    let n_rows = attrs.n_rows as usize;
    let mut fields = Vec::with_capacity(attrs.dtype_descr.len());
    for spec in &attrs.dtype_descr {
        let kind = cur.u8()?;
        let len = cur.u64()? as usize;
        let body = cur.take(len)?;
        let data = match kind {
            KIND_FIXED => {
                let elem_size = spec.dtype.elem_size().ok_or_else(|| {
                    DmgrError::Corrupt(format!("text field {:?} stored as fixed", spec.name))
                })?;
                let expect = n_rows * spec.elems_per_row() * elem_size;
                if body.len() != expect {
                    return Err(DmgrError::Corrupt(format!(
                        "field {:?} payload is {} bytes, expected {expect}",
                        spec.name,
                        body.len()
                    )));
                }
                ColumnData::Fixed(body.to_vec())
            }
            KIND_TEXT => {
                let expect = n_rows * spec.elems_per_row();
                let mut cells = Vec::with_capacity(expect);
                let mut inner = Cursor { bytes: body, pos: 0 };
                for _ in 0..expect {
                    let len = inner.u32()? as usize;
                    let raw = inner.take(len)?;
                    let s = std::str::from_utf8(raw).map_err(|_| {
                        DmgrError::Corrupt(format!("field {:?} has non-UTF-8 text", spec.name))
                    })?;
                    cells.push(s.to_owned());
                }
                if inner.pos != body.len() {
                    return Err(DmgrError::Corrupt(format!(
                        "field {:?} has trailing text bytes",
                        spec.name
                    )));
                }
                ColumnData::Text(cells)
            }
            other => {
                return Err(DmgrError::Corrupt(format!(
                    "unknown column kind {other}"
                )))
            }
        };
        fields.push(FieldColumn {
            spec: spec.clone(),
            data,
            meta: None,
        });
    }
    for field in &mut fields {
        if !attrs.jagged.contains_key(&field.spec.name) {
            continue;
        }
        let kind = cur.u8()?;
        let len = cur.u64()? as usize;
        let body = cur.take(len)?;
        field.meta = Some(decode_meta(kind, body)?);
    }

    let payload_total = (cur.pos - payload_start) as u64;
    let recorded = cur.u64()?;
    if recorded != payload_total {
        return Err(DmgrError::Corrupt(format!(
            "payload length check failed: recorded {recorded}, walked {payload_total}"
        )));
    }
    if cur.pos != bytes.len() {
        return Err(DmgrError::Corrupt("trailing bytes after footer".to_owned()));
    }

    Ok((attrs, RowBlock { n_rows, fields }))
}

fn decode_meta(kind: u8, body: &[u8]) -> Result<MetaColumn> {
    fn chunks<const N: usize>(body: &[u8]) -> Result<Vec<[u8; N]>> {
        if body.len() % N != 0 {
            return Err(DmgrError::Corrupt("meta array length misaligned".to_owned()));
        }
        Ok(body
            .chunks_exact(N)
            .map(|c| {
                let mut arr = [0_u8; N];
                arr.copy_from_slice(c);
                arr
            })
            .collect())
    }
    match kind {
        0 => Ok(MetaColumn::Len16(
            chunks::<2>(body)?.into_iter().map(u16::from_le_bytes).collect(),
        )),
        1 => Ok(MetaColumn::Len32(
            chunks::<4>(body)?.into_iter().map(u32::from_le_bytes).collect(),
        )),
        2 => Ok(MetaColumn::Shape16(
            chunks::<2>(body)?.into_iter().map(i16::from_le_bytes).collect(),
        )),
        3 => Ok(MetaColumn::Shape32(
            chunks::<4>(body)?.into_iter().map(i32::from_le_bytes).collect(),
        )),
        other => Err(DmgrError::Corrupt(format!("unknown meta kind {other}"))),
    }
}

/// Read and decode a sealed part file.
pub fn read_part(path: &std::path::Path) -> Result<(PartAttributes, RowBlock)> {
    let mut file = std::fs::File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    decode_part(&bytes)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.bytes.len())
            .ok_or_else(|| DmgrError::Corrupt("truncated part file".to_owned()))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let raw = self.take(8)?;
        let mut arr = [0_u8; 8];
        arr.copy_from_slice(raw);
        Ok(u64::from_le_bytes(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmgr_schema::{RowBlockBuilder, SchemaRegistry};
    use dmgr_types::schema_doc::{
        BaseDtype, EncryptionPolicy, KeyField, PartConfig, SchemaDocument,
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

    fn sample_block(d: &SchemaDocument) -> RowBlock {
        let reg = SchemaRegistry::new(d.clone(), true).unwrap();
        let mut builder = RowBlockBuilder::new(reg.doc());
        for (v, s, t) in [(1.0, vec![1_i64, 2], "ab"), (2.5, vec![], "c\u{e9}")] {
            let row: BTreeMap<String, Cell> = [
                ("value".to_owned(), Cell::Real(v)),
                (
                    "seq".to_owned(),
                    Cell::List(s.iter().map(|&x| Cell::Int(x)).collect()),
                ),
                ("tag".to_owned(), Cell::Text(t.to_owned())),
            ]
            .into_iter()
            .collect();
            builder.push(reg.prepare_row(row).unwrap());
        }
        builder.build().unwrap()
    }

    fn attrs(d: &SchemaDocument, n_rows: u64) -> PartAttributes {
        PartAttributes {
            part_uuid: Uuid::from_u128(1),
            subset_uuid: Uuid::from_u128(2),
            dataset_uuid: Uuid::from_u128(3),
            created_at_epoch: 1_700_000_000_000_000,
            n_rows,
            scheme_version: 1,
            content_hash: "00".repeat(16),
            subset_keys_json: "{\"run\":1}".to_owned(),
            dtype_descr: d.dtype_descr.clone(),
            jagged: d.jagged.clone(),
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let d = doc();
        let block = sample_block(&d);
        let a = attrs(&d, block.n_rows as u64);
        let bytes = encode_part(&a, &block).unwrap();
        let (back_attrs, back_block) = decode_part(&bytes).unwrap();
        assert_eq!(back_attrs, a);
        assert_eq!(back_block, block);
    }

    #[test]
    fn hash_from_memory_equals_hash_from_decoded() {
        let d = doc();
        let block = sample_block(&d);
        let mem = dmgr_hash::content_hash_with_spec(&block, &d.dtype_descr, &d.jagged).unwrap();

        let bytes = encode_part(&attrs(&d, block.n_rows as u64), &block).unwrap();
        let (back_attrs, back_block) = decode_part(&bytes).unwrap();
        let from_file = dmgr_hash::content_hash_with_spec(
            &back_block,
            &back_attrs.dtype_descr,
            &back_attrs.jagged,
        )
        .unwrap();
        assert_eq!(mem, from_file);
    }

    #[test]
    fn truncation_is_detected() {
        let d = doc();
        let block = sample_block(&d);
        let bytes = encode_part(&attrs(&d, block.n_rows as u64), &block).unwrap();
        let err = decode_part(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, DmgrError::Corrupt(_)));
    }

    #[test]
    fn bad_magic_is_detected() {
        let err = decode_part(b"NOTAPART........").unwrap_err();
        assert!(matches!(err, DmgrError::Corrupt(_)));
    }

    #[test]
    fn n_rows_mismatch_is_rejected_on_encode() {
        let d = doc();
        let block = sample_block(&d);
        let err = encode_part(&attrs(&d, 99), &block).unwrap_err();
        assert!(matches!(err, DmgrError::Internal(_)));
    }
}
