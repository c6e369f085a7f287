//! Padded columnar blocks.
//!
//! A `RowBlock` is the sealed, byte-stable form of a batch of rows: one
//! padded column per field (little-endian throughout) plus one meta array
//! per jagged field. The content hasher and the part container both
//! consume this representation, which is what makes "hash from memory" and
//! "hash from file" bit-identical.

use dmgr_error::{DmgrError, Result};
use dmgr_types::{BaseDtype, Cell, FieldSpec, SchemaDocument};

use crate::canon::PreparedRow;

/// Payload of one field column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    /// Raw little-endian bytes, `n_rows * elems_per_row * elem_size`.
    Fixed(Vec<u8>),
    /// NFC-normalized text elements, `n_rows * elems_per_row`, padded with
    /// empty strings.
    Text(Vec<String>),
}

/// Jagged meta array for one field, flattened row-major.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaColumn {
    Len16(Vec<u16>),
    Len32(Vec<u32>),
    Shape16(Vec<i16>),
    Shape32(Vec<i32>),
}

impl MetaColumn {
    /// Raw little-endian byte image, the form that is hashed and stored.
    #[must_use]
    pub fn raw_le_bytes(&self) -> Vec<u8> {
        match self {
            Self::Len16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::Len32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::Shape16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::Shape32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    /// Meta column name suffix: `_len` for 1-D, `_shape` for N-D.
    #[must_use]
    pub const fn suffix(&self) -> &'static str {
        match self {
            Self::Len16(_) | Self::Len32(_) => "_len",
            Self::Shape16(_) | Self::Shape32(_) => "_shape",
        }
    }
}

/// One padded column plus its canonical spec and optional jagged meta.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldColumn {
    pub spec: FieldSpec,
    pub data: ColumnData,
    pub meta: Option<MetaColumn>,
}

impl FieldColumn {
    /// Bytes of one row of a fixed-width column.
    pub fn fixed_row_bytes(&self, row: usize) -> Result<&[u8]> {
        let ColumnData::Fixed(bytes) = &self.data else {
            return Err(DmgrError::internal(format!(
                "field {:?} is textual, no fixed bytes",
                self.spec.name
            )));
        };
        let elem_size = self
            .spec
            .dtype
            .elem_size()
            .ok_or_else(|| DmgrError::internal("text dtype in fixed column"))?;
        let stride = self.spec.elems_per_row() * elem_size;
        bytes
            .get(row * stride..(row + 1) * stride)
            .ok_or_else(|| DmgrError::internal(format!("row {row} out of column bounds")))
    }

    /// Text elements of one row of a textual column.
    pub fn text_row(&self, row: usize) -> Result<&[String]> {
        let ColumnData::Text(cells) = &self.data else {
            return Err(DmgrError::internal(format!(
                "field {:?} is fixed-width, no text cells",
                self.spec.name
            )));
        };
        let epr = self.spec.elems_per_row();
        cells
            .get(row * epr..(row + 1) * epr)
            .ok_or_else(|| DmgrError::internal(format!("row {row} out of column bounds")))
    }
}

/// A sealed columnar block.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBlock {
    pub n_rows: usize,
    /// Columns in `dtype_descr` order.
    pub fields: Vec<FieldColumn>,
}

/// Accumulates prepared rows and pads them into a [`RowBlock`].
///
/// The document handed in must be final for this batch: canonical jagged
/// maxima settled and any text widening already applied.
pub struct RowBlockBuilder<'a> {
    doc: &'a SchemaDocument,
    rows: Vec<PreparedRow>,
}

impl<'a> RowBlockBuilder<'a> {
    #[must_use]
    pub const fn new(doc: &'a SchemaDocument) -> Self {
        Self {
            doc,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: PreparedRow) {
        self.rows.push(row);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Pad and assemble. Consumes the builder.
    pub fn build(self) -> Result<RowBlock> {
        build_block(self.doc, &self.rows)
    }
}

/// Pad a batch of prepared rows into a columnar block.
pub fn build_block(doc: &SchemaDocument, rows: &[PreparedRow]) -> Result<RowBlock> {
    let n_rows = rows.len();
    let mut fields = Vec::with_capacity(doc.dtype_descr.len());

    for (fi, spec) in doc.dtype_descr.iter().enumerate() {
        let epr = spec.elems_per_row();
        let vary = doc.jagged.get(&spec.name).map(|j| j.vary_dims.as_slice());

        let mut data = match spec.dtype.elem_size() {
            Some(elem_size) => ColumnData::Fixed(vec![0_u8; n_rows * epr * elem_size]),
            None => ColumnData::Text(vec![String::new(); n_rows * epr]),
        };

        for (row_idx, row) in rows.iter().enumerate() {
            let cell = row.cells.get(fi).ok_or_else(|| {
                DmgrError::internal(format!("prepared row missing field index {fi}"))
            })?;
            fill_row(spec, &mut data, row_idx, &cell.value)?;
        }

        let meta = match vary {
            Some(vary_dims) => Some(build_meta(spec, vary_dims, rows, fi)?),
            None => None,
        };

        fields.push(FieldColumn {
            spec: spec.clone(),
            data,
            meta,
        });
    }

    Ok(RowBlock { n_rows, fields })
}

/// Write one row's cell into its padded row-major slot.
fn fill_row(spec: &FieldSpec, data: &mut ColumnData, row_idx: usize, cell: &Cell) -> Result<()> {
    let epr = spec.elems_per_row();
    if spec.shape.is_empty() {
        return write_elem(spec, data, row_idx * epr, cell);
    }
    fill_nested(spec, data, row_idx * epr, 0, cell)
}

fn fill_nested(
    spec: &FieldSpec,
    data: &mut ColumnData,
    base: usize,
    dim: usize,
    cell: &Cell,
) -> Result<()> {
    if dim == spec.shape.len() {
        return write_elem(spec, data, base, cell);
    }
    let Cell::List(items) = cell else {
        return Err(DmgrError::internal(format!(
            "field {:?}: scalar at depth {dim}, expected list",
            spec.name
        )));
    };
    let inner_stride: usize = spec.shape[dim + 1..].iter().product();
    for (i, item) in items.iter().enumerate() {
        fill_nested(spec, data, base + i * inner_stride, dim + 1, item)?;
    }
    Ok(())
}

fn write_elem(spec: &FieldSpec, data: &mut ColumnData, elem_idx: usize, cell: &Cell) -> Result<()> {
    match data {
        ColumnData::Text(cells) => {
            let Cell::Text(s) = cell else {
                return Err(DmgrError::internal("non-text element in text column"));
            };
            let slot = cells
                .get_mut(elem_idx)
                .ok_or_else(|| DmgrError::internal("element index out of bounds"))?;
            slot.clone_from(s);
            Ok(())
        }
        ColumnData::Fixed(bytes) => {
            let elem_size = spec
                .dtype
                .elem_size()
                .ok_or_else(|| DmgrError::internal("text dtype in fixed column"))?;
            let offset = elem_idx * elem_size;
            let slot = bytes
                .get_mut(offset..offset + elem_size)
                .ok_or_else(|| DmgrError::internal("element offset out of bounds"))?;
            encode_scalar(spec.dtype, cell, slot)
        }
    }
}

/// Little-endian scalar encoding. The canonicalizer already range-checked
/// integers and coerced ints into floats, so a variant mismatch here is a
/// bug, not bad input.
fn encode_scalar(dtype: BaseDtype, cell: &Cell, out: &mut [u8]) -> Result<()> {
    let bug = || DmgrError::internal(format!("cell variant does not match dtype {dtype}"));
    match dtype {
        BaseDtype::Bool => match cell {
            Cell::Bool(b) => {
                out[0] = u8::from(*b);
                Ok(())
            }
            _ => Err(bug()),
        },
        BaseDtype::Int8 => int_bytes(cell, out, |v| (v as i8).to_le_bytes().to_vec()),
        BaseDtype::Int16 => int_bytes(cell, out, |v| (v as i16).to_le_bytes().to_vec()),
        BaseDtype::Int32 => int_bytes(cell, out, |v| (v as i32).to_le_bytes().to_vec()),
        BaseDtype::Int64 => int_bytes(cell, out, |v| v.to_le_bytes().to_vec()),
        BaseDtype::UInt8 => int_bytes(cell, out, |v| (v as u8).to_le_bytes().to_vec()),
        BaseDtype::UInt16 => int_bytes(cell, out, |v| (v as u16).to_le_bytes().to_vec()),
        BaseDtype::UInt32 => int_bytes(cell, out, |v| (v as u32).to_le_bytes().to_vec()),
        BaseDtype::UInt64 => int_bytes(cell, out, |v| (v as u64).to_le_bytes().to_vec()),
        BaseDtype::Float32 => match cell {
            Cell::Real(v) => {
                out.copy_from_slice(&(*v as f32).to_le_bytes());
                Ok(())
            }
            _ => Err(bug()),
        },
        BaseDtype::Float64 => match cell {
            Cell::Real(v) => {
                out.copy_from_slice(&v.to_le_bytes());
                Ok(())
            }
            _ => Err(bug()),
        },
        BaseDtype::Utf8 { .. } => Err(bug()),
    }
}

fn int_bytes(cell: &Cell, out: &mut [u8], enc: impl Fn(i64) -> Vec<u8>) -> Result<()> {
    match cell {
        Cell::Int(v) => {
            out.copy_from_slice(&enc(*v));
            Ok(())
        }
        _ => Err(DmgrError::internal("non-integer element in integer column")),
    }
}

/// Build the jagged meta array for one field. Width is the smallest that
/// fits the canonical maximum, per the schema contract.
fn build_meta(
    spec: &FieldSpec,
    vary_dims: &[usize],
    rows: &[PreparedRow],
    fi: usize,
) -> Result<MetaColumn> {
    let extent_of = |row: &PreparedRow, dim: usize| -> Result<usize> {
        row.cells
            .get(fi)
            .and_then(|c| c.extents.get(dim).copied())
            .ok_or_else(|| DmgrError::internal("prepared cell missing extent"))
    };

    if let [dim] = vary_dims {
        let canon_max = spec.shape[*dim];
        if canon_max <= usize::from(u16::MAX) {
            let mut lens = Vec::with_capacity(rows.len());
            for row in rows {
                lens.push(extent_of(row, *dim)? as u16);
            }
            Ok(MetaColumn::Len16(lens))
        } else {
            let mut lens = Vec::with_capacity(rows.len());
            for row in rows {
                lens.push(extent_of(row, *dim)? as u32);
            }
            Ok(MetaColumn::Len32(lens))
        }
    } else {
        let fits_i16 = vary_dims
            .iter()
            .all(|&d| spec.shape[d] <= i16::MAX as usize);
        if fits_i16 {
            let mut shapes = Vec::with_capacity(rows.len() * vary_dims.len());
            for row in rows {
                for &d in vary_dims {
                    shapes.push(extent_of(row, d)? as i16);
                }
            }
            Ok(MetaColumn::Shape16(shapes))
        } else {
            let mut shapes = Vec::with_capacity(rows.len() * vary_dims.len());
            for row in rows {
                for &d in vary_dims {
                    shapes.push(extent_of(row, d)? as i32);
                }
            }
            Ok(MetaColumn::Shape32(shapes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canon::prepare_row;
    use dmgr_types::schema_doc::{EncryptionPolicy, JaggedSpec, KeyField, PartConfig};
    use dmgr_types::KeyType;
    use std::collections::BTreeMap;

    fn doc(seq_max: usize) -> SchemaDocument {
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
                    shape: vec![seq_max],
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

    fn row(value: f64, seq: &[i64]) -> BTreeMap<String, Cell> {
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

    #[test]
    fn pads_jagged_rows_with_zeros() {
        let d = doc(4);
        let mut builder = RowBlockBuilder::new(&d);
        for (v, s) in [(1.0, &[1_i64, 2][..]), (2.0, &[1, 2, 3, 4]), (3.0, &[])] {
            builder.push(prepare_row(&d, true, row(v, s)).unwrap());
        }
        let block = builder.build().unwrap();
        assert_eq!(block.n_rows, 3);

        let seq = &block.fields[1];
        assert_eq!(
            seq.meta,
            Some(MetaColumn::Len16(vec![2, 4, 0])),
            "seq_len must record observed extents"
        );
        // Row 0 is [1, 2, 0, 0] as i32 LE.
        let row0 = seq.fixed_row_bytes(0).unwrap();
        assert_eq!(row0, &[1, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        // Row 2 is all padding.
        assert_eq!(seq.fixed_row_bytes(2).unwrap(), &[0_u8; 16]);
    }

    #[test]
    fn scalar_column_layout() {
        let d = doc(1);
        let mut builder = RowBlockBuilder::new(&d);
        builder.push(prepare_row(&d, true, row(1.5, &[7])).unwrap());
        let block = builder.build().unwrap();
        let value = &block.fields[0];
        assert_eq!(value.fixed_row_bytes(0).unwrap(), &1.5_f64.to_le_bytes());
        assert!(value.meta.is_none());
    }

    #[test]
    fn meta_widens_to_u32_for_large_canon() {
        let d = doc(100_000);
        let mut builder = RowBlockBuilder::new(&d);
        builder.push(prepare_row(&d, true, row(0.0, &[1, 2])).unwrap());
        let block = builder.build().unwrap();
        assert_eq!(
            block.fields[1].meta,
            Some(MetaColumn::Len32(vec![2])),
            "canonical max above u16 forces the wide meta dtype"
        );
    }

    #[test]
    fn meta_bytes_are_little_endian() {
        let meta = MetaColumn::Len16(vec![2, 4, 0]);
        assert_eq!(meta.raw_le_bytes(), vec![2, 0, 4, 0, 0, 0]);
        assert_eq!(meta.suffix(), "_len");
        let shape = MetaColumn::Shape16(vec![1, -1]);
        assert_eq!(shape.raw_le_bytes(), vec![1, 0, 255, 255]);
        assert_eq!(shape.suffix(), "_shape");
    }
}
