//! Row validation against the canonical dtype.
//!
//! A prepared row is a validated, NFC-normalized copy of the user's cells
//! together with the observed per-dim extents of every array field. Padding
//! happens later, at seal time, once the canonical maxima are settled.

use std::collections::BTreeMap;

use dmgr_error::{DmgrError, Result};
use dmgr_types::{BaseDtype, Cell, FieldSpec, JaggedSpec, SchemaDocument};
use unicode_normalization::UnicodeNormalization;

/// One validated field value plus its observed extents.
#[derive(Debug, Clone)]
pub struct PreparedCell {
    /// Validated cell, text NFC-normalized. Scalar fields keep the scalar
    /// variant; array fields keep nested lists.
    pub value: Cell,
    /// Observed extent per dim (full rank; empty for scalars). Non-vary
    /// dims always equal the canonical extent.
    pub extents: Vec<usize>,
    /// Largest UTF-8 byte length among text elements; 0 for non-text.
    pub max_text_bytes: u32,
}

/// One validated row in `dtype_descr` field order.
#[derive(Debug, Clone)]
pub struct PreparedRow {
    pub cells: Vec<PreparedCell>,
    /// Rough in-memory footprint, used for spill accounting.
    pub est_bytes: usize,
}

/// Validate one row against `doc`.
///
/// `locked` selects the post-lock rules: a jagged extent above the
/// canonical maximum raises `DataExceedsCanon` instead of growing it.
/// Text wider than canon is accepted here in both states; the registry
/// decides whether that becomes a widening.
pub fn prepare_row(
    doc: &SchemaDocument,
    locked: bool,
    mut row: BTreeMap<String, Cell>,
) -> Result<PreparedRow> {
    let mut cells = Vec::with_capacity(doc.dtype_descr.len());
    let mut est_bytes = 0_usize;

    for field in &doc.dtype_descr {
        let cell = row.remove(&field.name).ok_or_else(|| {
            DmgrError::SchemaMismatch(format!("row is missing field {:?}", field.name))
        })?;
        let jagged = doc.jagged.get(&field.name);
        let prepared = prepare_cell(field, jagged, locked, cell)?;
        est_bytes += cell_footprint(field, &prepared);
        cells.push(prepared);
    }
    if let Some(extra) = row.keys().next() {
        return Err(DmgrError::SchemaMismatch(format!(
            "row carries undeclared field {extra:?}"
        )));
    }

    Ok(PreparedRow { cells, est_bytes })
}

fn cell_footprint(field: &FieldSpec, cell: &PreparedCell) -> usize {
    let elems: usize = if field.shape.is_empty() {
        1
    } else {
        cell.extents.iter().product::<usize>().max(1)
    };
    let per_elem = field.dtype.elem_size().unwrap_or(cell.max_text_bytes as usize + 4);
    elems * per_elem + 48
}

fn prepare_cell(
    field: &FieldSpec,
    jagged: Option<&JaggedSpec>,
    locked: bool,
    cell: Cell,
) -> Result<PreparedCell> {
    if field.shape.is_empty() {
        let (value, text_bytes) = check_scalar(field, &field.name, cell)?;
        return Ok(PreparedCell {
            value,
            extents: Vec::new(),
            max_text_bytes: text_bytes,
        });
    }

    let vary: &[usize] = jagged.map_or(&[], |j| j.vary_dims.as_slice());
    let mut extents = vec![0_usize; field.shape.len()];
    let mut max_text_bytes = 0_u32;
    let value = check_array(field, vary, cell, 0, &mut extents, &mut max_text_bytes)?;

    for (dim, (&observed, &canon)) in extents.iter().zip(&field.shape).enumerate() {
        if vary.contains(&dim) {
            if locked && observed > canon {
                return Err(DmgrError::DataExceedsCanon(format!(
                    "field {:?} dim {dim} observed {observed} exceeds canonical {canon}",
                    field.name
                )));
            }
        } else if observed != canon {
            return Err(DmgrError::SchemaMismatch(format!(
                "field {:?} dim {dim} has extent {observed}, expected {canon}",
                field.name
            )));
        }
    }

    Ok(PreparedCell {
        value,
        extents,
        max_text_bytes,
    })
}

/// Walk a nested list, recording per-dim extents and rejecting ragged
/// structure within the row (only whole dims vary, never siblings).
fn check_array(
    field: &FieldSpec,
    vary: &[usize],
    cell: Cell,
    dim: usize,
    extents: &mut [usize],
    max_text_bytes: &mut u32,
) -> Result<Cell> {
    let rank = field.shape.len();
    if dim == rank {
        let (value, text_bytes) = check_scalar(field, &field.name, cell)?;
        *max_text_bytes = (*max_text_bytes).max(text_bytes);
        return Ok(value);
    }

    let Cell::List(items) = cell else {
        return Err(DmgrError::SchemaMismatch(format!(
            "field {:?} expects a rank-{rank} array, found a scalar at depth {dim}",
            field.name
        )));
    };

    if extents[dim] == 0 && items.is_empty() {
        // Deeper extents of an empty branch: vary dims stay 0, fixed dims
        // report canonical so the non-vary check passes.
        for d in dim + 1..rank {
            if !vary.contains(&d) {
                extents[d] = field.shape[d];
            }
        }
    } else if extents[dim] != 0 && extents[dim] != items.len() {
        return Err(DmgrError::SchemaMismatch(format!(
            "field {:?} is ragged within one row at dim {dim}",
            field.name
        )));
    }
    extents[dim] = extents[dim].max(items.len());

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(check_array(field, vary, item, dim + 1, extents, max_text_bytes)?);
    }
    Ok(Cell::List(out))
}

/// Validate one scalar element against the field dtype. Text is NFC
/// normalized here; integers are range-checked; ints coerce into floats
/// but never the reverse.
fn check_scalar(field: &FieldSpec, name: &str, cell: Cell) -> Result<(Cell, u32)> {
    let mismatch = |got: &str| {
        DmgrError::SchemaMismatch(format!(
            "field {name:?} expects {}, got {got}",
            field.dtype
        ))
    };
    match field.dtype {
        BaseDtype::Bool => match cell {
            Cell::Bool(_) => Ok((cell, 0)),
            other => Err(mismatch(kind_name(&other))),
        },
        BaseDtype::Int8 => checked_int(cell, i64::from(i8::MIN), i64::from(i8::MAX), mismatch),
        BaseDtype::Int16 => checked_int(cell, i64::from(i16::MIN), i64::from(i16::MAX), mismatch),
        BaseDtype::Int32 => checked_int(cell, i64::from(i32::MIN), i64::from(i32::MAX), mismatch),
        BaseDtype::Int64 => checked_int(cell, i64::MIN, i64::MAX, mismatch),
        BaseDtype::UInt8 => checked_int(cell, 0, i64::from(u8::MAX), mismatch),
        BaseDtype::UInt16 => checked_int(cell, 0, i64::from(u16::MAX), mismatch),
        BaseDtype::UInt32 => checked_int(cell, 0, i64::from(u32::MAX), mismatch),
        BaseDtype::UInt64 => checked_int(cell, 0, i64::MAX, mismatch),
        BaseDtype::Float32 | BaseDtype::Float64 => match cell {
            Cell::Real(_) => Ok((cell, 0)),
            Cell::Int(v) => Ok((Cell::Real(v as f64), 0)),
            other => Err(mismatch(kind_name(&other))),
        },
        BaseDtype::Utf8 { .. } => match cell {
            Cell::Text(s) => {
                let nfc: String = s.nfc().collect();
                let bytes = u32::try_from(nfc.len())
                    .map_err(|_| DmgrError::SchemaMismatch(format!("text in {name:?} too long")))?;
                Ok((Cell::Text(nfc), bytes))
            }
            other => Err(mismatch(kind_name(&other))),
        },
    }
}

fn checked_int(
    cell: Cell,
    min: i64,
    max: i64,
    mismatch: impl Fn(&str) -> DmgrError,
) -> Result<(Cell, u32)> {
    match cell {
        Cell::Int(v) if (min..=max).contains(&v) => Ok((Cell::Int(v), 0)),
        Cell::Int(v) => Err(DmgrError::SchemaMismatch(format!(
            "integer {v} out of range {min}..={max}"
        ))),
        other => Err(mismatch(kind_name(&other))),
    }
}

const fn kind_name(cell: &Cell) -> &'static str {
    match cell {
        Cell::Bool(_) => "bool",
        Cell::Int(_) => "int",
        Cell::Real(_) => "real",
        Cell::Text(_) => "text",
        Cell::List(_) => "list",
    }
}
