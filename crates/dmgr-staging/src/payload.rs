//! Self-describing staged payload frames.
//!
//! A staged group serializes as a 5-byte magic+version header followed by
//! `(subset_keys, rows, is_group)`. The frame is binary (not JSON) because
//! key values and cells legally contain NaN and infinities. All integers
//! little-endian.

use std::collections::BTreeMap;

use dmgr_error::{DmgrError, Result};
use dmgr_types::{Cell, KeyValue};

const MAGIC: &[u8; 4] = b"DMGQ";
const VERSION: u8 = 1;

const KV_REAL: u8 = 0;
const KV_INTEGER: u8 = 1;
const KV_TEXT: u8 = 2;
const KV_BOOLEAN: u8 = 3;

const CELL_BOOL: u8 = 0;
const CELL_INT: u8 = 1;
const CELL_REAL: u8 = 2;
const CELL_TEXT: u8 = 3;
const CELL_LIST: u8 = 4;

/// One decoded staged group.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedPayload {
    /// Raw subset keys, enough to re-derive identity at compaction time.
    pub subset_keys: Vec<(String, KeyValue)>,
    /// Rows as field-name → cell maps.
    pub rows: Vec<BTreeMap<String, Cell>>,
    /// Whether this frame was spilled as a group (buffer flush) rather
    /// than a single accepted row.
    pub is_group: bool,
}

/// Encode a staged group into its frame.
#[must_use]
pub fn encode(payload: &StagedPayload) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(MAGIC);
    out.push(VERSION);

    out.extend_from_slice(&(payload.subset_keys.len() as u32).to_le_bytes());
    for (name, value) in &payload.subset_keys {
        put_str(&mut out, name);
        match value {
            KeyValue::Real(v) => {
                out.push(KV_REAL);
                out.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            KeyValue::Integer(v) => {
                out.push(KV_INTEGER);
                out.extend_from_slice(&v.to_le_bytes());
            }
            KeyValue::Text(s) => {
                out.push(KV_TEXT);
                put_str(&mut out, s);
            }
            KeyValue::Boolean(b) => {
                out.push(KV_BOOLEAN);
                out.push(u8::from(*b));
            }
        }
    }

    out.extend_from_slice(&(payload.rows.len() as u32).to_le_bytes());
    for row in &payload.rows {
        out.extend_from_slice(&(row.len() as u32).to_le_bytes());
        for (field, cell) in row {
            put_str(&mut out, field);
            put_cell(&mut out, cell);
        }
    }

    out.push(u8::from(payload.is_group));
    out
}

/// Decode a frame. Fails with `Corrupt` on any structural problem.
pub fn decode(bytes: &[u8]) -> Result<StagedPayload> {
    let mut cur = Reader { bytes, pos: 0 };
    if cur.take(4)? != MAGIC {
        return Err(DmgrError::Corrupt("bad staging frame magic".to_owned()));
    }
    let version = cur.u8()?;
    if version != VERSION {
        return Err(DmgrError::Corrupt(format!(
            "unsupported staging frame version {version}"
        )));
    }

    let n_keys = cur.u32()? as usize;
    let mut subset_keys = Vec::with_capacity(n_keys);
    for _ in 0..n_keys {
        let name = cur.string()?;
        let value = match cur.u8()? {
            KV_REAL => KeyValue::Real(f64::from_bits(cur.u64()?)),
            KV_INTEGER => KeyValue::Integer(cur.i64()?),
            KV_TEXT => KeyValue::Text(cur.string()?),
            KV_BOOLEAN => KeyValue::Boolean(cur.u8()? != 0),
            other => {
                return Err(DmgrError::Corrupt(format!(
                    "unknown key-value tag {other}"
                )))
            }
        };
        subset_keys.push((name, value));
    }

    let n_rows = cur.u32()? as usize;
    let mut rows = Vec::with_capacity(n_rows);
    for _ in 0..n_rows {
        let n_fields = cur.u32()? as usize;
        let mut row = BTreeMap::new();
        for _ in 0..n_fields {
            let field = cur.string()?;
            let cell = get_cell(&mut cur, 0)?;
            row.insert(field, cell);
        }
        rows.push(row);
    }

    let is_group = cur.u8()? != 0;
    if cur.pos != bytes.len() {
        return Err(DmgrError::Corrupt(
            "trailing bytes in staging frame".to_owned(),
        ));
    }
    Ok(StagedPayload {
        subset_keys,
        rows,
        is_group,
    })
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn put_cell(out: &mut Vec<u8>, cell: &Cell) {
    match cell {
        Cell::Bool(b) => {
            out.push(CELL_BOOL);
            out.push(u8::from(*b));
        }
        Cell::Int(v) => {
            out.push(CELL_INT);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Cell::Real(v) => {
            out.push(CELL_REAL);
            out.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Cell::Text(s) => {
            out.push(CELL_TEXT);
            put_str(out, s);
        }
        Cell::List(items) => {
            out.push(CELL_LIST);
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                put_cell(out, item);
            }
        }
    }
}

/// Nesting bound on decoded lists, well past any sane rank.
const MAX_CELL_DEPTH: usize = 32;

fn get_cell(cur: &mut Reader<'_>, depth: usize) -> Result<Cell> {
    if depth > MAX_CELL_DEPTH {
        return Err(DmgrError::Corrupt("cell nesting too deep".to_owned()));
    }
    match cur.u8()? {
        CELL_BOOL => Ok(Cell::Bool(cur.u8()? != 0)),
        CELL_INT => Ok(Cell::Int(cur.i64()?)),
        CELL_REAL => Ok(Cell::Real(f64::from_bits(cur.u64()?))),
        CELL_TEXT => Ok(Cell::Text(cur.string()?)),
        CELL_LIST => {
            let n = cur.u32()? as usize;
            let mut items = Vec::with_capacity(n.min(1024));
            for _ in 0..n {
                items.push(get_cell(cur, depth + 1)?);
            }
            Ok(Cell::List(items))
        }
        other => Err(DmgrError::Corrupt(format!("unknown cell tag {other}"))),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.bytes.len())
            .ok_or_else(|| DmgrError::Corrupt("truncated staging frame".to_owned()))?;
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

    fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DmgrError::Corrupt("non-UTF-8 string in staging frame".to_owned()))
    }
}
