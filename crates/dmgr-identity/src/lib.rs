//! Deterministic subset identity.
//!
//! A dict of user-supplied key values maps to an *identity tuple* and a
//! *subset UUID* with no catalog lookup: REAL keys contribute a specials
//! code and a quantized integer, INTEGER and BOOLEAN keys contribute their
//! value, TEXT keys contribute their NFC form. The UUID is the blake2b-128
//! digest of the comma-joined stringified tuple, so it is identical across
//! platforms and runs.

use std::collections::BTreeMap;
use std::fmt;

use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use dmgr_error::{DmgrError, Result};
use dmgr_types::{KeyType, KeyValue, SchemaDocument};
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

type Blake2b128 = Blake2b<U16>;

/// IEEE-754 classification of a REAL key value.
///
/// The discriminants are the `k_s` identity-column codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum SpecialClass {
    Normal = 0,
    Nan = 1,
    PosInf = 2,
    NegInf = 3,
}

impl SpecialClass {
    /// The `k_s` column value.
    #[must_use]
    pub const fn code(self) -> i64 {
        self as i64
    }
}

/// Classify a REAL value from its bit pattern.
///
/// `Normal` here means "finite" (zeros and subnormals included); only the
/// all-ones exponent maps to a special code.
#[must_use]
pub fn classify_real(v: f64) -> SpecialClass {
    let bits = v.to_bits();
    let exponent = (bits >> 52) & 0x7ff;
    if exponent != 0x7ff {
        return SpecialClass::Normal;
    }
    let mantissa = bits & 0x000f_ffff_ffff_ffff;
    if mantissa != 0 {
        SpecialClass::Nan
    } else if bits >> 63 == 0 {
        SpecialClass::PosInf
    } else {
        SpecialClass::NegInf
    }
}

/// Quantize a finite REAL value: `round(v * scale)` with ties to even.
pub fn quantize(v: f64, scale: f64) -> Result<i64> {
    let scaled = (v * scale).round_ties_even();
    if !scaled.is_finite() || scaled < -9.007_199_254_740_992e15 || scaled > 9.007_199_254_740_992e15
    {
        return Err(DmgrError::InvalidKeyValue(format!(
            "quantized value {v} * {scale} does not fit an exact integer"
        )));
    }
    Ok(scaled as i64)
}

/// One item of the identity tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityItem {
    Int(i64),
    Text(String),
}

impl fmt::Display for IdentityItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Ordered identity tuple for one subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityTuple {
    items: Vec<IdentityItem>,
}

impl IdentityTuple {
    #[must_use]
    pub fn items(&self) -> &[IdentityItem] {
        &self.items
    }

    /// The fixed stringification: items joined by `,`.
    #[must_use]
    pub fn joined(&self) -> String {
        let mut out = String::new();
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            match item {
                IdentityItem::Int(v) => {
                    out.push_str(&v.to_string());
                }
                IdentityItem::Text(s) => out.push_str(s),
            }
        }
        out
    }

    /// `UUID(blake2b-128(utf8(joined)))`.
    #[must_use]
    pub fn subset_uuid(&self) -> Uuid {
        let mut hasher = Blake2b128::new();
        hasher.update(self.joined().as_bytes());
        let digest: [u8; 16] = hasher.finalize().into();
        Uuid::from_bytes(digest)
    }
}

/// Per-key identity breakdown, the shape the catalog binds into its
/// identity columns.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyIdentityCol {
    Real { name: String, raw: f64, s: i64, q: i64 },
    Integer { name: String, v: i64 },
    Boolean { name: String, v: bool },
    Text { name: String, v: String },
}

impl KeyIdentityCol {
    /// The key name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Real { name, .. }
            | Self::Integer { name, .. }
            | Self::Boolean { name, .. }
            | Self::Text { name, .. } => name,
        }
    }
}

/// The result of normalizing one key dict.
#[derive(Debug, Clone)]
pub struct NormalizedKeys {
    pub subset_uuid: Uuid,
    pub identity: IdentityTuple,
    /// Per-key breakdown in `key_order`, TEXT already NFC-normalized. The
    /// catalog preserves raw REAL values for range queries.
    pub cols: Vec<KeyIdentityCol>,
}

impl NormalizedKeys {
    /// JSON snapshot of the raw keys, in `key_order`. REAL specials encode
    /// as the strings `"NaN"`, `"Infinity"`, `"-Infinity"` since JSON has
    /// no representation for them.
    pub fn raw_keys_json(&self) -> Result<String> {
        let mut map = serde_json::Map::new();
        for col in &self.cols {
            let value = match col {
                KeyIdentityCol::Real { raw, .. } => serde_json::Number::from_f64(*raw)
                    .map_or_else(
                        || {
                            let tag = if raw.is_nan() {
                                "NaN"
                            } else if *raw > 0.0 {
                                "Infinity"
                            } else {
                                "-Infinity"
                            };
                            serde_json::Value::String(tag.to_owned())
                        },
                        serde_json::Value::Number,
                    ),
                KeyIdentityCol::Integer { v, .. } => serde_json::Value::from(*v),
                KeyIdentityCol::Boolean { v, .. } => serde_json::Value::from(*v),
                KeyIdentityCol::Text { v, .. } => serde_json::Value::from(v.clone()),
            };
            map.insert(col.name().to_owned(), value);
        }
        serde_json::to_string(&serde_json::Value::Object(map)).map_err(DmgrError::from)
    }
}

/// Parse a raw-keys JSON snapshot (the [`NormalizedKeys::raw_keys_json`]
/// form) back into a key dict, resolving the special-string encodings of
/// non-finite REALs.
pub fn raw_keys_from_json(doc: &SchemaDocument, json: &str) -> Result<BTreeMap<String, KeyValue>> {
    let parsed: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)?;
    let mut out = BTreeMap::new();
    for field in &doc.key_schema {
        let value = parsed.get(&field.name).ok_or_else(|| {
            DmgrError::Corrupt(format!("raw key snapshot missing {:?}", field.name))
        })?;
        let bad = || {
            DmgrError::Corrupt(format!(
                "raw key snapshot has wrong type for {:?}",
                field.name
            ))
        };
        let kv = match field.ktype {
            KeyType::Real => match value {
                serde_json::Value::Number(n) => KeyValue::Real(n.as_f64().ok_or_else(bad)?),
                serde_json::Value::String(s) => match s.as_str() {
                    "NaN" => KeyValue::Real(f64::NAN),
                    "Infinity" => KeyValue::Real(f64::INFINITY),
                    "-Infinity" => KeyValue::Real(f64::NEG_INFINITY),
                    _ => return Err(bad()),
                },
                _ => return Err(bad()),
            },
            KeyType::Integer => KeyValue::Integer(value.as_i64().ok_or_else(bad)?),
            KeyType::Boolean => KeyValue::Boolean(value.as_bool().ok_or_else(bad)?),
            KeyType::Text => KeyValue::Text(value.as_str().ok_or_else(bad)?.to_owned()),
        };
        out.insert(field.name.clone(), kv);
    }
    Ok(out)
}

/// Pure key normalizer bound to one schema document.
pub struct KeyNormalizer<'a> {
    doc: &'a SchemaDocument,
}

impl<'a> KeyNormalizer<'a> {
    #[must_use]
    pub const fn new(doc: &'a SchemaDocument) -> Self {
        Self { doc }
    }

    /// Normalize a key dict into its identity tuple and subset UUID.
    pub fn normalize(&self, keys: &BTreeMap<String, KeyValue>) -> Result<NormalizedKeys> {
        for name in keys.keys() {
            if self.doc.key_field(name).is_none() {
                return Err(DmgrError::InvalidKeyValue(format!(
                    "key {name:?} is not declared in the key schema"
                )));
            }
        }

        let mut items = Vec::with_capacity(self.doc.key_order.len() * 2);
        let mut cols = Vec::with_capacity(self.doc.key_order.len());
        for name in &self.doc.key_order {
            let field = self
                .doc
                .key_field(name)
                .ok_or_else(|| DmgrError::internal(format!("key_order names unknown key {name}")))?;
            let value = keys.get(name).ok_or_else(|| {
                DmgrError::InvalidKeyValue(format!("missing key {name:?}"))
            })?;
            if value.key_type() != field.ktype {
                return Err(DmgrError::InvalidKeyValue(format!(
                    "key {name:?} expects {} but got {}",
                    field.ktype.name(),
                    value.key_type().name()
                )));
            }
            match value {
                KeyValue::Real(v) => {
                    let class = classify_real(*v);
                    let q = if class == SpecialClass::Normal {
                        let scale = self.doc.quantization.get(name).copied().ok_or_else(|| {
                            DmgrError::InvalidKeyValue(format!(
                                "REAL key {name:?} has no quantization scale"
                            ))
                        })?;
                        quantize(*v, scale)?
                    } else {
                        0
                    };
                    items.push(IdentityItem::Int(class.code()));
                    items.push(IdentityItem::Int(q));
                    cols.push(KeyIdentityCol::Real {
                        name: name.clone(),
                        raw: *v,
                        s: class.code(),
                        q,
                    });
                }
                KeyValue::Integer(v) => {
                    items.push(IdentityItem::Int(*v));
                    cols.push(KeyIdentityCol::Integer {
                        name: name.clone(),
                        v: *v,
                    });
                }
                KeyValue::Boolean(b) => {
                    items.push(IdentityItem::Int(i64::from(*b)));
                    cols.push(KeyIdentityCol::Boolean {
                        name: name.clone(),
                        v: *b,
                    });
                }
                KeyValue::Text(s) => {
                    let nfc: String = s.nfc().collect();
                    if nfc.contains(',') {
                        return Err(DmgrError::InvalidKeyValue(format!(
                            "TEXT key {name:?} contains a comma"
                        )));
                    }
                    items.push(IdentityItem::Text(nfc.clone()));
                    cols.push(KeyIdentityCol::Text {
                        name: name.clone(),
                        v: nfc,
                    });
                }
            }
        }

        let identity = IdentityTuple { items };
        let subset_uuid = identity.subset_uuid();
        Ok(NormalizedKeys {
            subset_uuid,
            identity,
            cols,
        })
    }
}
