//! The immutable schema document a dataset carries.
//!
//! The document's canonical JSON form is what the schema fingerprint is
//! computed over, so serialization here must be deterministic: struct
//! fields serialize in declaration order, maps are `BTreeMap` (sorted),
//! and `dtype_descr` keeps author order, which is authoritative.

use std::collections::BTreeMap;
use std::fmt;

use dmgr_error::{DmgrError, Result};
use serde::de::Error as _;
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::keys::{is_valid_identifier, KeyType};

/// Element type of a field. Text carries its canonical maximum UTF-8 byte
/// width, the only dtype property that may ever widen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseDtype {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Utf8 { max_bytes: u32 },
}

impl BaseDtype {
    /// Fixed element size in bytes, `None` for text.
    #[must_use]
    pub const fn elem_size(self) -> Option<usize> {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => Some(1),
            Self::Int16 | Self::UInt16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::Float32 => Some(4),
            Self::Int64 | Self::UInt64 | Self::Float64 => Some(8),
            Self::Utf8 { .. } => None,
        }
    }

    /// Whether this is the textual dtype.
    #[must_use]
    pub const fn is_text(self) -> bool {
        matches!(self, Self::Utf8 { .. })
    }

    /// Canonical string code, e.g. `float64` or `utf8[32]`.
    #[must_use]
    pub fn code(self) -> String {
        match self {
            Self::Bool => "bool".to_owned(),
            Self::Int8 => "int8".to_owned(),
            Self::Int16 => "int16".to_owned(),
            Self::Int32 => "int32".to_owned(),
            Self::Int64 => "int64".to_owned(),
            Self::UInt8 => "uint8".to_owned(),
            Self::UInt16 => "uint16".to_owned(),
            Self::UInt32 => "uint32".to_owned(),
            Self::UInt64 => "uint64".to_owned(),
            Self::Float32 => "float32".to_owned(),
            Self::Float64 => "float64".to_owned(),
            Self::Utf8 { max_bytes } => format!("utf8[{max_bytes}]"),
        }
    }

    /// Parse a canonical string code back into a dtype.
    #[must_use]
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "bool" => Some(Self::Bool),
            "int8" => Some(Self::Int8),
            "int16" => Some(Self::Int16),
            "int32" => Some(Self::Int32),
            "int64" => Some(Self::Int64),
            "uint8" => Some(Self::UInt8),
            "uint16" => Some(Self::UInt16),
            "uint32" => Some(Self::UInt32),
            "uint64" => Some(Self::UInt64),
            "float32" => Some(Self::Float32),
            "float64" => Some(Self::Float64),
            _ => {
                let inner = code.strip_prefix("utf8[")?.strip_suffix(']')?;
                let max_bytes = inner.parse().ok()?;
                Some(Self::Utf8 { max_bytes })
            }
        }
    }
}

impl fmt::Display for BaseDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

/// One entry of `dtype_descr`: `(field_name, base_dtype, shape)`.
///
/// Shape is the canonical (maximum) per-row extent; empty for scalars.
/// Serializes as a JSON triple to keep the signature form compact and
/// order-stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub dtype: BaseDtype,
    pub shape: Vec<usize>,
}

impl FieldSpec {
    /// Elements per row under the canonical shape (1 for scalars).
    #[must_use]
    pub fn elems_per_row(&self) -> usize {
        self.shape.iter().product()
    }
}

impl Serialize for FieldSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut t = serializer.serialize_tuple(3)?;
        t.serialize_element(&self.name)?;
        t.serialize_element(&self.dtype.code())?;
        t.serialize_element(&self.shape)?;
        t.end()
    }
}

impl<'de> Deserialize<'de> for FieldSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (name, code, shape) = <(String, String, Vec<usize>)>::deserialize(deserializer)?;
        let dtype = BaseDtype::parse(&code)
            .ok_or_else(|| D::Error::custom(format!("unknown dtype code {code:?}")))?;
        Ok(Self { name, dtype, shape })
    }
}

/// Jagged declaration for one field: which dims vary per row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JaggedSpec {
    pub vary_dims: Vec<usize>,
}

/// One entry of the ordered key schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyField {
    pub name: String,
    #[serde(rename = "type")]
    pub ktype: KeyType,
}

/// Part sizing and compression knobs recorded in the schema document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartConfig {
    pub part_rows: u64,
    pub compression: Option<String>,
    pub compression_opts: Option<serde_json::Value>,
}

impl Default for PartConfig {
    fn default() -> Self {
        Self {
            part_rows: 100_000,
            compression: None,
            compression_opts: None,
        }
    }
}

/// Encryption mode. Only the seam is fixed today: `None` means part bytes
/// are the plaintext payload and `tag`/`nonce` are unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    #[default]
    None,
}

/// Encryption policy block of the schema document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionPolicy {
    pub mode: EncryptionMode,
    pub require_encryption: bool,
    pub key_rotation_days: u32,
}

impl Default for EncryptionPolicy {
    fn default() -> Self {
        Self {
            mode: EncryptionMode::None,
            require_encryption: false,
            key_rotation_days: 90,
        }
    }
}

/// Part-file placement scheme: flat under `parts/v<N>/` at depth 0, or
/// nested under `depth` segments of `seglen` hex chars at depth > 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageScheme {
    pub version: u32,
    pub hash: String,
    pub depth: u8,
    pub seglen: u8,
}

impl Default for StorageScheme {
    fn default() -> Self {
        Self {
            version: 1,
            hash: "sha256".to_owned(),
            depth: 0,
            seglen: 2,
        }
    }
}

impl StorageScheme {
    /// Check structural bounds: `depth ∈ 0..=8`, `seglen ∈ 1..=4`, and a
    /// known shard hash name.
    pub fn validate(&self) -> Result<()> {
        if self.depth > 8 {
            return Err(DmgrError::internal(format!(
                "storage scheme depth {} out of range 0..=8",
                self.depth
            )));
        }
        if !(1..=4).contains(&self.seglen) {
            return Err(DmgrError::internal(format!(
                "storage scheme seglen {} out of range 1..=4",
                self.seglen
            )));
        }
        if self.hash != "sha256" {
            return Err(DmgrError::internal(format!(
                "unsupported shard hash {:?}",
                self.hash
            )));
        }
        Ok(())
    }
}

/// The immutable schema document of one dataset.
///
/// The fingerprint of this document (in canonical JSON form) gates merge
/// compatibility; widening a text field or growing a canonical jagged
/// maximum produces a new fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDocument {
    pub key_schema: Vec<KeyField>,
    pub key_order: Vec<String>,
    pub dtype_descr: Vec<FieldSpec>,
    pub part_config: PartConfig,
    pub quantization: BTreeMap<String, f64>,
    pub jagged: BTreeMap<String, JaggedSpec>,
    pub encryption: EncryptionPolicy,
}

impl SchemaDocument {
    /// Canonical JSON bytes, the fingerprinted form.
    pub fn canonical_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Look up a key field by name.
    #[must_use]
    pub fn key_field(&self, name: &str) -> Option<&KeyField> {
        self.key_schema.iter().find(|k| k.name == name)
    }

    /// Look up a data field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.dtype_descr.iter().find(|f| f.name == name)
    }

    /// Structural validation of the document as a whole.
    pub fn validate(&self) -> Result<()> {
        for k in &self.key_schema {
            if !is_valid_identifier(&k.name) {
                return Err(DmgrError::InvalidKeyValue(format!(
                    "key name {:?} is not a valid identifier",
                    k.name
                )));
            }
        }
        if self.key_order.len() != self.key_schema.len() {
            return Err(DmgrError::InvalidKeyValue(format!(
                "key_order lists {} names but key_schema declares {}",
                self.key_order.len(),
                self.key_schema.len()
            )));
        }
        for name in &self.key_order {
            let field = self.key_field(name).ok_or_else(|| {
                DmgrError::InvalidKeyValue(format!("key_order names undeclared key {name:?}"))
            })?;
            if field.ktype == KeyType::Real {
                let scale = self.quantization.get(name).copied().ok_or_else(|| {
                    DmgrError::InvalidKeyValue(format!("REAL key {name:?} has no quantization"))
                })?;
                if !(scale.is_finite() && scale > 0.0) {
                    return Err(DmgrError::InvalidKeyValue(format!(
                        "quantization scale for {name:?} must be positive and finite, got {scale}"
                    )));
                }
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for f in &self.dtype_descr {
            if !is_valid_identifier(&f.name) {
                return Err(DmgrError::SchemaMismatch(format!(
                    "field name {:?} is not a valid identifier",
                    f.name
                )));
            }
            if !seen.insert(&f.name) {
                return Err(DmgrError::SchemaMismatch(format!(
                    "duplicate field name {:?}",
                    f.name
                )));
            }
        }
        for (name, spec) in &self.jagged {
            let field = self.field(name).ok_or_else(|| {
                DmgrError::SchemaMismatch(format!("jagged spec names unknown field {name:?}"))
            })?;
            if spec.vary_dims.is_empty() {
                return Err(DmgrError::SchemaMismatch(format!(
                    "jagged field {name:?} declares no vary dims"
                )));
            }
            let mut prev = None;
            for &dim in &spec.vary_dims {
                if dim >= field.shape.len() {
                    return Err(DmgrError::SchemaMismatch(format!(
                        "jagged field {name:?} vary dim {dim} exceeds rank {}",
                        field.shape.len()
                    )));
                }
                if prev.is_some_and(|p| dim <= p) {
                    return Err(DmgrError::SchemaMismatch(format!(
                        "jagged field {name:?} vary dims must be strictly increasing"
                    )));
                }
                prev = Some(dim);
            }
        }
        if self.encryption.require_encryption && self.encryption.mode == EncryptionMode::None {
            return Err(DmgrError::internal(
                "encryption required but mode is none".to_owned(),
            ));
        }
        Ok(())
    }
}
