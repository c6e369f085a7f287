//! Key values and row cells.
//!
//! A key dict is heterogeneous; [`KeyValue`] is the tagged variant resolved
//! against the declared key schema before any identity or hash operation.
//! [`Cell`] is the corresponding data-plane value: scalars plus arbitrarily
//! nested lists for jagged array fields.

use serde::{Deserialize, Serialize};

/// Logical type of a subset key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyType {
    Real,
    Integer,
    Text,
    Boolean,
}

impl KeyType {
    /// Short name used in error messages and the relational DDL.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Real => "REAL",
            Self::Integer => "INTEGER",
            Self::Text => "TEXT",
            Self::Boolean => "BOOLEAN",
        }
    }
}

/// A user-supplied key value, not yet normalized.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    Real(f64),
    Integer(i64),
    Text(String),
    Boolean(bool),
}

impl KeyValue {
    /// The logical type this value satisfies.
    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        match self {
            Self::Real(_) => KeyType::Real,
            Self::Integer(_) => KeyType::Integer,
            Self::Text(_) => KeyType::Text,
            Self::Boolean(_) => KeyType::Boolean,
        }
    }
}

/// One field value of one row.
///
/// Scalar fields use the scalar variants; array fields (jagged or not) use
/// nested [`Cell::List`] values in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
    List(Vec<Cell>),
}

impl Cell {
    /// Depth of list nesting: 0 for scalars, 1 for a flat list, and so on.
    /// An empty list reports depth 1; deeper empties cannot be distinguished
    /// and are padded by the canonicalizer.
    #[must_use]
    pub fn nesting_depth(&self) -> usize {
        match self {
            Self::List(items) => 1 + items.iter().map(Self::nesting_depth).max().unwrap_or(0),
            _ => 0,
        }
    }
}

/// Whether a name is usable as a key or field identifier.
///
/// Identifiers become relational column names and part attribute keys, so
/// the alphabet is restricted to ASCII `[A-Za-z_][A-Za-z0-9_]*`.
#[must_use]
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_type_roundtrip_names() {
        assert_eq!(KeyType::Real.name(), "REAL");
        assert_eq!(KeyValue::Boolean(true).key_type(), KeyType::Boolean);
    }

    #[test]
    fn nesting_depth() {
        assert_eq!(Cell::Int(3).nesting_depth(), 0);
        assert_eq!(Cell::List(vec![]).nesting_depth(), 1);
        let nested = Cell::List(vec![Cell::List(vec![Cell::Real(1.0)])]);
        assert_eq!(nested.nesting_depth(), 2);
    }

    #[test]
    fn identifier_rules() {
        assert!(is_valid_identifier("lat"));
        assert!(is_valid_identifier("_seq_2"));
        assert!(!is_valid_identifier("2fast"));
        assert!(!is_valid_identifier("bad-name"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("naïve"));
    }
}
