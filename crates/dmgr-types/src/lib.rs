//! Core type definitions for the datamgr storage engine.
//!
//! Everything here is pure data: key values and row cells, the immutable
//! schema document, the storage scheme, and the engine configuration.
//! No I/O happens in this crate.

pub mod config;
pub mod keys;
pub mod schema_doc;

pub use config::StoreConfig;
pub use keys::{Cell, KeyType, KeyValue};
pub use schema_doc::{
    BaseDtype, EncryptionMode, EncryptionPolicy, FieldSpec, JaggedSpec, KeyField, PartConfig,
    SchemaDocument, StorageScheme,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as microseconds since the Unix epoch.
///
/// Used for `created_at_epoch` columns and embedded part attributes.
#[must_use]
pub fn now_epoch_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_monotonic_enough() {
        let a = now_epoch_us();
        let b = now_epoch_us();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000_000, "clock looks pre-2020: {a}");
    }
}
