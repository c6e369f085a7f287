//! Error type shared by every datamgr crate.
//!
//! One enum covers the whole engine so that `?` composes across the
//! identity, schema, store, catalog, staging, and coordinator layers.
//! `Busy` is special: components retry it internally with bounded backoff
//! and only surface it once the retry budget is exhausted.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, DmgrError>;

/// All failure kinds the storage engine can surface.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DmgrError {
    /// Dtype, shape, or base-type conflict against the canonical schema.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A jagged field exceeded the canonical maximum after lock.
    #[error("data exceeds canonical shape: {0}")]
    DataExceedsCanon(String),

    /// Same identity tuple offered with an incompatible snapshot, or a
    /// stored subset whose identity columns disagree with the tuple.
    #[error("identity conflict: {0}")]
    IdentityConflict(String),

    /// Missing key, wrong key type, forbidden text content, or a REAL key
    /// without a quantization scale.
    #[error("invalid key value: {0}")]
    InvalidKeyValue(String),

    /// Recomputed content hash disagrees with the recorded one.
    #[error("content hash mismatch: expected {expected}, got {actual}")]
    ContentHashMismatch { expected: String, actual: String },

    /// Catalog contention outlived the retry budget.
    #[error("catalog busy beyond retry budget")]
    Busy,

    /// An advisory lease could not be acquired.
    #[error("lease denied: {0}")]
    LeaseDenied(String),

    /// Schema fingerprint, storage scheme, quantization, or encryption
    /// policy differ between merge source and destination.
    #[error("merge invariant violated: {0}")]
    MergeInvariantViolated(String),

    /// A part file or staging frame failed structural validation.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Filesystem or sync failure.
    #[error("I/O fault: {0}")]
    Io(#[from] std::io::Error),

    /// Relational engine error that is not a busy condition.
    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Broken internal invariant. Always a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DmgrError {
    /// Construct an [`DmgrError::Internal`] from any message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the underlying SQLite error is a busy/locked condition that
    /// the caller may retry.
    #[must_use]
    pub fn is_retryable_busy(&self) -> bool {
        match self {
            Self::Catalog(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Self::Busy => true,
            _ => false,
        }
    }
}
