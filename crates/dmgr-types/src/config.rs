//! Engine configuration.
//!
//! A single record governs one dataset root. No environment variables
//! affect correctness; everything operational lives here.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::schema_doc::{EncryptionMode, JaggedSpec};

/// Configuration for opening or creating a dataset root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Dataset root directory; catalog, staging, parts, locks, and logs all
    /// live underneath it.
    pub db_root: PathBuf,
    /// Rows per sealed part.
    pub part_rows: u64,
    /// In-memory buffer ceiling per subset, in MiB; beyond it rows spill to
    /// the staging queue.
    pub chunk_mb: f64,
    pub compression: Option<String>,
    pub compression_opts: Option<serde_json::Value>,
    /// Per-REAL-key scale factors for identity quantization.
    pub quantization: BTreeMap<String, f64>,
    /// Jagged declarations per field.
    pub jagged: BTreeMap<String, JaggedSpec>,
    pub encryption_mode: EncryptionMode,
    pub require_encryption: bool,
    /// When set, every accepted row goes through the durable staging queue
    /// before compaction, so a crashed writer loses nothing.
    pub durable_staging: bool,
    pub enforce_posix_perms: bool,
    pub advisory_locking: bool,
    pub tamper_chain_enabled: bool,
    pub audit_log_enabled: bool,
    pub data_owner_user: Option<String>,
    pub data_owner_group: Option<String>,
    /// Override for the lock directory; point it at memory-backed storage
    /// so stale locks cannot survive a host crash.
    pub lock_dir: Option<PathBuf>,
    pub key_rotation_days: u32,
    /// Staging claims older than this are reclaimed.
    pub stale_claim_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_root: PathBuf::new(),
            part_rows: 100_000,
            chunk_mb: 8.0,
            compression: None,
            compression_opts: None,
            quantization: BTreeMap::new(),
            jagged: BTreeMap::new(),
            encryption_mode: EncryptionMode::None,
            require_encryption: false,
            durable_staging: false,
            enforce_posix_perms: false,
            advisory_locking: true,
            tamper_chain_enabled: false,
            audit_log_enabled: false,
            data_owner_user: None,
            data_owner_group: None,
            lock_dir: None,
            key_rotation_days: 90,
            stale_claim_secs: 300,
        }
    }
}

impl StoreConfig {
    /// Configuration rooted at `db_root` with defaults everywhere else.
    #[must_use]
    pub fn new(db_root: impl Into<PathBuf>) -> Self {
        Self {
            db_root: db_root.into(),
            ..Self::default()
        }
    }

    /// The spill threshold in bytes.
    #[must_use]
    pub fn chunk_bytes(&self) -> usize {
        (self.chunk_mb * 1024.0 * 1024.0).max(0.0) as usize
    }

    /// Directory that hosts lock files: `lock_dir` override or
    /// `<db_root>/locks`.
    #[must_use]
    pub fn effective_lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| self.db_root.join("locks"))
    }
}
