//! Append-only audit log.
//!
//! JSON lines under `logs/audit.log`, fsynced per record. Details are
//! redacted at the call sites: uuids, hashes, and counts only — never raw
//! key bytes, nonces, or tags.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use dmgr_types::now_epoch_us;
use tracing::warn;

/// Audit sink for one dataset root. Disabled sinks drop records.
#[derive(Debug)]
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    /// Create the sink; `enabled` comes from configuration.
    #[must_use]
    pub fn new(dataset_root: &Path, enabled: bool) -> Self {
        Self {
            path: enabled.then(|| dataset_root.join("logs").join("audit.log")),
        }
    }

    /// Append one record. Failures are reported to tracing but never fail
    /// the operation being audited.
    pub fn record(&self, op: &str, detail: serde_json::Value) {
        let Some(path) = &self.path else { return };
        let line = serde_json::json!({
            "ts_us": now_epoch_us(),
            "op": op,
            "detail": detail,
        });
        let append = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            let mut buf = line.to_string().into_bytes();
            buf.push(b'\n');
            file.write_all(&buf)?;
            file.sync_data()
        };
        if let Err(err) = append() {
            warn!(op, error = %err, "audit append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_log_writes_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = AuditLog::new(dir.path(), false);
        log.record("seal", serde_json::json!({"n": 1}));
        assert!(!dir.path().join("logs/audit.log").exists());
    }

    #[test]
    fn records_append_as_json_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = AuditLog::new(dir.path(), true);
        log.record("seal", serde_json::json!({"n": 1}));
        log.record("gc", serde_json::json!({"removed": 2}));

        let text = std::fs::read_to_string(dir.path().join("logs/audit.log")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["op"], "seal");
        assert_eq!(first["detail"]["n"], 1);
        assert!(first["ts_us"].as_i64().unwrap() > 0);
    }
}
