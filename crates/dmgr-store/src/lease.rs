//! Advisory leases.
//!
//! A lease is an exclusively flocked file under the lock directory. The
//! dataset lease is exclusive against all writers (GC, fsck, merge); a
//! subset lease serializes seals within one writer-group. Guards release
//! on every exit path because release happens in `Drop`.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use dmgr_error::{DmgrError, Result};
use tracing::trace;
use uuid::Uuid;

/// Path of the dataset lease file.
#[must_use]
pub fn dataset_lock_path(lock_dir: &Path, alias: &str) -> PathBuf {
    lock_dir.join(format!("{alias}.lock"))
}

/// Path of a subset lease file.
#[must_use]
pub fn subset_lock_path(lock_dir: &Path, subset_uuid: Uuid) -> PathBuf {
    lock_dir.join("subsets").join(format!("{subset_uuid}.lock"))
}

/// An exclusively held advisory lease. Dropping it releases the lock.
#[derive(Debug)]
pub struct Lease {
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    path_to_remove: PathBuf,
    path: PathBuf,
}

impl Lease {
    /// Acquire an exclusive, non-blocking lease on `path`, creating the
    /// lock file (and its directory) if needed.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        #[cfg(unix)]
        {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(path)?;
            let lock = nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusiveNonblock)
                .map_err(|(_, errno)| {
                    DmgrError::LeaseDenied(format!(
                        "{}: flock failed: {errno}",
                        path.display()
                    ))
                })?;
            trace!(path = %path.display(), "lease acquired");
            Ok(Self {
                _lock: lock,
                path: path.to_path_buf(),
            })
        }

        #[cfg(not(unix))]
        {
            // Portable fallback: exclusive creation is the lock. Stale
            // files from a crashed process must be cleared by the operator
            // or a memory-backed lock_dir.
            match OpenOptions::new().create_new(true).write(true).open(path) {
                Ok(_) => {
                    trace!(path = %path.display(), "lease acquired");
                    Ok(Self {
                        path_to_remove: path.to_path_buf(),
                        path: path.to_path_buf(),
                    })
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Err(
                    DmgrError::LeaseDenied(format!("{}: lock file exists", path.display())),
                ),
                Err(err) => Err(err.into()),
            }
        }
    }

    /// The lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(not(unix))]
impl Drop for Lease {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path_to_remove);
    }
}
