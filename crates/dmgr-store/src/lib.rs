//! The part-file store.
//!
//! Parts are immutable byte-sealed files. This crate owns their container
//! encoding, the atomic publish pipeline (`tmp → fsync → rename →
//! fsync(dir)`), stale-tmp sweeping, the sharded relative-path scheme, and
//! the advisory file leases that serialize writers.

pub mod container;
pub mod lease;
pub mod publish;

pub use container::{read_part, PartAttributes};
pub use lease::{dataset_lock_path, subset_lock_path, Lease};
pub use publish::{build_aad, part_relpath, sweep_stale_tmp, write_part, PartHandle};
