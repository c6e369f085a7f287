//! The relational catalog.
//!
//! One SQLite file per dataset root tracks datasets, subsets (with their
//! derived identity columns), immutable parts, the change feed
//! (`batches`/`batch_parts`), the merge log, and the optional tamper
//! chain. Every mutation runs inside an IMMEDIATE transaction retried on
//! busy with bounded exponential backoff.

pub mod chain;
pub mod db;
pub mod ddl;
pub mod parts;
pub mod subsets;

pub use chain::{verify_chain, ChainReport};
pub use db::Catalog;
pub use ddl::{DatasetRow, DatasetStats};
pub use parts::{BatchRow, NewBatch, NewPart, PartRow, PublishOutcome};
pub use subsets::{SubsetFilter, SubsetSummary};
