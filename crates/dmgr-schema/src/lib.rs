//! Canonical dtype handling: validation, locking, widening, and the
//! jagged-padding contract that makes part payloads byte-stable.
//!
//! The flow is: [`SchemaRegistry::prepare_row`] validates one row against
//! the current canonical dtype, [`SchemaRegistry::absorb`] grows canonical
//! maxima (jagged extents while unlocked, text widths always), and
//! [`block::RowBlockBuilder`] pads a batch of prepared rows into the
//! columnar [`block::RowBlock`] that the hasher and the part store consume.

pub mod block;
pub mod canon;
pub mod registry;

pub use block::{ColumnData, FieldColumn, MetaColumn, RowBlock, RowBlockBuilder};
pub use canon::{PreparedCell, PreparedRow};
pub use registry::SchemaRegistry;
