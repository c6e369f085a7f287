//! The canonical-dtype registry.
//!
//! Holds the live schema document for one dataset. Before the first seal
//! the canonical jagged maxima and text widths grow with every observed
//! row; the first seal locks them. After lock the only permitted mutation
//! is widening a text field, which dirties the document so the caller can
//! persist the new fingerprint atomically with the widening batch.

use std::collections::BTreeMap;

use dmgr_error::{DmgrError, Result};
use dmgr_types::{BaseDtype, Cell, SchemaDocument};

use crate::canon::{prepare_row, PreparedRow};

/// Live schema state for one open dataset.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    doc: SchemaDocument,
    locked: bool,
    dirty: bool,
}

impl SchemaRegistry {
    /// Wrap a validated document. `locked` reflects persisted state: true
    /// once any part has ever been sealed for this dataset.
    pub fn new(doc: SchemaDocument, locked: bool) -> Result<Self> {
        doc.validate()?;
        Ok(Self {
            doc,
            locked,
            dirty: false,
        })
    }

    #[must_use]
    pub const fn doc(&self) -> &SchemaDocument {
        &self.doc
    }

    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.locked
    }

    /// Validate one row against the current canonical dtype.
    pub fn prepare_row(&self, row: BTreeMap<String, Cell>) -> Result<PreparedRow> {
        prepare_row(&self.doc, self.locked, row)
    }

    /// Fold one prepared row's observations into the canonical maxima.
    ///
    /// Unlocked: jagged vary-dim extents and text widths both grow.
    /// Locked: only text widths grow (the widening path); vary overflow was
    /// already rejected by [`Self::prepare_row`].
    pub fn absorb(&mut self, row: &PreparedRow) -> Result<()> {
        for (fi, cell) in row.cells.iter().enumerate() {
            let spec = self
                .doc
                .dtype_descr
                .get(fi)
                .ok_or_else(|| DmgrError::internal("prepared row wider than dtype"))?;
            let name = spec.name.clone();

            if !self.locked {
                let vary = self.doc.jagged.get(&name).map(|j| j.vary_dims.clone());
                for dim in vary.unwrap_or_default() {
                    let observed = cell.extents.get(dim).copied().unwrap_or(0);
                    let canon = &mut self.doc.dtype_descr[fi].shape[dim];
                    if observed > *canon {
                        *canon = observed;
                        self.dirty = true;
                    }
                }
            }

            if let BaseDtype::Utf8 { max_bytes } = self.doc.dtype_descr[fi].dtype {
                if cell.max_text_bytes > max_bytes {
                    self.doc.dtype_descr[fi].dtype = BaseDtype::Utf8 {
                        max_bytes: cell.max_text_bytes,
                    };
                    self.dirty = true;
                }
            }
        }
        Ok(())
    }

    /// Lock the canonical dtype. Idempotent; first call dirties the
    /// document so the lock persists with the first sealed part.
    pub fn lock(&mut self) {
        if !self.locked {
            self.locked = true;
            self.dirty = true;
        }
    }

    /// Whether the document changed since the last [`Self::take_dirty`].
    /// A true value obliges the caller to persist the document (and its
    /// new fingerprint) in the same transaction as the triggering batch.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clear and return the dirty flag, once persistence has committed.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmgr_types::schema_doc::{
        EncryptionPolicy, FieldSpec, JaggedSpec, KeyField, PartConfig,
    };
    use dmgr_types::KeyType;

    fn doc() -> SchemaDocument {
        SchemaDocument {
            key_schema: vec![KeyField {
                name: "run".into(),
                ktype: KeyType::Integer,
            }],
            key_order: vec!["run".into()],
            dtype_descr: vec![
                FieldSpec {
                    name: "seq".into(),
                    dtype: BaseDtype::Int32,
                    shape: vec![0],
                },
                FieldSpec {
                    name: "tag".into(),
                    dtype: BaseDtype::Utf8 { max_bytes: 1 },
                    shape: vec![],
                },
            ],
            part_config: PartConfig::default(),
            quantization: BTreeMap::new(),
            jagged: [(
                "seq".to_owned(),
                JaggedSpec {
                    vary_dims: vec![0],
                },
            )]
            .into_iter()
            .collect(),
            encryption: EncryptionPolicy::default(),
        }
    }

    fn row(seq: &[i64], tag: &str) -> BTreeMap<String, Cell> {
        [
            (
                "seq".to_owned(),
                Cell::List(seq.iter().map(|&v| Cell::Int(v)).collect()),
            ),
            ("tag".to_owned(), Cell::Text(tag.to_owned())),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn maxima_grow_until_lock() {
        let mut reg = SchemaRegistry::new(doc(), false).unwrap();
        let r1 = reg.prepare_row(row(&[1, 2], "a")).unwrap();
        reg.absorb(&r1).unwrap();
        assert_eq!(reg.doc().dtype_descr[0].shape, vec![2]);

        let r2 = reg.prepare_row(row(&[1, 2, 3, 4], "a")).unwrap();
        reg.absorb(&r2).unwrap();
        assert_eq!(reg.doc().dtype_descr[0].shape, vec![4]);
        assert!(reg.take_dirty());

        reg.lock();
        assert!(reg.take_dirty());
        let err = reg.prepare_row(row(&[1, 2, 3, 4, 5], "a")).unwrap_err();
        assert!(matches!(err, DmgrError::DataExceedsCanon(_)));
        // Canonical shape never shrinks, and shorter rows stay fine.
        assert!(reg.prepare_row(row(&[], "a")).is_ok());
    }

    #[test]
    fn text_widens_even_after_lock() {
        let mut reg = SchemaRegistry::new(doc(), true).unwrap();
        let r = reg.prepare_row(row(&[], "wide-tag")).unwrap();
        reg.absorb(&r).unwrap();
        assert_eq!(
            reg.doc().dtype_descr[1].dtype,
            BaseDtype::Utf8 { max_bytes: 8 }
        );
        assert!(reg.take_dirty());
        assert!(!reg.take_dirty(), "dirty flag is take-once");
    }

    #[test]
    fn widening_changes_canonical_json() {
        let mut reg = SchemaRegistry::new(doc(), true).unwrap();
        let before = reg.doc().canonical_json().unwrap();
        let r = reg.prepare_row(row(&[], "abc")).unwrap();
        reg.absorb(&r).unwrap();
        let after = reg.doc().canonical_json().unwrap();
        assert_ne!(before, after);
    }
}
