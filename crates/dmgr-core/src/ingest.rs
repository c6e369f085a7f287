//! The ingest pipeline: normalize → buffer → spill → claim → seal →
//! publish → record.
//!
//! Rows accumulate per subset in memory until `part_rows` triggers a seal
//! or `chunk_mb` forces a spill into the durable staging queue. In
//! durable mode every accepted row goes through staging first and a
//! compactor claims prefixes by token, deleting them only after the
//! catalog transaction commits. Either route produces byte-identical
//! parts, which is what makes the content hash route-independent.

use std::collections::BTreeMap;

use dmgr_catalog::parts::{publish_part, record_batch, NewBatch, NewPart, PublishOutcome};
use dmgr_catalog::{ddl, subsets};
use dmgr_error::{DmgrError, Result};
use dmgr_hash::content_hash_with_spec;
use dmgr_identity::{KeyNormalizer, NormalizedKeys};
use dmgr_schema::{PreparedRow, RowBlockBuilder};
use dmgr_staging::payload::{self, StagedPayload};
use dmgr_store::{subset_lock_path, write_part, Lease, PartAttributes};
use dmgr_types::schema_doc::{BaseDtype, SchemaDocument};
use dmgr_types::{now_epoch_us, Cell, KeyValue};
use tracing::{debug, info_span};
use uuid::Uuid;

use crate::dataset::Dataset;

/// How long a `*.tmp` must sit before the publish-path sweep removes it.
const TMP_SWEEP_HORIZON: std::time::Duration = std::time::Duration::from_secs(3600);

/// In-memory accumulation for one subset.
pub(crate) struct SubsetBuffer {
    pub(crate) keys: NormalizedKeys,
    pub(crate) rows: Vec<PreparedRow>,
    pub(crate) est_bytes: usize,
}

/// What happened to one accepted row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Held in the in-memory buffer.
    Buffered,
    /// Persisted to the staging queue.
    Staged,
    /// The row tipped one or more parts over the threshold.
    Sealed(Vec<SealedPart>),
}

/// One sealed-and-published part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPart {
    pub part_uuid: Uuid,
    pub subset_uuid: Uuid,
    pub content_hash: String,
    pub n_rows: u64,
    pub batch_id: String,
    /// True when the catalog already held this `(subset, content_hash)`
    /// and publication was a no-op.
    pub deduplicated: bool,
}

impl Dataset {
    /// Accept one row for the subset identified by `keys`.
    pub fn add(
        &mut self,
        keys: &BTreeMap<String, KeyValue>,
        row: BTreeMap<String, Cell>,
    ) -> Result<AddOutcome> {
        let nk = KeyNormalizer::new(self.registry.doc()).normalize(keys)?;
        let prepared = self.registry.prepare_row(row)?;
        self.registry.absorb(&prepared)?;

        if self.config.durable_staging {
            let frame = payload::encode(&StagedPayload {
                subset_keys: subset_keys_of(&nk),
                rows: vec![row_map(self.registry.doc(), &prepared)],
                is_group: false,
            });
            self.staging
                .enqueue(nk.subset_uuid, 1, now_epoch_us(), &frame)?;
            if self.staging.pending_rows(nk.subset_uuid)? >= self.part_rows() {
                let sealed = self.compact_staged(nk.subset_uuid, false)?;
                if !sealed.is_empty() {
                    return Ok(AddOutcome::Sealed(sealed));
                }
            }
            return Ok(AddOutcome::Staged);
        }

        let subset_uuid = nk.subset_uuid;
        let est = prepared.est_bytes;
        let part_rows = self.part_rows();
        let buffer = self
            .buffers
            .entry(subset_uuid)
            .or_insert_with(|| SubsetBuffer {
                keys: nk,
                rows: Vec::new(),
                est_bytes: 0,
            });
        buffer.rows.push(prepared);
        buffer.est_bytes += est;

        if buffer.rows.len() as i64 >= part_rows {
            let sealed = self.seal_subset(subset_uuid)?;
            return Ok(AddOutcome::Sealed(sealed));
        }
        if buffer.est_bytes >= self.config.chunk_bytes() {
            self.spill_buffer(subset_uuid)?;
            return Ok(AddOutcome::Staged);
        }
        Ok(AddOutcome::Buffered)
    }

    /// Seal whatever this subset has accumulated, memory and staging both,
    /// regardless of thresholds. Used by explicit flushes.
    pub fn seal_subset_now(&mut self, subset_uuid: Uuid) -> Result<Vec<SealedPart>> {
        if self.buffers.contains_key(&subset_uuid) {
            self.spill_buffer(subset_uuid)?;
        }
        self.compact_staged(subset_uuid, true)
    }

    /// Flush every buffer and compact all staged rows. Returns the parts
    /// sealed along the way.
    pub fn flush(&mut self) -> Result<Vec<SealedPart>> {
        let buffered: Vec<Uuid> = self.buffers.keys().copied().collect();
        for subset_uuid in buffered {
            self.spill_buffer(subset_uuid)?;
        }
        let mut sealed = Vec::new();
        loop {
            let hot = self.staging.hot_subsets(16)?;
            if hot.is_empty() {
                break;
            }
            for subset_uuid in hot {
                sealed.extend(self.compact_staged(subset_uuid, true)?);
            }
        }
        Ok(sealed)
    }

    /// Shutdown drain: flush buffers, then compact hot subsets until the
    /// queue is empty or the time budget elapses.
    pub fn drain(&mut self, budget: std::time::Duration) -> Result<Vec<SealedPart>> {
        let deadline = std::time::Instant::now() + budget;
        let buffered: Vec<Uuid> = self.buffers.keys().copied().collect();
        for subset_uuid in buffered {
            self.spill_buffer(subset_uuid)?;
        }
        let mut sealed = Vec::new();
        'outer: loop {
            let hot = self.staging.hot_subsets(16)?;
            if hot.is_empty() {
                break;
            }
            for subset_uuid in hot {
                if std::time::Instant::now() >= deadline {
                    debug!("drain time budget elapsed with staged rows remaining");
                    break 'outer;
                }
                sealed.extend(self.compact_staged(subset_uuid, true)?);
            }
        }
        Ok(sealed)
    }

    /// Release staging claims older than `age`.
    pub fn reclaim_stale_claims(&mut self, age: std::time::Duration) -> Result<usize> {
        self.staging.reclaim_stale(age, now_epoch_us())
    }

    fn part_rows(&self) -> i64 {
        i64::try_from(self.config.part_rows).unwrap_or(i64::MAX)
    }

    /// Seal a full buffer. If the subset has staged rows they are older
    /// and must seal first, so the buffer is pushed behind them.
    fn seal_subset(&mut self, subset_uuid: Uuid) -> Result<Vec<SealedPart>> {
        if self.staging.pending_rows(subset_uuid)? > 0 {
            self.spill_buffer(subset_uuid)?;
            return self.compact_staged(subset_uuid, false);
        }
        let Some(buffer) = self.buffers.remove(&subset_uuid) else {
            return Ok(Vec::new());
        };
        let sealed = self.seal_rows(&buffer.keys, buffer.rows, None)?;
        Ok(vec![sealed])
    }

    /// Move one buffer into the staging queue as a single group frame.
    fn spill_buffer(&mut self, subset_uuid: Uuid) -> Result<()> {
        let Some(buffer) = self.buffers.remove(&subset_uuid) else {
            return Ok(());
        };
        if buffer.rows.is_empty() {
            return Ok(());
        }
        let doc = self.registry.doc();
        let frame = payload::encode(&StagedPayload {
            subset_keys: subset_keys_of(&buffer.keys),
            rows: buffer.rows.iter().map(|r| row_map(doc, r)).collect(),
            is_group: true,
        });
        self.staging.enqueue(
            subset_uuid,
            buffer.rows.len() as i64,
            now_epoch_us(),
            &frame,
        )?;
        debug!(subset = %subset_uuid, rows = buffer.rows.len(), "buffer spilled to staging");
        Ok(())
    }

    /// Claim, decode, and seal staged prefixes for one subset until the
    /// queue cannot satisfy another claim.
    fn compact_staged(&mut self, subset_uuid: Uuid, allow_partial: bool) -> Result<Vec<SealedPart>> {
        let mut sealed = Vec::new();
        loop {
            let token = Uuid::new_v4().to_string();
            let groups = self.staging.select_and_claim_prefix(
                subset_uuid,
                self.part_rows(),
                &token,
                allow_partial,
                now_epoch_us(),
            )?;
            if groups.is_empty() {
                break;
            }

            let compact = (|| -> Result<SealedPart> {
                let mut nk: Option<NormalizedKeys> = None;
                let mut rows = Vec::new();
                for group in &groups {
                    let decoded = payload::decode(&group.payload)?;
                    if nk.is_none() {
                        let keys: BTreeMap<String, KeyValue> =
                            decoded.subset_keys.iter().cloned().collect();
                        nk = Some(
                            KeyNormalizer::new(self.registry.doc()).normalize(&keys)?,
                        );
                    }
                    for row in decoded.rows {
                        let prepared = self.registry.prepare_row(row)?;
                        self.registry.absorb(&prepared)?;
                        rows.push(prepared);
                    }
                }
                let nk = nk.ok_or_else(|| DmgrError::internal("claimed empty group set"))?;
                if nk.subset_uuid != subset_uuid {
                    return Err(DmgrError::IdentityConflict(format!(
                        "staged keys derive subset {}, queue row says {subset_uuid}",
                        nk.subset_uuid
                    )));
                }
                self.seal_rows(&nk, rows, Some(&token))
            })();

            match compact {
                Ok(part) => sealed.push(part),
                Err(err) => {
                    let _ = self.staging.release_claim(&token);
                    return Err(err);
                }
            }
        }
        Ok(sealed)
    }

    /// The seal: subset lease → hash → part file → one catalog
    /// transaction (schema persistence, subset row, part row, change
    /// feed) → staging cleanup.
    fn seal_rows(
        &mut self,
        nk: &NormalizedKeys,
        rows: Vec<PreparedRow>,
        staging_token: Option<&str>,
    ) -> Result<SealedPart> {
        let span = info_span!("seal", subset = %nk.subset_uuid, rows = rows.len());
        let _guard = span.enter();

        let _subset_lease = if self.config.advisory_locking {
            Some(Lease::acquire(&subset_lock_path(
                &self.config.effective_lock_dir(),
                nk.subset_uuid,
            ))?)
        } else {
            None
        };

        self.registry.lock();
        let doc = self.registry.doc().clone();
        let persist_doc = self.registry.is_dirty().then(|| doc.clone());

        let n_rows = rows.len() as u64;
        let stats = compute_stats(&doc, &rows);
        let mut builder = RowBlockBuilder::new(&doc);
        for row in rows {
            builder.push(row);
        }
        let block = builder.build()?;
        let content_hash = content_hash_with_spec(&block, &doc.dtype_descr, &doc.jagged)?;

        // Dedup pre-check keeps the common duplicate path from writing a
        // file at all; the UNIQUE constraint still covers the race.
        let pre_existing = dmgr_catalog::parts::part_by_hash(
            self.catalog.conn(),
            nk.subset_uuid,
            &content_hash,
        )?;

        let created_at = now_epoch_us();
        let mut written_relpath = None;
        let part_uuid = match &pre_existing {
            Some(existing) => existing.part_uuid,
            None => {
                let part_uuid = Uuid::new_v4();
                let attrs = PartAttributes {
                    part_uuid,
                    subset_uuid: nk.subset_uuid,
                    dataset_uuid: self.info.dataset_uuid,
                    created_at_epoch: created_at,
                    n_rows,
                    scheme_version: self.info.scheme.version,
                    content_hash: content_hash.clone(),
                    subset_keys_json: nk.raw_keys_json()?,
                    dtype_descr: doc.dtype_descr.clone(),
                    jagged: doc.jagged.clone(),
                };
                let handle = write_part(
                    &self.root,
                    &self.info.scheme,
                    &attrs,
                    &block,
                    TMP_SWEEP_HORIZON,
                )?;
                written_relpath = Some((handle.file_relpath, handle.plaintext_size));
                part_uuid
            }
        };

        let bid = Uuid::new_v4().to_string();
        let dataset_uuid = self.info.dataset_uuid;
        let producer_id = self.info.producer_id;
        let scheme_version = self.info.scheme.version;
        let stored_fingerprint = self.info.schema_fingerprint.clone();
        let new_part = written_relpath.as_ref().map(|(relpath, size)| NewPart {
            part_uuid,
            subset_uuid: nk.subset_uuid,
            n_rows: n_rows as i64,
            scheme_version,
            file_relpath: relpath.clone(),
            content_hash: content_hash.clone(),
            producer_id,
            batch_id: bid.clone(),
            created_at_epoch: created_at,
            part_stats_json: Some(stats.to_string()),
            enc_version: 0,
            key_ref: None,
            nonce: None,
            tag: None,
            plaintext_size: *size as i64,
        });

        let committed = self.catalog.with_immediate_tx(|tx| {
            let fingerprint = match &persist_doc {
                Some(d) => {
                    let fp = ddl::update_schema_doc(tx, dataset_uuid, d)?;
                    ddl::meta_set(tx, &ddl::schema_locked_key(dataset_uuid), "1")?;
                    fp
                }
                None => stored_fingerprint.clone(),
            };
            subsets::get_or_create_subset(tx, dataset_uuid, nk, created_at)?;
            let deduplicated = match &new_part {
                Some(part) => match publish_part(tx, part)? {
                    PublishOutcome::Inserted => {
                        subsets::add_rows(tx, nk.subset_uuid, part.n_rows)?;
                        false
                    }
                    PublishOutcome::AlreadyPresent { .. } => true,
                },
                None => true,
            };
            record_batch(
                tx,
                &NewBatch {
                    bid: bid.clone(),
                    producer_id,
                    created_at_epoch: created_at,
                    schema_fingerprint: fingerprint.clone(),
                    parts: vec![(part_uuid, content_hash.clone())],
                },
            )?;
            Ok((fingerprint, deduplicated))
        });

        let (fingerprint, deduplicated) = match committed {
            Ok(out) => out,
            Err(err) => {
                // The catalog saw none of this; remove the just-written
                // file so the failed seal is a no-op on disk too.
                if let Some((relpath, _)) = &written_relpath {
                    let _ = std::fs::remove_file(self.root.join(relpath));
                }
                if let Some(token) = staging_token {
                    let _ = self.staging.release_claim(token);
                }
                return Err(err);
            }
        };

        if self.registry.take_dirty() {
            self.info.schema = doc;
            self.info.schema_fingerprint = fingerprint;
        }
        if deduplicated {
            if let Some((relpath, _)) = &written_relpath {
                let _ = std::fs::remove_file(self.root.join(relpath));
            }
        }
        if let Some(token) = staging_token {
            self.staging.delete_claimed(token)?;
        }

        self.audit.record(
            "seal",
            serde_json::json!({
                "subset_uuid": nk.subset_uuid.to_string(),
                "part_uuid": part_uuid.to_string(),
                "content_hash": content_hash,
                "n_rows": n_rows,
                "batch_id": bid,
                "deduplicated": deduplicated,
            }),
        );

        Ok(SealedPart {
            part_uuid,
            subset_uuid: nk.subset_uuid,
            content_hash,
            n_rows,
            batch_id: bid,
            deduplicated,
        })
    }
}

/// Raw key pairs for the staging frame.
fn subset_keys_of(nk: &NormalizedKeys) -> Vec<(String, KeyValue)> {
    use dmgr_identity::KeyIdentityCol;
    nk.cols
        .iter()
        .map(|col| match col {
            KeyIdentityCol::Real { name, raw, .. } => (name.clone(), KeyValue::Real(*raw)),
            KeyIdentityCol::Integer { name, v } => (name.clone(), KeyValue::Integer(*v)),
            KeyIdentityCol::Boolean { name, v } => (name.clone(), KeyValue::Boolean(*v)),
            KeyIdentityCol::Text { name, v } => (name.clone(), KeyValue::Text(v.clone())),
        })
        .collect()
}

/// Rebuild the field-name → cell map of one prepared row.
fn row_map(doc: &SchemaDocument, row: &PreparedRow) -> BTreeMap<String, Cell> {
    doc.dtype_descr
        .iter()
        .zip(&row.cells)
        .map(|(spec, cell)| (spec.name.clone(), cell.value.clone()))
        .collect()
}

/// Per-part statistics recorded in `part_stats_json`: min/max for scalar
/// numeric fields, max observed extents for jagged fields.
fn compute_stats(doc: &SchemaDocument, rows: &[PreparedRow]) -> serde_json::Value {
    let mut fields = serde_json::Map::new();
    for (fi, spec) in doc.dtype_descr.iter().enumerate() {
        let mut entry = serde_json::Map::new();
        if spec.shape.is_empty() {
            match spec.dtype {
                BaseDtype::Float32 | BaseDtype::Float64 => {
                    let mut min = f64::INFINITY;
                    let mut max = f64::NEG_INFINITY;
                    let mut seen = false;
                    for row in rows {
                        if let Some(Cell::Real(v)) = row.cells.get(fi).map(|c| &c.value) {
                            if v.is_nan() {
                                continue;
                            }
                            min = min.min(*v);
                            max = max.max(*v);
                            seen = true;
                        }
                    }
                    if seen {
                        entry.insert("min".to_owned(), serde_json::json!(min));
                        entry.insert("max".to_owned(), serde_json::json!(max));
                    }
                }
                BaseDtype::Utf8 { .. } | BaseDtype::Bool => {}
                _ => {
                    let mut min = i64::MAX;
                    let mut max = i64::MIN;
                    let mut seen = false;
                    for row in rows {
                        if let Some(Cell::Int(v)) = row.cells.get(fi).map(|c| &c.value) {
                            min = min.min(*v);
                            max = max.max(*v);
                            seen = true;
                        }
                    }
                    if seen {
                        entry.insert("min".to_owned(), serde_json::json!(min));
                        entry.insert("max".to_owned(), serde_json::json!(max));
                    }
                }
            }
        }
        if let Some(jagged) = doc.jagged.get(&spec.name) {
            let max_extents: Vec<usize> = jagged
                .vary_dims
                .iter()
                .map(|&dim| {
                    rows.iter()
                        .filter_map(|r| r.cells.get(fi).and_then(|c| c.extents.get(dim)))
                        .copied()
                        .max()
                        .unwrap_or(0)
                })
                .collect();
            entry.insert("max_extent".to_owned(), serde_json::json!(max_extents));
        }
        if !entry.is_empty() {
            fields.insert(spec.name.clone(), serde_json::Value::Object(entry));
        }
    }
    serde_json::json!({
        "n_rows": rows.len(),
        "fields": fields,
    })
}
