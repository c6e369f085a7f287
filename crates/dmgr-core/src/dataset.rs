//! The dataset handle: open/create a root, own its catalog, staging
//! queue, schema registry, and dataset lease.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use dmgr_catalog::{chain, ddl, subsets, Catalog, DatasetRow, SubsetFilter, SubsetSummary};
use dmgr_error::{DmgrError, Result};
use dmgr_schema::SchemaRegistry;
use dmgr_staging::StagingQueue;
use dmgr_store::{dataset_lock_path, Lease};
use dmgr_types::schema_doc::{EncryptionPolicy, FieldSpec, KeyField, SchemaDocument};
use dmgr_types::{PartConfig, StorageScheme, StoreConfig};
use tracing::info;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::ingest::SubsetBuffer;

/// A writable dataset rooted at `config.db_root`.
///
/// Holding the handle means holding the dataset lease (when advisory
/// locking is on): one writer-group per root.
pub struct Dataset {
    pub(crate) root: PathBuf,
    pub(crate) config: StoreConfig,
    pub(crate) info: DatasetRow,
    pub(crate) catalog: Catalog,
    pub(crate) staging: StagingQueue,
    pub(crate) registry: SchemaRegistry,
    pub(crate) audit: AuditLog,
    pub(crate) buffers: HashMap<Uuid, SubsetBuffer>,
    _dataset_lease: Option<Lease>,
}

impl Dataset {
    /// Open or create the dataset `alias` under `config.db_root`.
    ///
    /// On a fresh root the offered key schema and dtype become the schema
    /// document; on reopen the stored document is authoritative and the
    /// offered one is ignored.
    pub fn open(
        alias: &str,
        key_schema: Vec<KeyField>,
        dtype_descr: Vec<FieldSpec>,
        config: StoreConfig,
    ) -> Result<Self> {
        let root = config.db_root.clone();
        if root.as_os_str().is_empty() {
            return Err(DmgrError::InvalidKeyValue(
                "config.db_root must be set".to_owned(),
            ));
        }
        fs::create_dir_all(&root)?;

        let dataset_lease = if config.advisory_locking {
            let lock_path = dataset_lock_path(&config.effective_lock_dir(), alias);
            Some(Lease::acquire(&lock_path)?)
        } else {
            None
        };

        let doc = build_document(&key_schema, dtype_descr, &config);
        let scheme = StorageScheme::default();

        let mut catalog = Catalog::open_rw(&root.join("catalog.db"))?;
        let tamper = config.tamper_chain_enabled;
        let info = catalog.with_immediate_tx(|tx| {
            let row = ddl::ensure_dataset(tx, alias, &doc, &scheme, true)?;
            subsets::ensure_key_columns(tx, &row.schema)?;
            if tamper {
                chain::enable_tamper_chain(tx)?;
            }
            Ok(row)
        })?;

        let locked = ddl::meta_get(
            catalog.conn(),
            &ddl::schema_locked_key(info.dataset_uuid),
        )?
        .as_deref()
            == Some("1");
        let registry = SchemaRegistry::new(info.schema.clone(), locked)?;

        let mut staging = StagingQueue::open(&root.join("staging.db"))?;
        let reclaimed = staging.reclaim_stale(
            std::time::Duration::from_secs(config.stale_claim_secs),
            dmgr_types::now_epoch_us(),
        )?;
        if reclaimed > 0 {
            info!(reclaimed, alias, "released stale staging claims on open");
        }

        if config.enforce_posix_perms {
            restrict_perms(&root)?;
        }

        let audit = AuditLog::new(&root, config.audit_log_enabled);
        audit.record(
            "open",
            serde_json::json!({
                "alias": alias,
                "dataset_uuid": info.dataset_uuid.to_string(),
            }),
        );

        Ok(Self {
            root,
            config,
            info,
            catalog,
            staging,
            registry,
            audit,
            buffers: HashMap::new(),
            _dataset_lease: dataset_lease,
        })
    }

    /// Dataset root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registry row: uuid, alias, scheme, producer.
    #[must_use]
    pub const fn info(&self) -> &DatasetRow {
        &self.info
    }

    /// The live schema document (reflects unlocked growth and widening).
    #[must_use]
    pub const fn doc(&self) -> &SchemaDocument {
        self.registry.doc()
    }

    /// Read access to the catalog.
    #[must_use]
    pub const fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Mutable catalog access for maintenance tooling and tests.
    pub fn catalog_mut(&mut self) -> &mut Catalog {
        &mut self.catalog
    }

    /// Query subsets with the catalog's filter language.
    pub fn find_subsets(&self, filters: &[SubsetFilter]) -> Result<Vec<SubsetSummary>> {
        subsets::find_subsets(
            self.catalog.conn(),
            self.info.dataset_uuid,
            self.registry.doc(),
            filters,
        )
    }

    /// One subset summary.
    pub fn subset(&self, subset_uuid: Uuid) -> Result<Option<SubsetSummary>> {
        subsets::subset_by_uuid(self.catalog.conn(), subset_uuid)
    }

    /// Soft-delete a subset; its parts go on the next GC.
    pub fn mark_subset_deleted(&mut self, subset_uuid: Uuid) -> Result<()> {
        self.catalog.with_immediate_tx(|tx| {
            subsets::mark_subset_deleted(tx, subset_uuid)?;
            let parts = dmgr_catalog::parts::parts_of_subset(tx, subset_uuid, true)?;
            for part in parts {
                dmgr_catalog::parts::mark_part_deleted(tx, part.part_uuid)?;
            }
            Ok(())
        })?;
        self.audit.record(
            "mark_subset_deleted",
            serde_json::json!({"subset_uuid": subset_uuid.to_string()}),
        );
        Ok(())
    }

    /// Aggregate counters: live subsets, parts, rows, batches.
    pub fn stats(&self) -> Result<dmgr_catalog::DatasetStats> {
        ddl::dataset_stats(self.catalog.conn(), self.info.dataset_uuid)
    }

    /// Tamper-chain head for external anchoring.
    pub fn chain_head(&self) -> Result<Option<String>> {
        chain::chain_head(self.catalog.conn())
    }

    /// Recompute the whole tamper chain.
    pub fn verify_chain(&self) -> Result<dmgr_catalog::ChainReport> {
        chain::verify_chain(self.catalog.conn())
    }
}

/// Assemble the schema document from the user's key/dtype declarations
/// plus the configured quantization, jagged, part, and encryption blocks.
fn build_document(
    key_schema: &[KeyField],
    dtype_descr: Vec<FieldSpec>,
    config: &StoreConfig,
) -> SchemaDocument {
    SchemaDocument {
        key_schema: key_schema.to_vec(),
        key_order: key_schema.iter().map(|k| k.name.clone()).collect(),
        dtype_descr,
        part_config: PartConfig {
            part_rows: config.part_rows,
            compression: config.compression.clone(),
            compression_opts: config.compression_opts.clone(),
        },
        quantization: config.quantization.clone(),
        jagged: config.jagged.clone(),
        encryption: EncryptionPolicy {
            mode: config.encryption_mode,
            require_encryption: config.require_encryption,
            key_rotation_days: config.key_rotation_days,
        },
    }
}

#[cfg(unix)]
fn restrict_perms(root: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(root, fs::Permissions::from_mode(0o700))?;
    for name in ["catalog.db", "staging.db"] {
        let path = root.join(name);
        if path.exists() {
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn restrict_perms(_root: &Path) -> Result<()> {
    Ok(())
}

/// Convenience: a key dict literal for callers and tests.
#[must_use]
pub fn key_dict<I>(entries: I) -> BTreeMap<String, dmgr_types::KeyValue>
where
    I: IntoIterator<Item = (&'static str, dmgr_types::KeyValue)>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect()
}
